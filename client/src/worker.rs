//! The serial pipeline context.
//!
//! All mutable pipeline state (durable queue, session tracker, upload
//! scheduler and backoff state) is owned by a single task running
//! [`Worker::run`], fed by a FIFO command channel. Because only that task
//! touches the state, none of it needs locks or atomics; the single-flight
//! and timer-coalescing guards are plain `bool` fields.
//!
//! Network I/O never runs on this task. A prepared batch (serialized body
//! plus its highest queue id) is handed to a spawned upload task, which
//! posts its outcome back onto the command channel. Every outcome path
//! releases the single-flight flag before the worker goes idle.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::event::{
    EventRecord, LibraryInfo, SESSION_END_EVENT, SESSION_START_EVENT, SPECIAL_PROPERTY,
};
use crate::session::SessionTracker;
use crate::store::{
    EventStore, KEY_OPT_OUT, KEY_PREVIOUS_EVENT_TIME, KEY_PREVIOUS_SESSION_ID, KEY_USER_ID,
};
use crate::uploader::{UploadOutcome, Uploader};

/// Commands marshaled onto the pipeline task.
pub(crate) enum Command {
    LogEvent {
        event_type: String,
        event_properties: Option<Map<String, Value>>,
        api_properties: Option<Map<String, Value>>,
        timestamp: i64,
        check_session: bool,
        reply: Option<oneshot::Sender<Result<i64>>>,
    },
    SetUserId {
        user_id: Option<String>,
    },
    SetUserProperties {
        properties: Map<String, Value>,
        replace: bool,
    },
    SetOptOut {
        opt_out: bool,
    },
    SetOffline {
        offline: bool,
    },
    SetPaused {
        paused: bool,
    },
    Flush {
        done: Option<oneshot::Sender<()>>,
    },
    FlushTick,
    UploadDone {
        outcome: UploadOutcome,
        max_id: i64,
    },
    PendingCount {
        reply: oneshot::Sender<Result<i64>>,
    },
    Shutdown,
}

/// An immutable batch snapshot ready for the network task.
pub(crate) struct PreparedUpload {
    body: String,
    max_id: i64,
}

/// Owns all pipeline state; runs on a single spawned task.
pub(crate) struct Worker {
    config: Config,
    store: EventStore,
    session: SessionTracker,
    uploader: Uploader,
    clock: Arc<dyn Clock>,
    tx: mpsc::Sender<Command>,
    device_id: String,
    user_id: Option<String>,
    user_properties: Map<String, Value>,
    opt_out: bool,
    offline: bool,
    paused: bool,
    uploading: bool,
    flush_scheduled: bool,
    backoff_active: bool,
    backoff_batch_size: i64,
    last_upload_error: Option<String>,
    flush_waiters: Vec<oneshot::Sender<()>>,
    pending_upload: Option<PreparedUpload>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Config,
        store: EventStore,
        session: SessionTracker,
        uploader: Uploader,
        clock: Arc<dyn Clock>,
        tx: mpsc::Sender<Command>,
        device_id: String,
        user_id: Option<String>,
        opt_out: bool,
    ) -> Self {
        let backoff_batch_size = config.max_batch_size;
        Self {
            config,
            store,
            session,
            uploader,
            clock,
            tx,
            device_id,
            user_id,
            user_properties: Map::new(),
            opt_out,
            offline: false,
            paused: false,
            uploading: false,
            flush_scheduled: false,
            backoff_active: false,
            backoff_batch_size,
            last_upload_error: None,
            flush_waiters: Vec::new(),
            pending_upload: None,
        }
    }

    /// Processes commands until shutdown. FIFO order is the ordering
    /// guarantee of the whole pipeline.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            let stop = matches!(command, Command::Shutdown);
            if let Some(upload) = self.handle(command) {
                self.spawn_upload(upload);
            }
            if stop {
                break;
            }
        }
        debug!("pipeline worker stopped");
    }

    /// Applies one command; returns a batch to hand to the network task.
    fn handle(&mut self, command: Command) -> Option<PreparedUpload> {
        match command {
            Command::LogEvent {
                event_type,
                event_properties,
                api_properties,
                timestamp,
                check_session,
                reply,
            } => {
                let result = self.log_event(
                    event_type,
                    event_properties,
                    api_properties,
                    timestamp,
                    check_session,
                );
                if let Err(error) = &result {
                    warn!(%error, "failed to record event");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::SetUserId { user_id } => {
                if let Err(error) = self.store.set_string_value(KEY_USER_ID, user_id.as_deref()) {
                    warn!(%error, "failed to persist user id");
                }
                self.user_id = user_id;
            }
            Command::SetUserProperties {
                properties,
                replace,
            } => {
                if replace {
                    self.user_properties = properties;
                } else {
                    self.user_properties.extend(properties);
                }
            }
            Command::SetOptOut { opt_out } => {
                if let Err(error) = self.store.set_bool_value(KEY_OPT_OUT, opt_out) {
                    warn!(%error, "failed to persist opt-out flag");
                }
                self.opt_out = opt_out;
            }
            Command::SetOffline { offline } => {
                self.offline = offline;
                if !offline {
                    // Connectivity is back: push out whatever queued up.
                    self.begin_upload(true);
                }
            }
            Command::SetPaused { paused } => {
                self.paused = paused;
            }
            Command::Flush { done } => {
                if let Some(done) = done {
                    self.flush_waiters.push(done);
                }
                self.begin_upload(true);
            }
            Command::FlushTick => {
                self.flush_scheduled = false;
                self.begin_upload(true);
            }
            Command::UploadDone { outcome, max_id } => {
                self.apply_outcome(outcome, max_id);
            }
            Command::PendingCount { reply } => {
                let _ = reply.send(self.store.count());
            }
            Command::Shutdown => {
                self.flush_waiters.clear();
            }
        }

        self.pending_upload.take()
    }

    /// Runs the session check, assembles the record, appends it durably and
    /// applies the upload scheduling policy.
    ///
    /// Returns the assigned queue id, or `-1` under opt-out.
    fn log_event(
        &mut self,
        event_type: String,
        event_properties: Option<Map<String, Value>>,
        api_properties: Option<Map<String, Value>>,
        timestamp: i64,
        check_session: bool,
    ) -> Result<i64> {
        if self.opt_out {
            return Ok(-1);
        }

        // Events logged between pause and resume always re-check the
        // session boundary, even when the per-event check is off.
        if check_session || self.paused {
            self.start_new_session_if_needed(timestamp)?;
        }
        if self.session.refresh(timestamp) {
            self.store
                .set_long_value(KEY_PREVIOUS_EVENT_TIME, timestamp)?;
        }

        let record = self.build_record(event_type, event_properties, api_properties, timestamp);
        let payload = serde_json::to_string(&record)?;
        let id = self.store.append(&payload)?;
        let count = self.store.count()?;
        debug!(event_type = %record.event_type, id, "event recorded");

        if count >= self.config.max_event_count {
            let cutoff = self.store.nth_event_id(self.config.eviction_batch_size)?;
            if cutoff >= 0 {
                let removed = self.store.remove_through(cutoff)?;
                debug!(removed, "evicted oldest events to stay under the cap");
            }
        }

        if count % self.config.upload_threshold == 0 && count >= self.config.upload_threshold {
            self.begin_upload(true);
        } else {
            self.schedule_delayed_flush();
        }

        Ok(id)
    }

    /// Opens a new session when none is active or the gap limit was
    /// exceeded, emitting boundary events when enabled.
    fn start_new_session_if_needed(&mut self, timestamp: i64) -> Result<bool> {
        if !self.session.needs_new_session(timestamp) {
            return Ok(false);
        }

        if self.config.track_session_events && self.session.in_session() {
            self.log_boundary_event(SESSION_END_EVENT)?;
        }

        self.session.start_session(timestamp);
        self.store
            .set_long_value(KEY_PREVIOUS_SESSION_ID, timestamp)?;
        if self.session.refresh(timestamp) {
            self.store
                .set_long_value(KEY_PREVIOUS_EVENT_TIME, timestamp)?;
        }

        if self.config.track_session_events {
            self.log_boundary_event(SESSION_START_EVENT)?;
        }

        Ok(true)
    }

    /// Logs a synthetic boundary event carrying the previous event time
    /// rather than "now". Skips the session check so it cannot recurse.
    fn log_boundary_event(&mut self, marker: &str) -> Result<()> {
        let timestamp = self.session.previous_event_time();
        let mut api_properties = Map::new();
        api_properties.insert(SPECIAL_PROPERTY.to_string(), Value::from(marker));
        self.log_event(marker.to_string(), None, Some(api_properties), timestamp, false)?;
        Ok(())
    }

    fn build_record(
        &self,
        event_type: String,
        event_properties: Option<Map<String, Value>>,
        api_properties: Option<Map<String, Value>>,
        timestamp: i64,
    ) -> EventRecord {
        let mut api_properties = api_properties.unwrap_or_default();
        if let Some(location) = self.config.location {
            api_properties.insert(
                "location".to_string(),
                json!({ "lat": location.lat, "lng": location.lng }),
            );
        }
        if let Some(ad_id) = &self.config.advertising_id {
            api_properties.insert("ad_id".to_string(), Value::from(ad_id.clone()));
        }

        EventRecord {
            event_type,
            timestamp,
            user_id: self
                .user_id
                .clone()
                .or_else(|| Some(self.device_id.clone())),
            device_id: Some(self.device_id.clone()),
            session_id: self.session.session_id(),
            device: self.config.metadata.clone(),
            library: LibraryInfo::default(),
            api_properties,
            event_properties: event_properties.unwrap_or_default(),
            user_properties: self.user_properties.clone(),
        }
    }

    /// Attempts to start an upload. No-op under opt-out or offline mode, or
    /// while another upload owns the batch window.
    ///
    /// `limit` caps the batch at the current window size; the chained flush
    /// after a success with no backoff passes `false` to drain unlimited.
    fn begin_upload(&mut self, limit: bool) {
        if self.opt_out || self.offline {
            self.notify_flush_waiters();
            return;
        }
        if self.uploading {
            return;
        }

        let batch_limit = if limit {
            Some(if self.backoff_active {
                self.backoff_batch_size
            } else {
                self.config.max_batch_size
            })
        } else {
            None
        };

        self.uploading = true;
        match self.prepare_batch(batch_limit) {
            Ok(Some(upload)) => {
                self.pending_upload = Some(upload);
            }
            Ok(None) => {
                self.uploading = false;
                self.notify_flush_waiters();
            }
            Err(error) => {
                self.uploading = false;
                warn!(%error, "failed to prepare upload batch");
                self.notify_flush_waiters();
            }
        }
    }

    /// Snapshots the oldest queued events into a serialized batch.
    ///
    /// The cutoff is the highest id at snapshot time, so events appended
    /// while the upload is in flight are never part of it.
    fn prepare_batch(&mut self, limit: Option<i64>) -> Result<Option<PreparedUpload>> {
        let cutoff = self.store.last_id()?;
        if cutoff < 0 {
            return Ok(None);
        }

        let Some(batch) = self.store.read_batch(cutoff, limit)? else {
            return Ok(None);
        };

        let body = serde_json::to_string(&batch.events)?;
        Ok(Some(PreparedUpload {
            body,
            max_id: batch.max_id,
        }))
    }

    /// Schedules a delayed flush, coalescing with any already pending timer.
    fn schedule_delayed_flush(&mut self) {
        if self.flush_scheduled {
            return;
        }
        self.flush_scheduled = true;

        let tx = self.tx.clone();
        let delay = self.config.upload_period;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::FlushTick).await;
        });
    }

    /// Hands a prepared batch to a network task; its outcome comes back as
    /// a command on the same channel.
    fn spawn_upload(&self, upload: PreparedUpload) {
        let uploader = self.uploader.clone();
        let clock = Arc::clone(&self.clock);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = uploader.upload(&upload.body, clock.now_millis()).await;
            let _ = tx
                .send(Command::UploadDone {
                    outcome,
                    max_id: upload.max_id,
                })
                .await;
        });
    }

    /// Applies an upload outcome to scheduler and backoff state.
    fn apply_outcome(&mut self, outcome: UploadOutcome, max_id: i64) {
        match outcome {
            UploadOutcome::Success => {
                self.last_upload_error = None;
                if let Err(error) = self.store.remove_through(max_id) {
                    warn!(%error, "failed to delete acknowledged events");
                }
                self.uploading = false;

                match self.store.count() {
                    Ok(count) if count > self.config.upload_threshold => {
                        self.begin_upload(self.backoff_active);
                    }
                    Ok(_) => {
                        self.backoff_active = false;
                        self.backoff_batch_size = self.config.max_batch_size;
                        self.notify_flush_waiters();
                    }
                    Err(error) => {
                        warn!(%error, "failed to read queue size after upload");
                        self.notify_flush_waiters();
                    }
                }
            }
            UploadOutcome::InvalidApiKey => {
                error!("server rejected the api key; fix the key before uploads can resume");
                self.uploading = false;
                self.notify_flush_waiters();
            }
            UploadOutcome::BadChecksum => {
                warn!("request was mangled in transit, batch stays queued for a later attempt");
                self.uploading = false;
                self.notify_flush_waiters();
            }
            UploadOutcome::ServerStoreFailed => {
                warn!("server could not persist the batch, it stays queued for a later attempt");
                self.uploading = false;
                self.notify_flush_waiters();
            }
            UploadOutcome::PayloadTooLarge => {
                if self.backoff_active && self.backoff_batch_size == 1 {
                    // A single event above the server limit can never
                    // succeed; drop it rather than stall the queue.
                    warn!(id = max_id, "dropping event too large to ever upload");
                    if let Err(error) = self.store.remove_one(max_id) {
                        warn!(%error, "failed to drop oversized event");
                    }
                }

                self.backoff_active = true;
                let queued = self.store.count().unwrap_or(0);
                let window = queued.min(self.backoff_batch_size);
                self.backoff_batch_size = ((window + 1) / 2).max(1);
                warn!(
                    batch_size = self.backoff_batch_size,
                    "batch too large, retrying with a smaller window"
                );

                self.uploading = false;
                self.begin_upload(true);
            }
            UploadOutcome::Failed(message) => {
                if self.last_upload_error.as_deref() == Some(message.as_str()) {
                    debug!("upload failed with the same error as the previous attempt");
                }
                warn!(error = %message, "upload failed, batch stays queued for a later attempt");
                self.last_upload_error = Some(message);
                self.uploading = false;
                self.notify_flush_waiters();
            }
        }
    }

    /// Resolves flush waiters once no upload is active or chained.
    fn notify_flush_waiters(&mut self) {
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
