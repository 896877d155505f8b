//! Public client façade.
//!
//! [`TelemetryClient`] is the API surface host applications talk to. It
//! validates inputs synchronously, stamps timestamps from the configured
//! [`Clock`], and marshals every state mutation onto the pipeline worker's
//! command channel; replies travel back over oneshot channels. The façade
//! itself holds no mutable pipeline state, so it is cheap to clone and share
//! across tasks.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use beacon_client::client::TelemetryClient;
//! use beacon_client::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> beacon_client::error::Result<()> {
//!     let config = Config::new(
//!         "https://ingest.example.com",
//!         "my-api-key",
//!         "/var/lib/myapp/beacon.db",
//!     );
//!     let client = TelemetryClient::new(config)?;
//!
//!     client.log_event("app_opened").await?;
//!     client.shutdown(Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::event::NO_SESSION;
use crate::session::SessionTracker;
use crate::store::{
    EventStore, KEY_DEVICE_ID, KEY_OPT_OUT, KEY_PREVIOUS_EVENT_TIME, KEY_PREVIOUS_SESSION_ID,
    KEY_USER_ID,
};
use crate::uploader::Uploader;
use crate::worker::{Command, Worker};

/// Capacity of the command channel feeding the pipeline worker.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Device ids that platform integrations are known to report when they
/// cannot read a real identifier. Never adopted as the device id.
const INVALID_DEVICE_IDS: [&str; 3] = ["", "unknown", "000000000000000"];

/// Handle to a running telemetry pipeline.
///
/// Dropping the handle does not stop the worker; call
/// [`shutdown`](Self::shutdown) to flush and stop it.
#[derive(Clone)]
pub struct TelemetryClient {
    tx: mpsc::Sender<Command>,
    config: Config,
    clock: Arc<dyn Clock>,
    device_id: String,
}

impl TelemetryClient {
    /// Starts the pipeline with the system wall clock.
    ///
    /// Must be called inside a Tokio runtime: the pipeline worker is spawned
    /// onto it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error before anything is queued when the
    /// config is invalid, or a storage error when the database cannot be
    /// opened.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Starts the pipeline with an explicit clock. Tests pass a
    /// [`ManualClock`](crate::clock::ManualClock) to drive session windows
    /// deterministically.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let store = EventStore::open(&config.db_path)?;
        let device_id = initialize_device_id(&store, &config)?;

        let user_id = match &config.user_id {
            Some(user_id) => {
                store.set_string_value(KEY_USER_ID, Some(user_id))?;
                Some(user_id.clone())
            }
            None => store.string_value(KEY_USER_ID)?,
        };
        let opt_out = store.bool_value(KEY_OPT_OUT)?.unwrap_or(false);

        let previous_session_id = store
            .long_value(KEY_PREVIOUS_SESSION_ID)?
            .unwrap_or(NO_SESSION);
        let previous_event_time = store.long_value(KEY_PREVIOUS_EVENT_TIME)?.unwrap_or(-1);
        let session = SessionTracker::new(
            config.session_timeout_ms,
            config.min_time_between_sessions_ms,
            config.accurate_session_tracking,
            previous_session_id,
            previous_event_time,
        );

        let uploader = Uploader::new(config.server_url.clone(), config.api_key.clone());
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let worker = Worker::new(
            config.clone(),
            store,
            session,
            uploader,
            Arc::clone(&clock),
            tx.clone(),
            device_id.clone(),
            user_id,
            opt_out,
        );
        tokio::spawn(worker.run(rx));

        info!(device_id = %device_id, "telemetry client started");
        Ok(Self {
            tx,
            config,
            clock,
            device_id,
        })
    }

    /// Records a named event with no properties.
    ///
    /// Returns the assigned queue id, or `-1` when opted out.
    pub async fn log_event(&self, event_type: &str) -> Result<i64> {
        self.log_event_with_properties(event_type, None).await
    }

    /// Records a named event with structured properties.
    ///
    /// The event is timestamped now, session-checked, durably queued, and
    /// uploaded by the scheduler. Returns the assigned queue id, or `-1`
    /// when opted out.
    ///
    /// # Errors
    ///
    /// Rejects blank event types synchronously; storage and serialization
    /// failures drop the event and are returned.
    pub async fn log_event_with_properties(
        &self,
        event_type: &str,
        event_properties: Option<Map<String, Value>>,
    ) -> Result<i64> {
        if event_type.trim().is_empty() {
            return Err(ClientError::InvalidEvent(
                "event type cannot be empty or blank".to_string(),
            ));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::LogEvent {
            event_type: event_type.to_string(),
            event_properties,
            api_properties: None,
            timestamp: self.clock.now_millis(),
            check_session: !self.config.accurate_session_tracking,
            reply: Some(reply_tx),
        })
        .await?;

        reply_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Sets or clears the user id; persisted for later runs.
    pub async fn set_user_id(&self, user_id: Option<&str>) -> Result<()> {
        self.send(Command::SetUserId {
            user_id: user_id.map(str::to_string),
        })
        .await
    }

    /// Merges (or replaces) the user properties attached to every event.
    pub async fn set_user_properties(
        &self,
        properties: Map<String, Value>,
        replace: bool,
    ) -> Result<()> {
        self.send(Command::SetUserProperties {
            properties,
            replace,
        })
        .await
    }

    /// Enables or disables opt-out; persisted. While opted out, logging
    /// returns `-1` and nothing is queued or uploaded.
    pub async fn set_opt_out(&self, opt_out: bool) -> Result<()> {
        self.send(Command::SetOptOut { opt_out }).await
    }

    /// Enables or disables offline mode. Clearing it triggers an upload of
    /// everything queued while offline.
    pub async fn set_offline(&self, offline: bool) -> Result<()> {
        self.send(Command::SetOffline { offline }).await
    }

    /// Marks the client as between lifecycle pause and resume. Events
    /// logged in this window always re-check the session boundary.
    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        self.send(Command::SetPaused { paused }).await
    }

    /// Requests an upload attempt without waiting for it.
    pub async fn upload(&self) -> Result<()> {
        self.send(Command::Flush { done: None }).await
    }

    /// Requests an upload attempt and waits until it fully settles,
    /// including immediate chained retries.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Flush {
            done: Some(done_tx),
        })
        .await?;
        done_rx.await.map_err(|_| ClientError::Closed)
    }

    /// Number of events currently queued locally.
    pub async fn pending_events(&self) -> Result<i64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::PendingCount { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// The device id this client stamps on every event.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Flushes queued events (bounded by `timeout`) and stops the worker.
    ///
    /// Events that could not be flushed stay in the durable queue for the
    /// next run.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.flush()).await {
            Ok(result) => result?,
            Err(_) => warn!("timed out waiting for the final flush"),
        }
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| ClientError::Closed)
    }
}

/// Picks the durable device id for this installation.
///
/// Order: a usable persisted id; else one supplied by the host; else the
/// advertising id when enabled; else a random UUID with an `R` suffix
/// marking client-generated ids.
fn initialize_device_id(store: &EventStore, config: &Config) -> Result<String> {
    if let Some(stored) = store.string_value(KEY_DEVICE_ID)? {
        if !INVALID_DEVICE_IDS.contains(&stored.as_str()) {
            return Ok(stored);
        }
    }

    if let Some(supplied) = &config.device_id {
        if !INVALID_DEVICE_IDS.contains(&supplied.as_str()) {
            store.set_string_value(KEY_DEVICE_ID, Some(supplied))?;
            return Ok(supplied.clone());
        }
    }

    if !config.new_device_id_per_install && config.use_advertising_id_for_device_id {
        if let Some(ad_id) = &config.advertising_id {
            if !INVALID_DEVICE_IDS.contains(&ad_id.as_str()) {
                store.set_string_value(KEY_DEVICE_ID, Some(ad_id))?;
                return Ok(ad_id.clone());
            }
        }
    }

    let generated = format!("{}R", Uuid::new_v4());
    store.set_string_value(KEY_DEVICE_ID, Some(&generated))?;
    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::new("http://127.0.0.1:9", "test-key", "/tmp/unused.db")
    }

    #[test]
    fn generated_device_ids_are_marked_and_persisted() {
        let store = EventStore::in_memory().unwrap();
        let id = initialize_device_id(&store, &test_config()).unwrap();

        assert!(id.ends_with('R'));
        assert_eq!(store.string_value(KEY_DEVICE_ID).unwrap().as_deref(), Some(id.as_str()));

        // A second start reuses the persisted id.
        let again = initialize_device_id(&store, &test_config()).unwrap();
        assert_eq!(id, again);
    }

    #[test]
    fn invalid_persisted_ids_are_replaced() {
        let store = EventStore::in_memory().unwrap();
        store.set_string_value(KEY_DEVICE_ID, Some("unknown")).unwrap();

        let id = initialize_device_id(&store, &test_config()).unwrap();
        assert_ne!(id, "unknown");
        assert!(id.ends_with('R'));
    }

    #[test]
    fn host_supplied_device_id_wins_over_generation() {
        let store = EventStore::in_memory().unwrap();
        let config = test_config().with_device_id("host-device-7");

        let id = initialize_device_id(&store, &config).unwrap();
        assert_eq!(id, "host-device-7");
        assert_eq!(
            store.string_value(KEY_DEVICE_ID).unwrap().as_deref(),
            Some("host-device-7")
        );

        // A persisted id is still preferred on later starts.
        let again = initialize_device_id(&store, &test_config()).unwrap();
        assert_eq!(again, "host-device-7");
    }

    #[test]
    fn advertising_id_is_adopted_when_enabled() {
        let store = EventStore::in_memory().unwrap();
        let config = test_config()
            .with_advertising_id_for_device_id(true)
            .with_advertising_id("ad-device-1");

        let id = initialize_device_id(&store, &config).unwrap();
        assert_eq!(id, "ad-device-1");
        assert_eq!(
            store.string_value(KEY_DEVICE_ID).unwrap().as_deref(),
            Some("ad-device-1")
        );
    }

    #[test]
    fn per_install_ids_skip_the_advertising_id() {
        let store = EventStore::in_memory().unwrap();
        let config = test_config()
            .with_advertising_id_for_device_id(true)
            .with_new_device_id_per_install(true)
            .with_advertising_id("ad-device-1");

        let id = initialize_device_id(&store, &config).unwrap();
        assert_ne!(id, "ad-device-1");
        assert!(id.ends_with('R'));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_starting() {
        let config = Config::new("http://127.0.0.1:9", "  ", "/tmp/unused.db");
        let result = TelemetryClient::new(config);
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn blank_event_type_is_rejected_synchronously() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::new(
            "http://127.0.0.1:9",
            "test-key",
            dir.path().join("events.db"),
        );
        let client = TelemetryClient::new(config).unwrap();

        let result = client.log_event("   ").await;
        assert!(matches!(result, Err(ClientError::InvalidEvent(_))));
        assert_eq!(client.pending_events().await.unwrap(), 0);
    }
}
