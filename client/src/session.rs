//! Session windowing over event timestamps.
//!
//! A session is a contiguous span of activity bounded by inactivity gaps. It
//! is identified by the timestamp of the event that opened it; `-1` means no
//! session is active. The tracker itself is pure state over timestamps; the
//! pipeline worker persists `session_id` and the previous event time through
//! the store so continuity survives restarts.

/// Decides session boundaries from event timestamps.
#[derive(Debug)]
pub struct SessionTracker {
    session_id: i64,
    previous_event_time: i64,
    session_timeout_ms: i64,
    min_time_between_sessions_ms: i64,
    accurate_tracking: bool,
}

impl SessionTracker {
    /// Creates a tracker, seeded with state restored from a previous run.
    ///
    /// Pass `-1` for both restored values on a first start.
    #[must_use]
    pub fn new(
        session_timeout_ms: i64,
        min_time_between_sessions_ms: i64,
        accurate_tracking: bool,
        restored_session_id: i64,
        restored_previous_event_time: i64,
    ) -> Self {
        Self {
            session_id: restored_session_id,
            previous_event_time: restored_previous_event_time,
            session_timeout_ms,
            min_time_between_sessions_ms,
            accurate_tracking,
        }
    }

    /// Current session id, or `-1` when no session is active.
    #[must_use]
    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Timestamp of the most recent in-session event.
    #[must_use]
    pub fn previous_event_time(&self) -> i64 {
        self.previous_event_time
    }

    /// Returns `true` while a session is active.
    #[must_use]
    pub fn in_session(&self) -> bool {
        self.session_id >= 0
    }

    /// Returns `true` when the gap since the last in-session event exceeds
    /// the effective limit. Always `false` outside a session.
    #[must_use]
    pub fn session_expired(&self, timestamp: i64) -> bool {
        if !self.in_session() {
            return false;
        }

        let limit = if self.accurate_tracking {
            self.min_time_between_sessions_ms
        } else {
            self.session_timeout_ms
        };
        timestamp - self.previous_event_time > limit
    }

    /// Returns `true` when an event at `timestamp` must open a new session.
    #[must_use]
    pub fn needs_new_session(&self, timestamp: i64) -> bool {
        !self.in_session() || self.session_expired(timestamp)
    }

    /// Opens a new session identified by `timestamp`.
    pub fn start_session(&mut self, timestamp: i64) {
        self.session_id = timestamp;
    }

    /// Refreshes the previous event time if a session is active.
    ///
    /// Returns `true` when the value changed and must be re-persisted.
    pub fn refresh(&mut self, timestamp: i64) -> bool {
        if !self.in_session() {
            return false;
        }

        self.previous_event_time = timestamp;
        true
    }
}
