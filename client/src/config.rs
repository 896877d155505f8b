//! Configuration for the Beacon client.
//!
//! A [`Config`] is built programmatically by the host application and
//! validated once when the client is constructed. All tuning knobs have
//! production defaults:
//!
//! | Knob | Default | Description |
//! |------|---------|-------------|
//! | `upload_threshold` | 30 | Queued-event count that triggers an immediate upload |
//! | `max_batch_size` | 100 | Maximum events per upload request |
//! | `max_event_count` | 1000 | Hard cap on queued events before eviction |
//! | `eviction_batch_size` | 20 | Oldest events dropped when the cap is hit |
//! | `upload_period` | 30s | Delay before a below-threshold upload fires |
//! | `session_timeout_ms` | 30min | Inactivity gap that ends a session |
//! | `min_time_between_sessions_ms` | 15s | Gap limit under accurate tracking |
//!
//! # Example
//!
//! ```
//! use beacon_client::config::Config;
//!
//! let config = Config::new("https://ingest.example.com", "my-api-key", "/tmp/beacon.db")
//!     .with_upload_threshold(10)
//!     .with_session_events(true);
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::event::{DeviceMetadata, Location};

/// Queued-event count that triggers an immediate upload.
pub const DEFAULT_UPLOAD_THRESHOLD: i64 = 30;

/// Maximum number of events in a single upload request.
pub const DEFAULT_MAX_BATCH_SIZE: i64 = 100;

/// Hard cap on locally queued events.
pub const DEFAULT_MAX_EVENT_COUNT: i64 = 1000;

/// Number of oldest events dropped when the cap is reached.
pub const DEFAULT_EVICTION_BATCH_SIZE: i64 = 20;

/// Delay before a below-threshold upload fires.
pub const DEFAULT_UPLOAD_PERIOD: Duration = Duration::from_millis(30_000);

/// Inactivity gap that ends a session in the default tracking mode.
pub const DEFAULT_SESSION_TIMEOUT_MS: i64 = 30 * 60 * 1000;

/// Gap limit between events when accurate session tracking is enabled.
pub const DEFAULT_MIN_TIME_BETWEEN_SESSIONS_MS: i64 = 15_000;

/// Errors that can occur during configuration validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// API key is empty or blank.
    #[error("api key cannot be empty or blank")]
    MissingApiKey,

    /// Server URL is empty or blank.
    #[error("server url cannot be empty or blank")]
    MissingServerUrl,

    /// A tuning knob has an invalid value.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// Configuration for a [`TelemetryClient`](crate::client::TelemetryClient).
#[derive(Debug, Clone)]
pub struct Config {
    /// Ingestion endpoint URL (e.g. `https://ingest.example.com/`).
    pub server_url: String,

    /// API key identifying this application to the ingestion endpoint.
    pub api_key: String,

    /// Path of the SQLite database holding the durable event queue.
    pub db_path: PathBuf,

    /// Queued-event count that triggers an immediate upload.
    pub upload_threshold: i64,

    /// Maximum number of events in a single upload request.
    pub max_batch_size: i64,

    /// Hard cap on locally queued events; oldest are evicted beyond it.
    pub max_event_count: i64,

    /// Number of oldest events dropped when the cap is reached.
    pub eviction_batch_size: i64,

    /// Delay before a below-threshold upload fires.
    pub upload_period: Duration,

    /// Inactivity gap that ends a session in the default tracking mode.
    pub session_timeout_ms: i64,

    /// Gap limit between events when accurate session tracking is enabled.
    pub min_time_between_sessions_ms: i64,

    /// Use the stricter inter-event gap (`min_time_between_sessions_ms`)
    /// instead of the inactivity timeout, and skip the per-event session
    /// check for ordinary events.
    pub accurate_session_tracking: bool,

    /// Emit synthetic `session_start` / `session_end` boundary events.
    pub track_session_events: bool,

    /// Adopt the advertising id as the device id when no usable id is stored.
    pub use_advertising_id_for_device_id: bool,

    /// Never adopt an identifier that would survive reinstalls.
    pub new_device_id_per_install: bool,

    /// Externally supplied user id; persisted on first start when set.
    pub user_id: Option<String>,

    /// Externally supplied device id; adopted (and persisted) when no
    /// usable id is stored yet.
    pub device_id: Option<String>,

    /// Device metadata snapshot supplied by the host platform layer.
    pub metadata: DeviceMetadata,

    /// Most recent location fix, if the host collects one.
    pub location: Option<Location>,

    /// Advertising identifier, if the host collects one.
    pub advertising_id: Option<String>,
}

impl Config {
    /// Creates a configuration with production defaults.
    #[must_use]
    pub fn new(
        server_url: impl Into<String>,
        api_key: impl Into<String>,
        db_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            db_path: db_path.into(),
            upload_threshold: DEFAULT_UPLOAD_THRESHOLD,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_event_count: DEFAULT_MAX_EVENT_COUNT,
            eviction_batch_size: DEFAULT_EVICTION_BATCH_SIZE,
            upload_period: DEFAULT_UPLOAD_PERIOD,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            min_time_between_sessions_ms: DEFAULT_MIN_TIME_BETWEEN_SESSIONS_MS,
            accurate_session_tracking: false,
            track_session_events: false,
            use_advertising_id_for_device_id: false,
            new_device_id_per_install: false,
            user_id: None,
            device_id: None,
            metadata: DeviceMetadata::default(),
            location: None,
            advertising_id: None,
        }
    }

    /// Sets the queued-event count that triggers an immediate upload.
    #[must_use]
    pub fn with_upload_threshold(mut self, threshold: i64) -> Self {
        self.upload_threshold = threshold;
        self
    }

    /// Sets the maximum number of events in a single upload request.
    #[must_use]
    pub fn with_max_batch_size(mut self, size: i64) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the hard cap on locally queued events.
    #[must_use]
    pub fn with_max_event_count(mut self, count: i64) -> Self {
        self.max_event_count = count;
        self
    }

    /// Sets the number of oldest events dropped when the cap is reached.
    #[must_use]
    pub fn with_eviction_batch_size(mut self, size: i64) -> Self {
        self.eviction_batch_size = size;
        self
    }

    /// Sets the delay before a below-threshold upload fires.
    #[must_use]
    pub fn with_upload_period(mut self, period: Duration) -> Self {
        self.upload_period = period;
        self
    }

    /// Sets the inactivity gap that ends a session.
    #[must_use]
    pub fn with_session_timeout_ms(mut self, millis: i64) -> Self {
        self.session_timeout_ms = millis;
        self
    }

    /// Sets the gap limit used under accurate session tracking.
    #[must_use]
    pub fn with_min_time_between_sessions_ms(mut self, millis: i64) -> Self {
        self.min_time_between_sessions_ms = millis;
        self
    }

    /// Enables or disables accurate session tracking.
    #[must_use]
    pub fn with_accurate_session_tracking(mut self, enabled: bool) -> Self {
        self.accurate_session_tracking = enabled;
        self
    }

    /// Enables or disables synthetic session boundary events.
    #[must_use]
    pub fn with_session_events(mut self, enabled: bool) -> Self {
        self.track_session_events = enabled;
        self
    }

    /// Enables adopting the advertising id as the device id.
    #[must_use]
    pub fn with_advertising_id_for_device_id(mut self, enabled: bool) -> Self {
        self.use_advertising_id_for_device_id = enabled;
        self
    }

    /// Forbids identifiers that would survive reinstalls.
    #[must_use]
    pub fn with_new_device_id_per_install(mut self, enabled: bool) -> Self {
        self.new_device_id_per_install = enabled;
        self
    }

    /// Sets the externally supplied user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the externally supplied device id.
    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Sets the device metadata snapshot.
    #[must_use]
    pub fn with_metadata(mut self, metadata: DeviceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the most recent location fix.
    #[must_use]
    pub fn with_location(mut self, lat: f64, lng: f64) -> Self {
        self.location = Some(Location { lat, lng });
        self
    }

    /// Sets the advertising identifier.
    #[must_use]
    pub fn with_advertising_id(mut self, advertising_id: impl Into<String>) -> Self {
        self.advertising_id = Some(advertising_id.into());
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the API key or server URL is blank, or if
    /// any count/size knob is not strictly positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::MissingServerUrl);
        }

        for (field, value) in [
            ("upload_threshold", self.upload_threshold),
            ("max_batch_size", self.max_batch_size),
            ("max_event_count", self.max_event_count),
            ("eviction_batch_size", self.eviction_batch_size),
            ("session_timeout_ms", self.session_timeout_ms),
            (
                "min_time_between_sessions_ms",
                self.min_time_between_sessions_ms,
            ),
        ] {
            if value <= 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: format!("expected a positive value, got {value}"),
                });
            }
        }

        Ok(())
    }
}
