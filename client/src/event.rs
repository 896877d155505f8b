//! Event records and their wire serialization.
//!
//! Every queued event serializes to a single JSON object whose fields are
//! always present, with explicit nulls for missing values. Property maps
//! keep insertion order so the uploaded payload matches the order the host
//! application built them in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type of the synthetic record opening a session.
pub const SESSION_START_EVENT: &str = "session_start";

/// Event type of the synthetic record closing a session.
pub const SESSION_END_EVENT: &str = "session_end";

/// `api_properties` key marking synthetic pipeline events.
pub const SPECIAL_PROPERTY: &str = "special";

/// Session id value meaning "no active session".
pub const NO_SESSION: i64 = -1;

/// Device metadata snapshot supplied by the host platform layer.
///
/// The pipeline never inspects these values; they are copied verbatim into
/// every uploaded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub version_name: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub device_brand: Option<String>,
    pub device_manufacturer: Option<String>,
    pub device_model: Option<String>,
    pub carrier: Option<String>,
    pub country: Option<String>,
    pub language: Option<String>,
    pub platform: String,
}

impl Default for DeviceMetadata {
    fn default() -> Self {
        Self {
            version_name: None,
            os_name: None,
            os_version: None,
            device_brand: None,
            device_manufacturer: None,
            device_model: None,
            carrier: None,
            country: None,
            language: None,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// A location fix attached to events via `api_properties.location`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

/// Identifies the client library inside every uploaded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryInfo {
    pub name: String,
    pub version: String,
}

impl Default for LibraryInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One event as uploaded to the ingestion endpoint.
///
/// The queue id is not part of the record; it is assigned by the durable
/// queue at append time and only used locally for batching and deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_type: String,
    pub timestamp: i64,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub session_id: i64,
    #[serde(flatten)]
    pub device: DeviceMetadata,
    pub library: LibraryInfo,
    pub api_properties: Map<String, Value>,
    pub event_properties: Map<String, Value>,
    pub user_properties: Map<String, Value>,
}

impl EventRecord {
    /// Returns `true` for synthetic records generated by the pipeline
    /// itself (session boundaries).
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.api_properties.contains_key(SPECIAL_PROPERTY)
    }
}
