//! Error types for the Beacon client.
//!
//! This is the single error surface of the crate. Upload failures are
//! deliberately absent: the pipeline converts them into scheduler state and
//! diagnostics on the worker task instead of surfacing them to callers (see
//! the [`worker`](crate::worker) module).

use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned by the client façade and the storage layer.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Configuration was rejected before anything was queued.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The event was rejected synchronously and never queued.
    #[error("event rejected: {0}")]
    InvalidEvent(String),

    /// The local event database failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// An event or batch could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The pipeline worker has shut down; no further calls are possible.
    #[error("client is shut down")]
    Closed,
}

/// A specialized `Result` type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
