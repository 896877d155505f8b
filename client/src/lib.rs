//! Beacon Client - durable event buffering and batch upload pipeline.
//!
//! This crate lets host applications record discrete named events with
//! arbitrary structured properties. Events are durably buffered in a local
//! SQLite database, grouped into activity sessions, batched, and uploaded to
//! a remote ingestion endpoint. The pipeline tolerates offline periods,
//! server-side rejection, and payload-size limits (by adaptively shrinking
//! batches).
//!
//! # Overview
//!
//! All mutable pipeline state lives on a single worker task fed by a FIFO
//! command channel, so appends, session checks and upload scheduling are
//! processed strictly in call order and at most one upload is ever in
//! flight. Network I/O happens on short-lived tasks that report back to the
//! worker.
//!
//! # Modules
//!
//! - [`client`]: Public façade; constructs and drives the pipeline
//! - [`config`]: Configuration and tuning knobs
//! - [`event`]: Event records and their wire serialization
//! - [`store`]: SQLite-backed durable queue and persisted client state
//! - [`session`]: Session windowing over event timestamps
//! - [`uploader`]: Batch upload over HTTP with integrity checksums
//! - [`clock`]: Wall-clock abstraction (deterministic in tests)
//! - [`error`]: Error types

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod store;
pub mod uploader;
mod worker;

pub use client::TelemetryClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError};
pub use error::{ClientError, Result};
pub use event::{
    DeviceMetadata, EventRecord, LibraryInfo, Location, NO_SESSION, SESSION_END_EVENT,
    SESSION_START_EVENT, SPECIAL_PROPERTY,
};
pub use session::SessionTracker;
pub use store::{Batch, EventStore};
pub use uploader::{UploadOutcome, Uploader};
