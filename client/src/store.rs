//! Durable event queue backed by SQLite.
//!
//! Events are stored as serialized JSON rows keyed by a monotonically
//! increasing id (`AUTOINCREMENT`, so ids are never reused after deletion).
//! Two small key/value side tables hold the persisted client state that must
//! survive restarts: device id, user id, opt-out flag, previous event time
//! and previous session id. Keeping queue and state in one database file
//! means a single open handle owns everything durable.
//!
//! The store is exclusively owned by the pipeline worker; see the
//! [`worker`](crate::worker) module for the ownership rules.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;

/// Persisted key for the device identifier.
pub const KEY_DEVICE_ID: &str = "device_id";

/// Persisted key for the user identifier.
pub const KEY_USER_ID: &str = "user_id";

/// Persisted key for the opt-out flag.
pub const KEY_OPT_OUT: &str = "opt_out";

/// Persisted key for the timestamp of the most recent in-session event.
pub const KEY_PREVIOUS_EVENT_TIME: &str = "previous_event_time";

/// Persisted key for the most recently started session id.
pub const KEY_PREVIOUS_SESSION_ID: &str = "previous_session_id";

/// A contiguous, id-ordered slice of the queue selected for one upload.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Highest queue id included in `events`.
    pub max_id: i64,
    /// Parsed event objects in ascending id order.
    pub events: Vec<Value>,
}

/// SQLite-backed durable event queue plus persisted client state.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Opens (or creates) the store at the given path.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the database cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Creates an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS long_store (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS store (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            "#,
        )?;
        Ok(())
    }

    /// Appends one serialized event and returns its assigned id.
    pub fn append(&self, payload: &str) -> Result<i64> {
        self.conn
            .execute("INSERT INTO events (event) VALUES (?1)", params![payload])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Returns the number of queued events.
    pub fn count(&self) -> Result<i64> {
        let count =
            self.conn
                .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Returns the highest assigned id, or `-1` when the queue is empty.
    ///
    /// Captured by the scheduler as the batch cutoff so that events appended
    /// while an upload is in flight never become part of its snapshot.
    pub fn last_id(&self) -> Result<i64> {
        let id: Option<i64> =
            self.conn
                .query_row("SELECT MAX(id) FROM events", [], |row| row.get(0))?;
        Ok(id.unwrap_or(-1))
    }

    /// Returns the id of the n-th oldest event (1-based), or `-1` when
    /// fewer than `n` events are queued.
    pub fn nth_event_id(&self, n: i64) -> Result<i64> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM events ORDER BY id ASC LIMIT 1 OFFSET ?1",
                params![n - 1],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.unwrap_or(-1))
    }

    /// Reads up to `limit` oldest events with `id <= cutoff_id`.
    ///
    /// Rows that no longer parse as JSON are deleted and skipped. Returns
    /// `None` when no readable events fall inside the window.
    pub fn read_batch(&self, cutoff_id: i64, limit: Option<i64>) -> Result<Option<Batch>> {
        let mut events = Vec::new();
        let mut max_id = -1;
        let mut corrupt = Vec::new();

        {
            let mut stmt = self.conn.prepare(
                "SELECT id, event FROM events WHERE id <= ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![cutoff_id, limit.unwrap_or(-1)], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;

            for row in rows {
                let (id, payload) = row?;
                match serde_json::from_str::<Value>(&payload) {
                    Ok(event) => {
                        max_id = id;
                        events.push(event);
                    }
                    Err(error) => {
                        warn!(id, %error, "dropping unreadable event row");
                        corrupt.push(id);
                    }
                }
            }
        }

        for id in corrupt {
            self.remove_one(id)?;
        }

        if events.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Batch { max_id, events }))
        }
    }

    /// Deletes all events with `id <= id`. Idempotent.
    pub fn remove_through(&self, id: i64) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM events WHERE id <= ?1", params![id])?;
        Ok(removed)
    }

    /// Deletes a single event by id.
    pub fn remove_one(&self, id: i64) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM events WHERE id = ?1", params![id])?;
        Ok(removed)
    }

    /// Reads a persisted integer value.
    pub fn long_value(&self, key: &str) -> Result<Option<i64>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM long_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Writes a persisted integer value.
    pub fn set_long_value(&self, key: &str, value: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO long_store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Reads a persisted boolean value (stored as an integer).
    pub fn bool_value(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.long_value(key)?.map(|value| value != 0))
    }

    /// Writes a persisted boolean value.
    pub fn set_bool_value(&self, key: &str, value: bool) -> Result<()> {
        self.set_long_value(key, i64::from(value))
    }

    /// Reads a persisted string value.
    pub fn string_value(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM store WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    /// Writes a persisted string value; `None` clears it.
    pub fn set_string_value(&self, key: &str, value: Option<&str>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}
