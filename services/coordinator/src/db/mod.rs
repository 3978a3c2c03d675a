//! Durable state for the coordinator.
//!
//! This module provides:
//! - The SQLite-backed [`Store`] and its lifecycle (open, health check, close)
//! - The schema shared by the registry, queue, object store and run directory
//! - Column helpers for mapping typed IDs and timestamps in and out of rows
//!
//! One connection sits behind a mutex. Writers take an `IMMEDIATE`
//! transaction so every multi-table mutation commits or rolls back as a unit.

mod error;

pub use error::StoreError;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::{MessageId, NodeId, ObjectId, RunId};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use tracing::{debug, info};

/// Path value that selects an ephemeral in-memory store.
pub const IN_MEMORY: &str = ":memory:";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    node_id INTEGER PRIMARY KEY,
    registered_at INTEGER NOT NULL,
    heartbeat_interval_ms INTEGER NOT NULL,
    heartbeat_deadline INTEGER NOT NULL,
    last_heartbeat_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_nodes_deadline ON nodes(heartbeat_deadline);

CREATE TABLE IF NOT EXISTS retired_nodes (
    node_id INTEGER PRIMARY KEY,
    retired_at INTEGER NOT NULL,
    reason TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    run_id INTEGER PRIMARY KEY,
    fab_id TEXT NOT NULL,
    fab_version TEXT NOT NULL,
    fab_hash TEXT NOT NULL,
    bundle_uri TEXT NOT NULL,
    run_config TEXT NOT NULL,
    status TEXT NOT NULL,
    sub_status TEXT,
    details TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL UNIQUE,
    run_id INTEGER NOT NULL,
    src_node_id INTEGER NOT NULL,
    dst_node_id INTEGER NOT NULL,
    message_type TEXT NOT NULL,
    reply_to TEXT,
    group_id TEXT,
    root_object_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    ttl_ms INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    delivered_at INTEGER,
    acknowledged_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_messages_inbox
    ON messages(dst_node_id, acknowledged_at, created_at, seq);
CREATE INDEX IF NOT EXISTS idx_messages_expires ON messages(expires_at);

CREATE TABLE IF NOT EXISTS message_objects (
    message_id TEXT NOT NULL,
    object_id TEXT NOT NULL,
    -- Shape as pushed with this message; 0 for internal tree nodes.
    is_leaf INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (message_id, object_id)
);

CREATE INDEX IF NOT EXISTS idx_message_objects_object ON message_objects(object_id);

CREATE TABLE IF NOT EXISTS objects (
    object_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    state TEXT NOT NULL,
    declared_size INTEGER,
    received_bytes INTEGER NOT NULL DEFAULT 0,
    ref_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_objects_state ON objects(state, updated_at);

CREATE TABLE IF NOT EXISTS object_chunks (
    object_id TEXT NOT NULL,
    chunk_offset INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (object_id, chunk_offset)
);
"#;

/// SQLite store shared by every coordinator component.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a store at the given path. `:memory:` opens an ephemeral store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path == Path::new(IN_MEMORY) {
            return Self::open_in_memory();
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "Opened fleet store");
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        debug!("Fleet store schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run `f` against the connection without a transaction.
    pub fn read<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside an `IMMEDIATE` transaction, committing only on `Ok`.
    pub fn write<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    pub fn health_check(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Flush the write-ahead log into the main database file.
    pub fn close(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        info!("Fleet store checkpointed");
        Ok(())
    }
}

// =============================================================================
// Column helpers
// =============================================================================

/// Numeric IDs are stored bit-for-bit in signed INTEGER columns.
pub(crate) fn sql_id(value: u64) -> i64 {
    value as i64
}

pub(crate) fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

pub(crate) fn get_node_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<NodeId> {
    let raw: i64 = row.get(idx)?;
    NodeId::new(raw as u64).map_err(|e| conversion_error(idx, Type::Integer, e))
}

pub(crate) fn get_run_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<RunId> {
    let raw: i64 = row.get(idx)?;
    RunId::new(raw as u64).map_err(|e| conversion_error(idx, Type::Integer, e))
}

pub(crate) fn get_message_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<MessageId> {
    let raw: String = row.get(idx)?;
    MessageId::parse(&raw).map_err(|e| conversion_error(idx, Type::Text, e))
}

pub(crate) fn get_opt_message_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<MessageId>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| MessageId::parse(&s).map_err(|e| conversion_error(idx, Type::Text, e)))
        .transpose()
}

pub(crate) fn get_object_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<ObjectId> {
    let raw: String = row.get(idx)?;
    ObjectId::parse(&raw).map_err(|e| conversion_error(idx, Type::Text, e))
}

pub(crate) fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(raw).ok_or_else(|| {
        conversion_error(
            idx,
            Type::Integer,
            StoreError::Corrupt(format!("timestamp out of range: {raw}")),
        )
    })
}

pub(crate) fn get_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|ms| {
        DateTime::from_timestamp_millis(ms).ok_or_else(|| {
            conversion_error(
                idx,
                Type::Integer,
                StoreError::Corrupt(format!("timestamp out of range: {ms}")),
            )
        })
    })
    .transpose()
}

/// Reads a TEXT column into one of the coordinator's string-coded enums.
pub(crate) fn get_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| conversion_error(idx, Type::Text, StoreError::Corrupt(e)))
}

pub(crate) fn get_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map_err(|e| conversion_error(idx, Type::Integer, e))
}
