//! Store error types.

use thiserror::Error;

/// Persistence failures. Surfaced to callers as `unavailable`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite rejected a statement or the file could not be opened.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A previous holder of the connection lock panicked.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// Serialization of a stored JSON column failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row holds a value the coordinator never writes.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Random ID allocation kept colliding with existing rows.
    #[error("could not allocate a fresh {0}")]
    Exhausted(&'static str),

    /// The blocking task running the store operation failed.
    #[error("store task failed: {0}")]
    Task(String),
}
