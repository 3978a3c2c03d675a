//! Error taxonomy of the coordinator core.

use std::time::Duration;

use fleet_id::{NodeId, ObjectId};
use thiserror::Error;

use crate::db::StoreError;

/// Failures returned by the coordinator. Per-message push rejections are not
/// errors; they are reported as a `PushStatus` in the batch result.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Unknown node, message, object or run.
    #[error("{0} not found")]
    NotFound(String),

    /// The caller's node identity is gone; it must register again.
    #[error("node {0} is not registered or has expired")]
    NodeExpired(NodeId),

    /// The object exists but has not been committed yet.
    #[error("object {object_id} is not committed yet")]
    NotReady {
        object_id: ObjectId,
        retry_after: Duration,
    },

    /// Pushed bytes do not hash to the object ID. The upload must restart.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("store unavailable: {0}")]
    Unavailable(#[from] StoreError),
}

impl From<rusqlite::Error> for FleetError {
    fn from(e: rusqlite::Error) -> Self {
        FleetError::Unavailable(StoreError::Sqlite(e))
    }
}

impl FleetError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        FleetError::NotFound(what.to_string())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        FleetError::InvalidArgument(message.into())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::NotFound(_) => "not_found",
            FleetError::NodeExpired(_) => "node_expired",
            FleetError::NotReady { .. } => "not_ready",
            FleetError::Integrity(_) => "integrity_error",
            FleetError::InvalidArgument(_) => "invalid_argument",
            FleetError::PermissionDenied(_) => "permission_denied",
            FleetError::Unavailable(_) => "unavailable",
        }
    }

    /// True if the same call may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::NotReady { .. } | FleetError::Unavailable(_)
        )
    }
}
