//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// Numeric IDs are never zero.
    #[error("{kind} cannot be zero")]
    Zero { kind: &'static str },

    /// The numeric portion of the ID is invalid.
    #[error("invalid {kind}: {message}")]
    InvalidNumber { kind: &'static str, message: String },

    /// The UUID portion of the ID is invalid.
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    /// The object digest is not 64 lowercase hex characters.
    #[error("invalid object digest: {message}")]
    InvalidDigest { message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error indicates a malformed object digest.
    pub fn is_digest_error(&self) -> bool {
        matches!(self, IdError::InvalidDigest { .. })
    }
}
