//! # fleet-id
//!
//! Stable ID types, parsing, and validation for the fleet coordinator.
//!
//! ## Design Principles
//!
//! - Node and run IDs are coordinator-assigned; clients never choose them
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed to prevent mixing different resource types
//!
//! ## ID Formats
//!
//! | Type        | Representation                          | JSON   |
//! |-------------|-----------------------------------------|--------|
//! | `NodeId`    | nonzero u64                             | number |
//! | `RunId`     | nonzero u64                             | number |
//! | `MessageId` | hyphenated UUID                         | string |
//! | `RequestId` | hyphenated UUID                         | string |
//! | `ObjectId`  | SHA-256 of the content, 64 lowercase hex | string |
//!
//! Object IDs are content addresses: the identifier *is* the digest, so a
//! receiver can always verify what it was handed.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
