//! Typed ID definitions for all fleet resources.

use sha2::{Digest, Sha256};

use crate::{define_numeric_id, define_uuid_id, IdError};

// =============================================================================
// Nodes and Runs
// =============================================================================

define_numeric_id!(NodeId, "node id");
define_numeric_id!(RunId, "run id");

impl NodeId {
    /// The coordinator's own identity.
    ///
    /// Results pushed by nodes are addressed here, and work pushed through the
    /// admin API originates here. The registry never hands this value out.
    pub const COORDINATOR: Self = Self(1);

    /// Returns true if this is the coordinator's reserved identity.
    #[must_use]
    pub const fn is_coordinator(&self) -> bool {
        self.0 == Self::COORDINATOR.0
    }

    /// Returns true if the value may be handed out to a registering node.
    #[must_use]
    pub const fn is_allocatable(value: u64) -> bool {
        value > Self::COORDINATOR.0
    }
}

// =============================================================================
// Messages and Requests
// =============================================================================

define_uuid_id!(MessageId);
define_uuid_id!(RequestId);

// =============================================================================
// Objects
// =============================================================================

/// Length of an object digest in bytes.
pub const OBJECT_DIGEST_LEN: usize = 32;

/// Content address of an object: the SHA-256 digest of its bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_DIGEST_LEN]);

impl ObjectId {
    /// Computes the ID of the given content.
    #[must_use]
    pub fn from_content(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }

    /// Wraps an already computed digest.
    #[must_use]
    pub const fn from_digest(digest: [u8; OBJECT_DIGEST_LEN]) -> Self {
        Self(digest)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn digest(&self) -> &[u8; OBJECT_DIGEST_LEN] {
        &self.0
    }

    /// Returns true if `content` hashes to this ID.
    #[must_use]
    pub fn matches(&self, content: &[u8]) -> bool {
        Self::from_content(content) == *self
    }

    /// Parses an ID from 64 lowercase hex characters.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        if s.len() != OBJECT_DIGEST_LEN * 2 {
            return Err(IdError::InvalidDigest {
                message: format!(
                    "expected {} hex characters, got {}",
                    OBJECT_DIGEST_LEN * 2,
                    s.len()
                ),
            });
        }

        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(IdError::InvalidDigest {
                message: "digest must be lowercase".to_string(),
            });
        }

        let mut digest = [0u8; OBJECT_DIGEST_LEN];
        hex::decode_to_slice(s, &mut digest).map_err(|e| IdError::InvalidDigest {
            message: e.to_string(),
        })?;

        Ok(Self(digest))
    }

    /// Returns the canonical hex representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl std::str::FromStr for ObjectId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
