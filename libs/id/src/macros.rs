//! Macros for defining typed ID types.

/// Macro to define a coordinator-assigned numeric ID.
///
/// This generates a newtype wrapper around a nonzero `u64` with:
/// - A `KIND` constant used in error messages
/// - `new()` to wrap a raw value, rejecting zero
/// - `parse()` to parse from a decimal string
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations (JSON number)
///
/// # Example
///
/// ```ignore
/// define_numeric_id!(NodeId, "node id");
///
/// let node_id = NodeId::new(42)?;
/// let parsed: NodeId = "42".parse()?;
/// ```
#[macro_export]
macro_rules! define_numeric_id {
    ($name:ident, $kind:literal) => {
        /// A typed, nonzero numeric ID.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Human-readable name of this ID type.
            pub const KIND: &'static str = $kind;

            /// Wraps a raw value. Zero is never a valid ID.
            pub fn new(value: u64) -> Result<Self, $crate::IdError> {
                if value == 0 {
                    return Err($crate::IdError::Zero { kind: Self::KIND });
                }
                Ok(Self(value))
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn get(&self) -> u64 {
                self.0
            }

            /// Parses an ID from its decimal representation.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let value = s
                    .parse::<u64>()
                    .map_err(|e| $crate::IdError::InvalidNumber {
                        kind: Self::KIND,
                        message: e.to_string(),
                    })?;

                Self::new(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<u64> for $name {
            type Error = $crate::IdError;

            fn try_from(value: u64) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_u64(self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let value = u64::deserialize(deserializer)?;
                Self::new(value).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Macro to define a UUID-backed ID.
///
/// The canonical form is the hyphenated lowercase UUID. Parsing accepts any
/// form the `uuid` crate accepts and normalizes on output.
#[macro_export]
macro_rules! define_uuid_id {
    ($name:ident) => {
        /// A typed UUID-backed ID.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Uuid);

        impl $name {
            /// Creates a new random (v4) ID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Uuid::new_v4())
            }

            /// Creates an ID from a raw UUID.
            #[must_use]
            pub const fn from_uuid(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> $crate::Uuid {
                self.0
            }

            /// Parses an ID from a string.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                s.parse::<$crate::Uuid>()
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidUuid(e.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
