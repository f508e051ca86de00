//! Identifier types for the snapshot subsystem
//!
//! This module defines the identifiers passed between the coordinator and the
//! tablet servers:
//! - SnapshotId / RestorationId: 16-byte UUID-backed identifiers
//! - NamespaceId / TableId / TabletId: catalog identifiers (32 hex chars)
//! - OpId: position in a tablet's replicated log

use crate::error::{Result, SnapshotError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Allocate a fresh random identifier (UUID v4)
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The nil identifier (all zero bytes)
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Whether this is the nil identifier
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            /// Create an identifier from raw bytes
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Fully decode an identifier from its compact binary form
            ///
            /// # Errors
            /// Returns `InvalidArgument` unless `bytes` is exactly 16 bytes long.
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                Uuid::from_slice(bytes).map(Self).map_err(|_| {
                    SnapshotError::invalid_argument(format!(
                        "Invalid {} length: {} bytes, expected 16",
                        $what,
                        bytes.len()
                    ))
                })
            }

            /// Get the raw bytes of this identifier
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = SnapshotError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    SnapshotError::invalid_argument(format!("Invalid {} '{}': {}", $what, s, e))
                })
            }
        }
    };
}

uuid_id!(
    /// Identifier of a snapshot
    ///
    /// Globally unique, generated at creation time and immutable once
    /// assigned. The string form is the hyphenated UUID, which is also the
    /// name of the per-tablet snapshot directory.
    SnapshotId,
    "snapshot id"
);

uuid_id!(
    /// Identifier of one restore operation
    ///
    /// `RestorationId::nil()` is the "not yet assigned" sentinel.
    RestorationId,
    "restoration id"
);

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl RestorationId {
    /// Reject the nil sentinel where a real restoration id is required
    pub fn require_valid(&self) -> Result<()> {
        if self.is_nil() {
            return Err(SnapshotError::invalid_argument("Invalid restoration id"));
        }
        Ok(())
    }
}

macro_rules! catalog_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh identifier
            pub fn generate() -> Self {
                Self(Uuid::new_v4().simple().to_string())
            }

            /// Wrap an existing identifier string
            pub fn from_string(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier text
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

catalog_id!(
    /// Catalog identifier of a namespace (keyspace / database)
    NamespaceId
);
catalog_id!(
    /// Catalog identifier of a table
    TableId
);
catalog_id!(
    /// Catalog identifier of a tablet
    TabletId
);

/// Position in a tablet's replicated write-ahead log
///
/// Ordered by term first, then index, so `>=` answers "has the log reached
/// this point".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OpId {
    /// Leader term the operation was appended in
    pub term: u64,
    /// Log index within the tablet
    pub index: u64,
}

impl OpId {
    /// The position before any operation
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    /// Create an op id
    pub const fn new(term: u64, index: u64) -> Self {
        OpId { term, index }
    }

    /// Raise `self` to `other` if `other` is further along
    pub fn make_at_least(&mut self, other: OpId) {
        if other > *self {
            *self = other;
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// Fully qualified table name: namespace name plus table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    /// Namespace (keyspace) name
    pub namespace_name: String,
    /// Table name within the namespace
    pub table_name: String,
}

impl TableName {
    /// Create a table name
    pub fn new(namespace_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        TableName {
            namespace_name: namespace_name.into(),
            table_name: table_name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace_name, self.table_name)
    }
}
