//! Catalog records captured in a snapshot
//!
//! A snapshot keeps the namespace, table and tablet records that existed when
//! it was created. Each record travels as a `SysRowEntry`: a type tag, the
//! catalog id, and the record encoded with MessagePack. The flat list of
//! entries is self-describing, so it can be exported from one cluster and
//! imported into another.

use crate::error::{Result, SnapshotError};
use crate::types::{NamespaceId, TableId, TabletId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag of a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SysRowEntryType {
    /// Namespace (keyspace) record
    Namespace,
    /// Table record
    Table,
    /// Tablet record
    Tablet,
}

impl fmt::Display for SysRowEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SysRowEntryType::Namespace => "NAMESPACE",
            SysRowEntryType::Table => "TABLE",
            SysRowEntryType::Tablet => "TABLET",
        };
        f.write_str(s)
    }
}

/// One typed catalog entry with an encoded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysRowEntry {
    /// Entry type
    pub entry_type: SysRowEntryType,
    /// Catalog id of the object in its source cluster
    pub id: String,
    /// Encoded `NamespaceRecord`, `TableRecord` or `TabletRecord`
    pub data: Vec<u8>,
}

impl SysRowEntry {
    /// Encode a namespace record
    pub fn namespace(id: &NamespaceId, record: &NamespaceRecord) -> Result<Self> {
        Self::encode(SysRowEntryType::Namespace, id.as_str(), record)
    }

    /// Encode a table record
    pub fn table(id: &TableId, record: &TableRecord) -> Result<Self> {
        Self::encode(SysRowEntryType::Table, id.as_str(), record)
    }

    /// Encode a tablet record
    pub fn tablet(id: &TabletId, record: &TabletRecord) -> Result<Self> {
        Self::encode(SysRowEntryType::Tablet, id.as_str(), record)
    }

    fn encode<T: Serialize>(entry_type: SysRowEntryType, id: &str, record: &T) -> Result<Self> {
        Ok(SysRowEntry {
            entry_type,
            id: id.to_string(),
            data: rmp_serde::to_vec(record)?,
        })
    }

    /// Decode the payload, checking the type tag first
    ///
    /// # Errors
    /// `IllegalState` if the tag does not match or the payload is malformed.
    pub fn decode<T: DeserializeOwned>(&self, expected: SysRowEntryType) -> Result<T> {
        if self.entry_type != expected {
            return Err(SnapshotError::illegal_state(format!(
                "Unexpected snapshot entry type {}, expected {}",
                self.entry_type, expected
            )));
        }
        rmp_serde::from_slice(&self.data).map_err(|e| {
            SnapshotError::illegal_state(format!(
                "Malformed {} entry {}: {}",
                self.entry_type, self.id, e
            ))
        })
    }
}

/// Namespace record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    /// Namespace name
    pub name: String,
}

/// Column data types supported by table schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// UTF-8 string
    String,
    /// Opaque bytes
    Binary,
}

/// One column of a table schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name
    pub name: String,
    /// Column type
    pub data_type: DataType,
    /// Whether the column is part of the primary key
    pub is_key: bool,
}

impl ColumnSchema {
    /// Create a primary-key column
    pub fn key(name: impl Into<String>, data_type: DataType) -> Self {
        ColumnSchema {
            name: name.into(),
            data_type,
            is_key: true,
        }
    }

    /// Create a value column
    pub fn value(name: impl Into<String>, data_type: DataType) -> Self {
        ColumnSchema {
            name: name.into(),
            data_type,
            is_key: false,
        }
    }
}

/// Table schema
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    /// Columns in declaration order
    pub columns: Vec<ColumnSchema>,
}

/// Table record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRecord {
    /// Table name
    pub name: String,
    /// Owning namespace id (in the source cluster)
    pub namespace_id: NamespaceId,
    /// Schema at snapshot time
    pub schema: TableSchema,
}

/// Hash-range partition owned by a tablet
///
/// `start_key` is inclusive, `end_key` exclusive. An empty `end_key` means
/// the end of the key space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    /// Inclusive lower bound
    pub start_key: Vec<u8>,
    /// Exclusive upper bound, empty for unbounded
    pub end_key: Vec<u8>,
}

impl Partition {
    /// Split the 16-bit hash space evenly into `count` partitions
    pub fn split_hash_space(count: usize) -> Vec<Partition> {
        let count = count.max(1);
        let step = 0x1_0000usize / count;
        (0..count)
            .map(|i| {
                let start = if i == 0 {
                    Vec::new()
                } else {
                    ((i * step) as u16).to_be_bytes().to_vec()
                };
                let end = if i + 1 == count {
                    Vec::new()
                } else {
                    (((i + 1) * step) as u16).to_be_bytes().to_vec()
                };
                Partition {
                    start_key: start,
                    end_key: end,
                }
            })
            .collect()
    }

    /// Whether a 16-bit hash code falls into this partition
    pub fn contains_hash(&self, hash: u16) -> bool {
        let key = hash.to_be_bytes();
        let above_start = self.start_key.is_empty() || key.as_slice() >= self.start_key.as_slice();
        let below_end = self.end_key.is_empty() || key.as_slice() < self.end_key.as_slice();
        above_start && below_end
    }
}

/// Tablet record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletRecord {
    /// Owning table id (in the source cluster)
    pub table_id: TableId,
    /// Key range served by the tablet
    pub partition: Partition,
}
