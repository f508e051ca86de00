//! Core types for tabletsnap
//!
//! This crate defines the foundational types shared by the tablet servers and
//! the coordinator:
//! - SnapshotId / RestorationId / OpId and catalog identifiers
//! - SnapshotState / RestorationState lifecycles
//! - SysRowEntry: typed catalog records captured by a snapshot
//! - SnapshotError: error taxonomy
//! - SnapshotConfig: `tabletsnap.toml`
//! - TabletService: the per-tablet RPC seam

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod service;
pub mod state;
pub mod types;

pub use catalog::{
    ColumnSchema, DataType, NamespaceRecord, Partition, SysRowEntry, SysRowEntryType,
    TableRecord, TableSchema, TabletRecord,
};
pub use config::{AckPolicy, ConfigError, SnapshotConfig, CONFIG_FILE_NAME};
pub use error::{Result, SnapshotError};
pub use service::{LocalSnapshotResult, TabletService};
pub use state::{RestorationState, SnapshotState};
pub use types::{NamespaceId, OpId, RestorationId, SnapshotId, TableId, TableName, TabletId};
