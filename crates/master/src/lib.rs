//! Snapshot coordinator for tabletsnap
//!
//! This crate runs on the metadata coordinator:
//! - Registry: snapshot and restoration entries, a pure report-folding state
//!   machine, persisted to `sys_catalog`
//! - SnapshotCoordinator: create / list / restore / delete / import
//! - FanoutPool + RetryPolicy: per-tablet directive delivery
//! - CatalogManager / ReplicaLocator: seams to the cluster catalog
//! - poll: wait-until-done helpers for callers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod coordinator;
pub mod import;
pub mod poll;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod store;

pub use catalog::{
    CatalogManager, InMemoryCatalog, ReplicaLocator, TableInfo, TabletInfo, TabletProvisioner,
};
pub use coordinator::{ListSnapshotsResponse, RestorationInfo, SnapshotCoordinator, SnapshotInfo};
pub use import::{import_snapshot_meta, IdPair, ImportedTable};
pub use poll::{
    wait_for, wait_for_create_table_done, wait_for_restoration_done, wait_for_snapshot_deleted,
    wait_for_snapshot_op_done, RestorationOutcome, WaitOptions,
};
pub use pool::{BackpressureError, FanoutHandle, FanoutPool, PoolStats};
pub use registry::{
    apply_restoration_report, apply_snapshot_report, DirectiveKind, Registry, RestorationEntry,
    ReportResult, SnapshotEntry, TabletProgress, TabletReport,
};
pub use retry::{Attempt, RetryPolicy};
pub use store::{CatalogImage, CatalogStore, SYS_CATALOG_FILE};
