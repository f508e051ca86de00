//! tabletsnap - snapshot and restore coordination for tablet-sharded databases
//!
//! A snapshot is a consistent point-in-time copy of a table across every
//! replica of every tablet. Local snapshots are hard-linked checkpoints of
//! each replica's data files, taken once the replica has committed a target
//! op id. A coordinator tracks the global state of each snapshot and
//! restoration durably and exposes it through polling queries.
//!
//! # Quick Start
//!
//! ```ignore
//! use tabletsnap::{MiniCluster, MiniClusterOptions, TableName, WaitOptions};
//!
//! let cluster = MiniCluster::start(dir, MiniClusterOptions::default())?;
//! let name = TableName::new("my_keyspace", "testtb");
//! let table = cluster.create_table(&name, 3)?;
//! cluster.insert_rows(&name, 0..100)?;
//!
//! let coordinator = cluster.coordinator();
//! let snapshot_id = coordinator.create_snapshot(&[table.table_id], true)?;
//! tabletsnap::wait_for_snapshot_op_done(coordinator, snapshot_id, WaitOptions::default())?;
//! ```
//!
//! # Crates
//!
//! - `tabletsnap-core`: ids, states, errors, configuration, the tablet RPC seam
//! - `tabletsnap-tablet`: local snapshot executor, consensus gate, tablet server
//! - `tabletsnap-master`: registry, coordinator, import, poll helpers

pub mod cluster;

pub use cluster::{hash_code, MiniCluster, MiniClusterOptions};
pub use tabletsnap_core::*;
pub use tabletsnap_master::{
    wait_for_create_table_done, wait_for_restoration_done, wait_for_snapshot_deleted,
    wait_for_snapshot_op_done, CatalogManager, IdPair, ImportedTable, InMemoryCatalog,
    ListSnapshotsResponse, RestorationInfo, RestorationOutcome, SnapshotCoordinator, SnapshotInfo,
    TableInfo, TabletInfo, WaitOptions,
};
pub use tabletsnap_tablet::{remote_bootstrap, TabletServer};
