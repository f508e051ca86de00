//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;
use tabletsnap::{
    wait_for_snapshot_op_done, MiniCluster, MiniClusterOptions, SnapshotConfig, SnapshotId,
    SnapshotState, TableInfo, TableName, WaitOptions,
};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route `tracing` output through the test harness; `RUST_LOG` is not read.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Table used by every suite
pub fn table_name() -> TableName {
    TableName::new("my_keyspace", "snapshot_test_table")
}

pub const NUM_TABLETS: usize = 3;

/// Poll timing for the suites
pub fn wait_options() -> WaitOptions {
    WaitOptions::default().with_timeout(Duration::from_secs(60))
}

// ============================================================================
// TestCluster
// ============================================================================

/// Mini cluster living in a temp directory
pub struct TestCluster {
    pub cluster: MiniCluster,
    pub dir: TempDir,
}

impl TestCluster {
    /// Three tablet servers with the testing configuration
    pub fn new() -> Self {
        Self::with_config(SnapshotConfig::for_testing())
    }

    pub fn with_config(config: SnapshotConfig) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let options = MiniClusterOptions {
            config,
            ..MiniClusterOptions::default()
        };
        let cluster = MiniCluster::start(dir.path(), options).expect("Failed to start cluster");
        TestCluster { cluster, dir }
    }

    /// Create the suite table with `NUM_TABLETS` tablets
    pub fn setup_table(&self) -> TableInfo {
        self.cluster
            .create_table(&table_name(), NUM_TABLETS)
            .expect("Failed to create table")
    }

    /// Snapshot the suite table and wait for it to complete
    pub fn create_snapshot(&self) -> SnapshotId {
        let table = self.cluster.table(&table_name()).expect("table");
        let coordinator = self.cluster.coordinator();
        let snapshot_id = coordinator
            .create_snapshot(&[table.table_id], true)
            .expect("create_snapshot");
        let state = wait_for_snapshot_op_done(coordinator, snapshot_id, wait_options())
            .expect("wait for snapshot");
        assert_eq!(state, SnapshotState::Complete);
        self.check_all_snapshots(&[(snapshot_id, SnapshotState::Complete)]);
        snapshot_id
    }

    /// Unfiltered listing matches `expected` exactly, with no current snapshot
    pub fn check_all_snapshots(&self, expected: &[(SnapshotId, SnapshotState)]) {
        let listed = self
            .cluster
            .coordinator()
            .list_snapshots(None, false)
            .expect("list_snapshots");
        assert_eq!(listed.current_snapshot_id, None);
        let mut actual: Vec<_> = listed.snapshots.iter().map(|s| (s.id, s.state)).collect();
        let mut expected = expected.to_vec();
        actual.sort_by_key(|(id, _)| *id);
        expected.sort_by_key(|(id, _)| *id);
        assert_eq!(actual, expected);
        for snapshot in &listed.snapshots {
            assert!(snapshot.entries.is_none());
        }
    }

    pub fn tablet_ids(&self) -> Vec<tabletsnap::TabletId> {
        self.cluster
            .table(&table_name())
            .expect("table")
            .tablets
            .into_iter()
            .map(|t| t.tablet_id)
            .collect()
    }
}
