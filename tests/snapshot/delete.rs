//! Deleting snapshots

use crate::common::*;
use tabletsnap::{wait_for_snapshot_deleted, SnapshotState};

#[test]
fn test_delete_removes_entry_and_local_directories() {
    let tc = TestCluster::new();
    tc.setup_table();
    tc.cluster.insert_rows(&table_name(), 0..30).unwrap();
    let snapshot_id = tc.create_snapshot();
    let coordinator = tc.cluster.coordinator();
    coordinator.drain();

    coordinator.delete_snapshot(snapshot_id).unwrap();
    wait_for_snapshot_deleted(coordinator, snapshot_id, wait_options()).unwrap();
    tc.check_all_snapshots(&[]);

    for i in 0..tc.cluster.num_tablet_servers() {
        let server = tc.cluster.tablet_server(i).unwrap();
        for tablet_id in tc.tablet_ids() {
            let replica = server.replica(&tablet_id).unwrap();
            assert!(!replica.paths().snapshot_dir(snapshot_id).exists());
        }
    }
    // Live data is untouched.
    assert_eq!(tc.cluster.scan_table(&table_name()).unwrap().len(), 30);
}

#[test]
fn test_delete_keeps_other_snapshots() {
    let tc = TestCluster::new();
    tc.setup_table();
    let first = tc.create_snapshot();
    let table = tc.cluster.table(&table_name()).unwrap();
    let coordinator = tc.cluster.coordinator();
    let second = coordinator.create_snapshot(&[table.table_id], true).unwrap();
    tabletsnap::wait_for_snapshot_op_done(coordinator, second, wait_options()).unwrap();
    coordinator.drain();

    coordinator.delete_snapshot(first).unwrap();
    wait_for_snapshot_deleted(coordinator, first, wait_options()).unwrap();
    tc.check_all_snapshots(&[(second, SnapshotState::Complete)]);
    assert_eq!(
        tc.cluster.verify_snapshot_files(second, &tc.tablet_ids()).unwrap(),
        NUM_TABLETS * tc.cluster.num_tablet_servers()
    );
}
