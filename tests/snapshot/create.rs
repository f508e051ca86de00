//! Snapshot creation and listing

use crate::common::*;
use tabletsnap::{SnapshotId, SnapshotState};

#[test]
fn test_create_snapshot_links_files_on_every_replica() {
    let tc = TestCluster::new();
    tc.setup_table();
    tc.cluster.insert_rows(&table_name(), 0..200).unwrap();

    tc.check_all_snapshots(&[]);
    let snapshot_id = tc.create_snapshot();

    // Replicas beyond the first ack may still be running their directive.
    tc.cluster.coordinator().drain();
    let checked = tc
        .cluster
        .verify_snapshot_files(snapshot_id, &tc.tablet_ids())
        .unwrap();
    assert_eq!(checked, NUM_TABLETS * tc.cluster.num_tablet_servers());
}

#[test]
fn test_create_snapshot_of_empty_table() {
    let tc = TestCluster::new();
    tc.setup_table();
    let snapshot_id = tc.create_snapshot();
    tc.cluster.coordinator().drain();
    assert_eq!(
        tc.cluster
            .verify_snapshot_files(snapshot_id, &tc.tablet_ids())
            .unwrap(),
        NUM_TABLETS * tc.cluster.num_tablet_servers()
    );
}

#[test]
fn test_list_with_unknown_id_is_empty() {
    let tc = TestCluster::new();
    tc.setup_table();
    tc.create_snapshot();

    let listed = tc
        .cluster
        .coordinator()
        .list_snapshots(Some(SnapshotId::new()), false)
        .unwrap();
    assert!(listed.snapshots.is_empty());
    assert_eq!(listed.current_snapshot_id, None);
}

#[test]
fn test_list_for_backup_carries_catalog_entries() {
    let tc = TestCluster::new();
    tc.setup_table();
    let snapshot_id = tc.create_snapshot();

    let listed = tc
        .cluster
        .coordinator()
        .list_snapshots(Some(snapshot_id), true)
        .unwrap();
    assert_eq!(listed.snapshots.len(), 1);
    let snapshot = &listed.snapshots[0];
    assert_eq!(snapshot.state, SnapshotState::Complete);
    assert_eq!(snapshot.tablet_ids.len(), NUM_TABLETS);
    // One namespace, one table, one entry per tablet.
    assert_eq!(snapshot.entries.as_ref().unwrap().len(), 2 + NUM_TABLETS);
}

#[test]
fn test_snapshots_survive_coordinator_reload() {
    let tc = TestCluster::new();
    tc.setup_table();
    let first = tc.create_snapshot();
    tc.cluster.insert_rows(&table_name(), 0..50).unwrap();

    let table = tc.cluster.table(&table_name()).unwrap();
    let coordinator = tc.cluster.coordinator();
    let second = coordinator.create_snapshot(&[table.table_id], true).unwrap();
    tabletsnap::wait_for_snapshot_op_done(coordinator, second, wait_options()).unwrap();
    coordinator.drain();

    coordinator.load().unwrap();
    tc.check_all_snapshots(&[
        (first, SnapshotState::Complete),
        (second, SnapshotState::Complete),
    ]);
}
