//! Restoring a table to a snapshot

use crate::common::*;
use tabletsnap::{
    wait_for_restoration_done, RestorationId, RestorationState, SnapshotConfig, SnapshotError,
    SnapshotState,
};

#[test]
fn test_restore_rewinds_table_to_snapshot() {
    let tc = TestCluster::new();
    tc.setup_table();
    let name = table_name();

    tc.cluster.insert_rows(&name, 0..100).unwrap();
    tc.check_all_snapshots(&[]);
    let snapshot_id = tc.create_snapshot();
    tc.cluster.coordinator().drain();

    tc.cluster.insert_rows(&name, 100..200).unwrap();
    assert_eq!(tc.cluster.scan_table(&name).unwrap().len(), 200);

    let coordinator = tc.cluster.coordinator();
    let restoration_id = coordinator.restore_snapshot(snapshot_id).unwrap();
    let outcome = wait_for_restoration_done(coordinator, restoration_id, wait_options()).unwrap();
    assert_eq!(outcome.state, RestorationState::Restored);
    assert_eq!(outcome.unavailable_polls, 0);

    // RESTORED means every replica rolled back, so no drain is needed.
    tc.check_all_snapshots(&[(snapshot_id, SnapshotState::Complete)]);
    let keys = tc.cluster.scan_table(&name).unwrap();
    assert_eq!(keys, (0..100).collect::<Vec<_>>());
}

#[test]
fn test_writes_after_restore_are_kept() {
    let tc = TestCluster::new();
    tc.setup_table();
    let name = table_name();

    tc.cluster.insert_rows(&name, 0..20).unwrap();
    let snapshot_id = tc.create_snapshot();
    tc.cluster.coordinator().drain();
    tc.cluster.insert_rows(&name, 20..40).unwrap();

    let coordinator = tc.cluster.coordinator();
    let restoration_id = coordinator.restore_snapshot(snapshot_id).unwrap();
    wait_for_restoration_done(coordinator, restoration_id, wait_options()).unwrap();
    coordinator.drain();

    tc.cluster.insert_rows(&name, 1000..1010).unwrap();
    let keys = tc.cluster.scan_table(&name).unwrap();
    let expected: Vec<i32> = (0..20).chain(1000..1010).collect();
    assert_eq!(keys, expected);
}

#[test]
fn test_restorations_are_listed() {
    let tc = TestCluster::new();
    tc.setup_table();
    let snapshot_id = tc.create_snapshot();
    tc.cluster.coordinator().drain();

    let coordinator = tc.cluster.coordinator();
    let restoration_id = coordinator.restore_snapshot(snapshot_id).unwrap();
    wait_for_restoration_done(coordinator, restoration_id, wait_options()).unwrap();

    let all = coordinator.list_snapshot_restorations(None).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, restoration_id);
    assert_eq!(all[0].snapshot_id, snapshot_id);
    assert_eq!(all[0].tablets_done, NUM_TABLETS);

    let err = coordinator
        .list_snapshot_restorations(Some(RestorationId::nil()))
        .unwrap_err();
    assert!(matches!(err, SnapshotError::InvalidArgument(_)));
}

#[test]
fn test_restore_reaches_replica_that_missed_the_snapshot() {
    let tc = TestCluster::new();
    tc.setup_table();
    let name = table_name();
    tc.cluster.insert_rows(&name, 0..100).unwrap();

    tc.cluster.stop_tablet_server(0).unwrap();
    let snapshot_id = tc.create_snapshot();
    // ts-0 catches up by log replay and leads again.
    tc.cluster.start_tablet_server(0).unwrap();
    tc.cluster.insert_rows(&name, 100..200).unwrap();

    let coordinator = tc.cluster.coordinator();
    let restoration_id = coordinator.restore_snapshot(snapshot_id).unwrap();
    let outcome = wait_for_restoration_done(coordinator, restoration_id, wait_options()).unwrap();
    assert_eq!(outcome.state, RestorationState::Restored);

    let info = &coordinator
        .list_snapshot_restorations(Some(restoration_id))
        .unwrap()[0];
    assert_eq!(info.tablets_done, NUM_TABLETS);
    assert!(info.inconsistent_tablets.is_empty());
    assert_eq!(tc.cluster.scan_table(&name).unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_restore_fails_when_a_replica_lacks_the_snapshot() {
    let tc = TestCluster::new();
    tc.setup_table();
    let name = table_name();
    tc.cluster.insert_rows(&name, 0..100).unwrap();
    let snapshot_id = tc.create_snapshot();
    tc.cluster.coordinator().drain();
    tc.cluster.insert_rows(&name, 100..200).unwrap();

    let tablet_ids = tc.tablet_ids();
    let damaged = &tablet_ids[0];
    let ts0 = tc.cluster.tablet_server(0).unwrap();
    ts0.replica(damaged)
        .unwrap()
        .snapshots()
        .delete_local_snapshot(snapshot_id)
        .unwrap();

    let coordinator = tc.cluster.coordinator();
    let restoration_id = coordinator.restore_snapshot(snapshot_id).unwrap();
    let outcome = wait_for_restoration_done(coordinator, restoration_id, wait_options()).unwrap();
    assert_eq!(outcome.state, RestorationState::Failed);
    coordinator.drain();

    let info = &coordinator
        .list_snapshot_restorations(Some(restoration_id))
        .unwrap()[0];
    assert_eq!(info.state, RestorationState::Failed);
    assert_eq!(info.tablets_done, NUM_TABLETS - 1);
    assert_eq!(info.tablets_failed, 1);
    assert_eq!(info.inconsistent_tablets, vec![damaged.clone()]);

    // The marked tablet really diverges: ts-0 kept its rows, ts-1 rolled back.
    let ts1 = tc.cluster.tablet_server(1).unwrap();
    let kept = ts0.replica(damaged).unwrap().scan().unwrap().len();
    let rolled_back = ts1.replica(damaged).unwrap().scan().unwrap().len();
    assert!(kept > rolled_back);
}

#[test]
fn test_restore_with_stopped_replica_is_marked_failed() {
    let config = SnapshotConfig::for_testing().with_directive_deadline_ms(1_000);
    let tc = TestCluster::with_config(config);
    tc.setup_table();
    let name = table_name();
    tc.cluster.insert_rows(&name, 0..100).unwrap();
    let snapshot_id = tc.create_snapshot();
    tc.cluster.coordinator().drain();
    tc.cluster.insert_rows(&name, 100..200).unwrap();

    tc.cluster.stop_tablet_server(2).unwrap();
    let coordinator = tc.cluster.coordinator();
    let restoration_id = coordinator.restore_snapshot(snapshot_id).unwrap();
    let outcome = wait_for_restoration_done(coordinator, restoration_id, wait_options()).unwrap();
    assert_eq!(outcome.state, RestorationState::Failed);

    // The running replicas rolled back long before ts-2 ran out of retries.
    assert_eq!(tc.cluster.scan_table(&name).unwrap(), (0..100).collect::<Vec<_>>());

    coordinator.drain();
    let info = &coordinator
        .list_snapshot_restorations(Some(restoration_id))
        .unwrap()[0];
    assert_eq!(info.tablets_done, 0);
    assert_eq!(info.tablets_failed, NUM_TABLETS);
    let mut inconsistent = info.inconsistent_tablets.clone();
    inconsistent.sort();
    let mut expected = tc.tablet_ids();
    expected.sort();
    assert_eq!(inconsistent, expected);
}
