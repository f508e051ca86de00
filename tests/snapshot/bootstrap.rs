//! Snapshots reaching a replica that was down while they were taken

use crate::common::*;
use std::time::Duration;
use tabletsnap::SnapshotConfig;

const RETENTION_SECS: u64 = 2;

#[test]
fn test_snapshot_survives_remote_bootstrap() {
    let config = SnapshotConfig::for_testing()
        .with_log_retention_secs(RETENTION_SECS)
        .with_directive_deadline_ms(1_000);
    let tc = TestCluster::with_config(config);
    let name = table_name();

    // ts-0 misses everything, so it needs remote bootstrap after its start.
    tc.cluster.stop_tablet_server(0).unwrap();
    tc.setup_table();
    tc.cluster.insert_rows(&name, 0..1000).unwrap();
    let snapshot_id = tc.create_snapshot();

    std::thread::sleep(Duration::from_secs(RETENTION_SECS).mul_f64(1.1));
    // Directives to the stopped server give up at their deadline.
    tc.cluster.coordinator().drain();

    tc.cluster.flush_tablets().unwrap();
    assert!(tc.cluster.clean_tablet_logs().unwrap() > 0);

    tc.cluster.start_tablet_server(0).unwrap();
    assert!(tc.cluster.tablet_server(0).unwrap().is_running());

    let checked = tc
        .cluster
        .verify_snapshot_files(snapshot_id, &tc.tablet_ids())
        .unwrap();
    assert_eq!(checked, NUM_TABLETS * tc.cluster.num_tablet_servers());

    // ts-0 leads again and serves the bootstrapped rows.
    assert_eq!(tc.cluster.scan_table(&name).unwrap(), (0..1000).collect::<Vec<_>>());
}

#[test]
fn test_snapshot_reaches_replica_through_log_replay() {
    let config = SnapshotConfig::for_testing().with_directive_deadline_ms(1_000);
    let tc = TestCluster::with_config(config);
    let name = table_name();
    tc.setup_table();
    tc.cluster.insert_rows(&name, 0..100).unwrap();

    tc.cluster.stop_tablet_server(0).unwrap();
    tc.cluster.insert_rows(&name, 100..150).unwrap();
    let snapshot_id = tc.create_snapshot();
    tc.cluster.insert_rows(&name, 150..200).unwrap();
    tc.cluster.coordinator().drain();

    // The log is intact, so ts-0 catches up by replay alone.
    tc.cluster.start_tablet_server(0).unwrap();
    let checked = tc
        .cluster
        .verify_snapshot_files(snapshot_id, &tc.tablet_ids())
        .unwrap();
    assert_eq!(checked, NUM_TABLETS * tc.cluster.num_tablet_servers());

    let server = tc.cluster.tablet_server(0).unwrap();
    let mut rows = 0;
    for tablet_id in tc.tablet_ids() {
        let replica = server.replica(&tablet_id).unwrap();
        replica.restore_snapshot(snapshot_id).unwrap();
        rows += replica.scan().unwrap().len();
    }
    assert_eq!(rows, 150);
}
