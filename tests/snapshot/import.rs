//! Importing exported snapshot metadata

use crate::common::*;
use tabletsnap::{
    wait_for_create_table_done, CatalogManager, NamespaceRecord, SnapshotError, SysRowEntryType,
    TableRecord,
};

#[test]
fn test_import_recreates_dropped_table() {
    let tc = TestCluster::new();
    tc.setup_table();
    let name = table_name();
    tc.cluster.insert_rows(&name, 0..100).unwrap();
    assert!(tc.cluster.catalog().table_exists(&name));

    let snapshot_id = tc.create_snapshot();
    let coordinator = tc.cluster.coordinator();
    let listed = coordinator.list_snapshots(Some(snapshot_id), true).unwrap();
    assert_eq!(listed.snapshots.len(), 1);
    let entries = listed.snapshots[0].entries.clone().unwrap();

    let mut old_namespace_name = None;
    let mut old_table_name = None;
    let mut old_num_tablets = 0;
    for entry in &entries {
        match entry.entry_type {
            SysRowEntryType::Namespace => {
                let record: NamespaceRecord = entry.decode(SysRowEntryType::Namespace).unwrap();
                assert!(old_namespace_name.replace(record.name).is_none());
            }
            SysRowEntryType::Table => {
                let record: TableRecord = entry.decode(SysRowEntryType::Table).unwrap();
                assert!(old_table_name.replace(record.name).is_none());
            }
            SysRowEntryType::Tablet => old_num_tablets += 1,
        }
    }
    let old_namespace_name = old_namespace_name.unwrap();
    let old_table_name = old_table_name.unwrap();

    coordinator.drain();
    tc.cluster.delete_table(&name).unwrap();
    tc.cluster.delete_namespace(&name.namespace_name).unwrap();
    assert!(!tc.cluster.catalog().table_exists(&name));
    assert!(!tc.cluster.catalog().namespace_exists(&name.namespace_name));

    let imported = coordinator.import_snapshot_meta(&entries).unwrap();
    assert_eq!(imported.len(), 1);
    let table_meta = &imported[0];
    assert_ne!(table_meta.namespace.old_id, table_meta.namespace.new_id);
    assert_eq!(
        tc.cluster
            .catalog()
            .namespace_name(&table_meta.namespace.new_id)
            .unwrap(),
        old_namespace_name
    );
    assert_ne!(table_meta.table.old_id, table_meta.table.new_id);
    let info = tc.cluster.catalog().table(&table_meta.table.new_id).unwrap();
    assert_eq!(info.name.table_name, old_table_name);
    assert_eq!(info.tablets.len(), old_num_tablets);
    assert_eq!(table_meta.tablets.len(), old_num_tablets);
    for pair in &table_meta.tablets {
        assert_ne!(pair.old_id, pair.new_id);
    }

    wait_for_create_table_done(coordinator, &name, wait_options()).unwrap();
    assert!(tc.cluster.catalog().table_exists(&name));
    assert!(tc.cluster.catalog().namespace_exists(&name.namespace_name));

    // The recreated table is empty and writable.
    assert!(tc.cluster.scan_table(&name).unwrap().is_empty());
    tc.cluster.insert_rows(&name, 0..10).unwrap();
    assert_eq!(tc.cluster.scan_table(&name).unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_import_over_existing_table_is_rejected() {
    let tc = TestCluster::new();
    tc.setup_table();
    let snapshot_id = tc.create_snapshot();
    let coordinator = tc.cluster.coordinator();
    let entries = coordinator
        .list_snapshots(Some(snapshot_id), true)
        .unwrap()
        .snapshots[0]
        .entries
        .clone()
        .unwrap();

    let err = coordinator.import_snapshot_meta(&entries).unwrap_err();
    assert!(matches!(err, SnapshotError::IllegalState(_)));
    assert!(tc.cluster.catalog().table_exists(&table_name()));
}
