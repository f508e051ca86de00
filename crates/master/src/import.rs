//! Snapshot metadata import
//!
//! A bundle exported with `list_snapshots(.., prepare_for_backup = true)` is a
//! flat list of `NAMESPACE`, `TABLE` and `TABLET` entries carrying the ids of
//! the source cluster. Import recreates the namespaces and tables under fresh
//! ids and maps every exported tablet to the new table's tablet covering the
//! same partition.
//!
//! The whole bundle is decoded and validated before the catalog is touched.
//! If the catalog still refuses a table part way through, the namespaces and
//! tables this import already created are dropped again.

use crate::catalog::CatalogManager;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tabletsnap_core::{
    NamespaceId, NamespaceRecord, Partition, Result, SnapshotError, SysRowEntry, SysRowEntryType,
    TableId, TableName, TableRecord, TabletId, TabletRecord,
};
use tracing::{info, warn};

/// Mapping of one exported id to its imported replacement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPair<T> {
    /// Id in the exporting cluster
    pub old_id: T,
    /// Id in this cluster
    pub new_id: T,
}

impl<T: PartialEq + fmt::Display> IdPair<T> {
    /// Pair two ids
    ///
    /// # Errors
    /// `IllegalState` if both ids are the same.
    pub fn new(old_id: T, new_id: T) -> Result<Self> {
        if old_id == new_id {
            return Err(SnapshotError::illegal_state(format!(
                "Imported id {} equals its exported id",
                new_id
            )));
        }
        Ok(Self { old_id, new_id })
    }
}

/// Result of importing one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedTable {
    /// Namespace mapping
    pub namespace: IdPair<NamespaceId>,
    /// Table mapping
    pub table: IdPair<TableId>,
    /// Tablet mappings in partition order
    pub tablets: Vec<IdPair<TabletId>>,
    /// Name of the recreated table
    pub table_name: TableName,
}

struct ExportedTable {
    id: TableId,
    record: TableRecord,
    tablets: Vec<(TabletId, Partition)>,
}

struct Bundle {
    namespaces: BTreeMap<NamespaceId, NamespaceRecord>,
    tables: Vec<ExportedTable>,
}

fn decode_bundle(entries: &[SysRowEntry]) -> Result<Bundle> {
    let mut namespaces = BTreeMap::new();
    let mut tables: Vec<ExportedTable> = Vec::new();
    let mut tablets: Vec<(TabletId, TabletRecord)> = Vec::new();
    let mut tablet_ids = BTreeSet::new();

    for entry in entries {
        match entry.entry_type {
            SysRowEntryType::Namespace => {
                let record: NamespaceRecord = entry.decode(SysRowEntryType::Namespace)?;
                let id = NamespaceId::from_string(entry.id.clone());
                if namespaces.insert(id, record).is_some() {
                    return Err(SnapshotError::illegal_state(format!(
                        "Duplicate namespace entry {}",
                        entry.id
                    )));
                }
            }
            SysRowEntryType::Table => {
                let record: TableRecord = entry.decode(SysRowEntryType::Table)?;
                let id = TableId::from_string(entry.id.clone());
                if tables.iter().any(|t| t.id == id) {
                    return Err(SnapshotError::illegal_state(format!(
                        "Duplicate table entry {}",
                        entry.id
                    )));
                }
                tables.push(ExportedTable {
                    id,
                    record,
                    tablets: Vec::new(),
                });
            }
            SysRowEntryType::Tablet => {
                let record: TabletRecord = entry.decode(SysRowEntryType::Tablet)?;
                let id = TabletId::from_string(entry.id.clone());
                if !tablet_ids.insert(id.clone()) {
                    return Err(SnapshotError::illegal_state(format!(
                        "Duplicate tablet entry {}",
                        entry.id
                    )));
                }
                tablets.push((id, record));
            }
        }
    }

    if namespaces.is_empty() {
        return Err(SnapshotError::illegal_state(
            "Snapshot bundle has no NAMESPACE entry",
        ));
    }
    if tables.is_empty() {
        return Err(SnapshotError::illegal_state("Snapshot bundle has no TABLE entry"));
    }

    for (tablet_id, record) in tablets {
        let table = tables
            .iter_mut()
            .find(|t| t.id == record.table_id)
            .ok_or_else(|| {
                SnapshotError::illegal_state(format!(
                    "Tablet {} references table {} missing from the bundle",
                    tablet_id, record.table_id
                ))
            })?;
        table.tablets.push((tablet_id, record.partition));
    }

    for table in &mut tables {
        if !namespaces.contains_key(&table.record.namespace_id) {
            return Err(SnapshotError::illegal_state(format!(
                "Table {} references namespace {} missing from the bundle",
                table.id, table.record.namespace_id
            )));
        }
        if table.tablets.is_empty() {
            return Err(SnapshotError::illegal_state(format!(
                "Table {} has no TABLET entries",
                table.id
            )));
        }
        table.tablets.sort_by(|a, b| a.1.cmp(&b.1));
    }

    Ok(Bundle { namespaces, tables })
}

/// Recreate the namespaces and tables of an exported snapshot
///
/// Returns as soon as table creation has started; poll
/// `is_create_table_done` before using the tables.
///
/// # Errors
/// `IllegalState` if the bundle is malformed, a table of the same name
/// already exists, or a namespace would keep its exported id.
pub fn import_snapshot_meta(
    catalog: &dyn CatalogManager,
    entries: &[SysRowEntry],
) -> Result<Vec<ImportedTable>> {
    let bundle = decode_bundle(entries)?;

    let mut seen = BTreeSet::new();
    for table in &bundle.tables {
        let namespace = &bundle.namespaces[&table.record.namespace_id];
        let name = TableName::new(namespace.name.clone(), table.record.name.clone());
        if catalog.find_table(&name).is_some() || !seen.insert(name.to_string()) {
            return Err(SnapshotError::illegal_state(format!(
                "Table {} already exists",
                name
            )));
        }
    }
    for (old_id, namespace) in &bundle.namespaces {
        if catalog.find_namespace(&namespace.name).as_ref() == Some(old_id) {
            return Err(SnapshotError::illegal_state(format!(
                "Namespace '{}' still has its exported id {}",
                namespace.name, old_id
            )));
        }
    }

    let mut created = Created::default();
    match create_objects(catalog, bundle, &mut created) {
        Ok(imported) => Ok(imported),
        Err(e) => {
            warn!(
                target: "tabletsnap::import",
                error = %e,
                tables = created.tables.len(),
                namespaces = created.namespaces.len(),
                "Import failed, dropping what it created"
            );
            created.roll_back(catalog);
            Err(e)
        }
    }
}

/// Catalog objects created by one import
#[derive(Default)]
struct Created {
    namespaces: Vec<String>,
    tables: Vec<TableName>,
}

impl Created {
    /// Drop tables, then namespaces, newest first
    fn roll_back(self, catalog: &dyn CatalogManager) {
        for name in self.tables.iter().rev() {
            if let Err(e) = catalog.delete_table(name) {
                warn!(target: "tabletsnap::import", table = %name, error = %e, "Could not drop imported table");
            }
        }
        for name in self.namespaces.iter().rev() {
            if let Err(e) = catalog.delete_namespace(name) {
                warn!(target: "tabletsnap::import", namespace = %name, error = %e, "Could not drop imported namespace");
            }
        }
    }
}

fn create_objects(
    catalog: &dyn CatalogManager,
    bundle: Bundle,
    created: &mut Created,
) -> Result<Vec<ImportedTable>> {
    let mut namespace_ids = BTreeMap::new();
    for (old_id, namespace) in &bundle.namespaces {
        let new_id = match catalog.find_namespace(&namespace.name) {
            Some(existing) => existing,
            None => {
                let id = catalog.create_namespace(&namespace.name)?;
                created.namespaces.push(namespace.name.clone());
                id
            }
        };
        namespace_ids.insert(old_id.clone(), IdPair::new(old_id.clone(), new_id)?);
    }

    let mut imported = Vec::with_capacity(bundle.tables.len());
    for table in bundle.tables {
        let namespace = namespace_ids[&table.record.namespace_id].clone();
        let partitions = table.tablets.iter().map(|(_, p)| p.clone()).collect();
        let new_table = catalog.create_table(
            &namespace.new_id,
            &table.record.name,
            table.record.schema.clone(),
            partitions,
        )?;
        created.tables.push(new_table.name.clone());
        if new_table.tablets.len() != table.tablets.len() {
            return Err(SnapshotError::illegal_state(format!(
                "Table {} was created with {} tablets, expected {}",
                new_table.name,
                new_table.tablets.len(),
                table.tablets.len()
            )));
        }

        let tablets = table
            .tablets
            .into_iter()
            .zip(new_table.tablets.iter())
            .map(|((old_id, _), new)| IdPair::new(old_id, new.tablet_id.clone()))
            .collect::<Result<Vec<_>>>()?;

        info!(
            target: "tabletsnap::import",
            table = %new_table.name,
            old_table_id = %table.id,
            new_table_id = %new_table.table_id,
            tablets = tablets.len(),
            "Imported table"
        );
        imported.push(ImportedTable {
            namespace,
            table: IdPair::new(table.id, new_table.table_id)?,
            tablets,
            table_name: new_table.name,
        });
    }
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{schema, CountingProvisioner};
    use crate::catalog::InMemoryCatalog;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tabletsnap_core::TableSchema;

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::new(Arc::new(CountingProvisioner::default()), Duration::ZERO)
    }

    fn bundle(tablets: usize) -> Vec<SysRowEntry> {
        let ns_id = NamespaceId::generate();
        let table_id = TableId::generate();
        let mut entries = vec![
            SysRowEntry::namespace(
                &ns_id,
                &NamespaceRecord {
                    name: "my_keyspace".into(),
                },
            )
            .unwrap(),
            SysRowEntry::table(
                &table_id,
                &TableRecord {
                    name: "testtb".into(),
                    namespace_id: ns_id,
                    schema: schema(),
                },
            )
            .unwrap(),
        ];
        // Reverse order: import must sort by partition.
        for partition in Partition::split_hash_space(tablets).into_iter().rev() {
            entries.push(
                SysRowEntry::tablet(
                    &TabletId::generate(),
                    &TabletRecord {
                        table_id: table_id.clone(),
                        partition,
                    },
                )
                .unwrap(),
            );
        }
        entries
    }

    #[test]
    fn test_import_maps_every_id() {
        let catalog = catalog();
        let entries = bundle(3);
        let imported = import_snapshot_meta(&catalog, &entries).unwrap();
        assert_eq!(imported.len(), 1);

        let table = &imported[0];
        assert_ne!(table.namespace.old_id, table.namespace.new_id);
        assert_ne!(table.table.old_id, table.table.new_id);
        assert_eq!(table.tablets.len(), 3);
        assert_eq!(table.table_name, TableName::new("my_keyspace", "testtb"));

        // Tablet pairs follow partition order on both sides.
        let info = catalog.table(&table.table.new_id).unwrap();
        let new_ids: Vec<_> = table.tablets.iter().map(|p| p.new_id.clone()).collect();
        let expected: Vec<_> = info.tablets.iter().map(|t| t.tablet_id.clone()).collect();
        assert_eq!(new_ids, expected);
        assert_eq!(table.tablets[0].old_id.as_str(), entries[4].id);
    }

    #[test]
    fn test_existing_namespace_is_reused() {
        let catalog = catalog();
        let ns = catalog.create_namespace("my_keyspace").unwrap();
        let imported = import_snapshot_meta(&catalog, &bundle(1)).unwrap();
        assert_eq!(imported[0].namespace.new_id, ns);
    }

    #[test]
    fn test_existing_table_is_rejected() {
        let catalog = catalog();
        import_snapshot_meta(&catalog, &bundle(2)).unwrap();
        let err = import_snapshot_meta(&catalog, &bundle(2)).unwrap_err();
        assert!(matches!(err, SnapshotError::IllegalState(_)));
    }

    #[test]
    fn test_missing_namespace_or_table_is_rejected() {
        let catalog = catalog();
        let entries = bundle(1);

        let no_namespace: Vec<_> = entries[1..].to_vec();
        let err = import_snapshot_meta(&catalog, &no_namespace).unwrap_err();
        assert!(matches!(err, SnapshotError::IllegalState(_)));

        let no_table: Vec<_> = entries
            .iter()
            .filter(|e| e.entry_type != SysRowEntryType::Table)
            .cloned()
            .collect();
        let err = import_snapshot_meta(&catalog, &no_table).unwrap_err();
        assert!(matches!(err, SnapshotError::IllegalState(_)));

        // Nothing was created by the failed imports.
        assert!(catalog.find_namespace("my_keyspace").is_none());
    }

    #[test]
    fn test_duplicate_and_dangling_entries_are_rejected() {
        let catalog = catalog();
        let mut duplicated = bundle(1);
        duplicated.push(duplicated[0].clone());
        assert!(matches!(
            import_snapshot_meta(&catalog, &duplicated).unwrap_err(),
            SnapshotError::IllegalState(_)
        ));

        let mut dangling = bundle(1);
        dangling.push(
            SysRowEntry::tablet(
                &TabletId::generate(),
                &TabletRecord {
                    table_id: TableId::generate(),
                    partition: Partition::split_hash_space(1).remove(0),
                },
            )
            .unwrap(),
        );
        assert!(matches!(
            import_snapshot_meta(&catalog, &dangling).unwrap_err(),
            SnapshotError::IllegalState(_)
        ));

        let mut garbled = bundle(1);
        garbled[1].data = vec![0xC1];
        assert!(matches!(
            import_snapshot_meta(&catalog, &garbled).unwrap_err(),
            SnapshotError::IllegalState(_)
        ));
    }

    /// Catalog that refuses every table after the first
    struct CrowdedCatalog {
        inner: InMemoryCatalog,
        tables_left: AtomicUsize,
    }

    impl CatalogManager for CrowdedCatalog {
        fn table(&self, table_id: &TableId) -> Result<crate::catalog::TableInfo> {
            self.inner.table(table_id)
        }
        fn find_table(&self, name: &TableName) -> Option<crate::catalog::TableInfo> {
            self.inner.find_table(name)
        }
        fn find_namespace(&self, name: &str) -> Option<NamespaceId> {
            self.inner.find_namespace(name)
        }
        fn namespace_name(&self, namespace_id: &NamespaceId) -> Result<String> {
            self.inner.namespace_name(namespace_id)
        }
        fn create_namespace(&self, name: &str) -> Result<NamespaceId> {
            self.inner.create_namespace(name)
        }
        fn create_table(
            &self,
            namespace_id: &NamespaceId,
            table_name: &str,
            schema: TableSchema,
            partitions: Vec<Partition>,
        ) -> Result<crate::catalog::TableInfo> {
            let left = self
                .tables_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if left.is_err() {
                return Err(SnapshotError::service_unavailable("table quota exhausted"));
            }
            self.inner.create_table(namespace_id, table_name, schema, partitions)
        }
        fn is_create_table_done(&self, name: &TableName) -> Result<bool> {
            self.inner.is_create_table_done(name)
        }
        fn delete_table(&self, name: &TableName) -> Result<()> {
            self.inner.delete_table(name)
        }
        fn delete_namespace(&self, name: &str) -> Result<()> {
            self.inner.delete_namespace(name)
        }
    }

    #[test]
    fn test_failed_table_rolls_back_whole_import() {
        let catalog = CrowdedCatalog {
            inner: catalog(),
            tables_left: AtomicUsize::new(1),
        };
        let mut entries = bundle(2);
        let ns_id = NamespaceId::from_string(entries[0].id.clone());
        let second_table = TableId::generate();
        entries.push(
            SysRowEntry::table(
                &second_table,
                &TableRecord {
                    name: "othertb".into(),
                    namespace_id: ns_id,
                    schema: schema(),
                },
            )
            .unwrap(),
        );
        entries.push(
            SysRowEntry::tablet(
                &TabletId::generate(),
                &TabletRecord {
                    table_id: second_table,
                    partition: Partition::split_hash_space(1).remove(0),
                },
            )
            .unwrap(),
        );

        let err = import_snapshot_meta(&catalog, &entries).unwrap_err();
        assert!(err.is_service_unavailable());
        assert!(!catalog.inner.table_exists(&TableName::new("my_keyspace", "testtb")));
        assert!(!catalog.inner.table_exists(&TableName::new("my_keyspace", "othertb")));
        assert!(catalog.find_namespace("my_keyspace").is_none());
    }

    #[test]
    fn test_rollback_keeps_namespace_that_already_existed() {
        let catalog = CrowdedCatalog {
            inner: catalog(),
            tables_left: AtomicUsize::new(0),
        };
        let ns = catalog.create_namespace("my_keyspace").unwrap();
        assert!(import_snapshot_meta(&catalog, &bundle(1)).is_err());
        assert_eq!(catalog.find_namespace("my_keyspace"), Some(ns));
    }

    #[test]
    fn test_id_pair_rejects_equal_ids() {
        let id = TableId::generate();
        assert!(IdPair::new(id.clone(), id).is_err());
    }
}
