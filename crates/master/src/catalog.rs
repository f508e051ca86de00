//! Catalog manager seam and an in-memory catalog
//!
//! The coordinator resolves tables to tablets and tablets to replicas through
//! `CatalogManager` and `ReplicaLocator`. `InMemoryCatalog` implements both.
//! Like a real catalog, it creates tables asynchronously: `create_table`
//! returns ids immediately, and the tablets are provisioned on a background
//! thread. `is_create_table_done` reports when the table is usable. A table
//! whose tablets cannot be provisioned is removed again, and asking about it
//! afterwards answers with the provisioning error.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tabletsnap_core::{
    NamespaceId, Partition, Result, SnapshotError, TableId, TableName, TableSchema, TabletId,
    TabletService,
};
use tracing::{info, warn};

/// One tablet of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletInfo {
    /// Tablet id
    pub tablet_id: TabletId,
    /// Key range
    pub partition: Partition,
}

/// A table as the catalog knows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    /// Table id
    pub table_id: TableId,
    /// Namespace and table name
    pub name: TableName,
    /// Owning namespace
    pub namespace_id: NamespaceId,
    /// Column layout
    pub schema: TableSchema,
    /// Tablets ordered by partition start key
    pub tablets: Vec<TabletInfo>,
    /// Creation has finished and the tablets are serving
    pub running: bool,
}

/// Catalog operations the coordinator needs
pub trait CatalogManager: Send + Sync {
    /// Look up a table by id
    fn table(&self, table_id: &TableId) -> Result<TableInfo>;

    /// Look up a table by name
    fn find_table(&self, name: &TableName) -> Option<TableInfo>;

    /// Look up a namespace id by name
    fn find_namespace(&self, name: &str) -> Option<NamespaceId>;

    /// Name of a namespace
    fn namespace_name(&self, namespace_id: &NamespaceId) -> Result<String>;

    /// Create a namespace
    fn create_namespace(&self, name: &str) -> Result<NamespaceId>;

    /// Start creating a table with the given partitions
    ///
    /// Returns the new table's info with tablets in partition order. The
    /// table is not usable until `is_create_table_done` reports true.
    fn create_table(
        &self,
        namespace_id: &NamespaceId,
        table_name: &str,
        schema: TableSchema,
        partitions: Vec<Partition>,
    ) -> Result<TableInfo>;

    /// Whether creation of the named table has finished
    ///
    /// # Errors
    /// * `NotFound` - no such table
    /// * `IllegalState` - creation failed and the table was rolled back
    fn is_create_table_done(&self, name: &TableName) -> Result<bool>;

    /// Drop a table and its tablets
    fn delete_table(&self, name: &TableName) -> Result<()>;

    /// Drop an empty namespace
    fn delete_namespace(&self, name: &str) -> Result<()>;
}

/// Finds the replicas of a tablet
pub trait ReplicaLocator: Send + Sync {
    /// Services hosting a replica of `tablet_id`
    fn replicas(&self, tablet_id: &TabletId) -> Result<Vec<Arc<dyn TabletService>>>;
}

/// Places and removes tablet replicas on tablet servers
pub trait TabletProvisioner: Send + Sync {
    /// Open replicas of a new tablet; returns the hosting services
    fn provision(&self, tablet_id: &TabletId) -> Result<Vec<Arc<dyn TabletService>>>;

    /// Drop every replica of a tablet
    fn drop_tablet(&self, tablet_id: &TabletId) -> Result<()>;
}

#[derive(Default)]
struct CatalogState {
    namespaces: BTreeMap<NamespaceId, String>,
    tables: BTreeMap<TableId, TableInfo>,
    replicas: BTreeMap<TabletId, Vec<Arc<dyn TabletService>>>,
    /// Tables whose creation failed, with the reason
    failed_creates: BTreeMap<TableId, (TableName, String)>,
}

impl CatalogState {
    fn create_failure(&self, table_id: &TableId) -> Option<SnapshotError> {
        self.failed_creates.get(table_id).map(|(name, reason)| {
            SnapshotError::illegal_state(format!("Creating table {} failed: {}", name, reason))
        })
    }
}

struct CatalogShared {
    state: Mutex<CatalogState>,
    created: Condvar,
    provisioner: Arc<dyn TabletProvisioner>,
    create_delay: Duration,
}

/// Catalog kept in memory
#[derive(Clone)]
pub struct InMemoryCatalog {
    shared: Arc<CatalogShared>,
}

impl InMemoryCatalog {
    /// Catalog that provisions tablets through `provisioner`
    ///
    /// `create_delay` is how long table creation takes before tablets are
    /// provisioned.
    pub fn new(provisioner: Arc<dyn TabletProvisioner>, create_delay: Duration) -> Self {
        Self {
            shared: Arc::new(CatalogShared {
                state: Mutex::new(CatalogState::default()),
                created: Condvar::new(),
                provisioner,
                create_delay,
            }),
        }
    }

    /// Whether a table of that name exists (running or being created)
    pub fn table_exists(&self, name: &TableName) -> bool {
        self.find_table(name).is_some()
    }

    /// Whether a namespace of that name exists
    pub fn namespace_exists(&self, name: &str) -> bool {
        self.find_namespace(name).is_some()
    }

    /// Block until the table is running or `timeout` passes
    pub fn wait_table_running(&self, table_id: &TableId, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            match state.tables.get(table_id) {
                Some(table) if table.running => return Ok(()),
                Some(_) => {}
                None => {
                    return Err(state.create_failure(table_id).unwrap_or_else(|| {
                        SnapshotError::not_found(format!("Table {} not found", table_id))
                    }))
                }
            }
            if self
                .shared
                .created
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(SnapshotError::timeout(format!(
                    "Table {} not running after {:?}",
                    table_id, timeout
                )));
            }
        }
    }

    fn finish_create(shared: &CatalogShared, table_id: &TableId) {
        let tablets = match shared.state.lock().tables.get(table_id) {
            Some(table) => table.tablets.clone(),
            None => return,
        };
        let mut placed = Vec::with_capacity(tablets.len());
        for tablet in &tablets {
            match shared.provisioner.provision(&tablet.tablet_id) {
                Ok(services) => placed.push((tablet.tablet_id.clone(), services)),
                Err(e) => {
                    warn!(
                        target: "tabletsnap::master",
                        %table_id,
                        tablet_id = %tablet.tablet_id,
                        error = %e,
                        "Tablet provisioning failed, rolling back table"
                    );
                    for (tablet_id, _) in &placed {
                        let _ = shared.provisioner.drop_tablet(tablet_id);
                    }
                    let mut state = shared.state.lock();
                    if let Some(table) = state.tables.remove(table_id) {
                        state
                            .failed_creates
                            .insert(table_id.clone(), (table.name, e.to_string()));
                    }
                    shared.created.notify_all();
                    return;
                }
            }
        }

        let mut state = shared.state.lock();
        // The table may have been dropped while its tablets were placed.
        if !state.tables.contains_key(table_id) {
            drop(state);
            for (tablet_id, _) in placed {
                let _ = shared.provisioner.drop_tablet(&tablet_id);
            }
            return;
        }
        for (tablet_id, services) in placed {
            state.replicas.insert(tablet_id, services);
        }
        if let Some(table) = state.tables.get_mut(table_id) {
            table.running = true;
            info!(
                target: "tabletsnap::master",
                %table_id,
                table = %table.name,
                tablets = table.tablets.len(),
                "Table created"
            );
        }
        shared.created.notify_all();
    }
}

impl CatalogManager for InMemoryCatalog {
    fn table(&self, table_id: &TableId) -> Result<TableInfo> {
        self.shared
            .state
            .lock()
            .tables
            .get(table_id)
            .cloned()
            .ok_or_else(|| SnapshotError::not_found(format!("Table {} not found", table_id)))
    }

    fn find_table(&self, name: &TableName) -> Option<TableInfo> {
        self.shared
            .state
            .lock()
            .tables
            .values()
            .find(|t| &t.name == name)
            .cloned()
    }

    fn find_namespace(&self, name: &str) -> Option<NamespaceId> {
        self.shared
            .state
            .lock()
            .namespaces
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| id.clone())
    }

    fn namespace_name(&self, namespace_id: &NamespaceId) -> Result<String> {
        self.shared
            .state
            .lock()
            .namespaces
            .get(namespace_id)
            .cloned()
            .ok_or_else(|| {
                SnapshotError::not_found(format!("Namespace {} not found", namespace_id))
            })
    }

    fn create_namespace(&self, name: &str) -> Result<NamespaceId> {
        let mut state = self.shared.state.lock();
        if state.namespaces.values().any(|n| n == name) {
            return Err(SnapshotError::illegal_state(format!(
                "Namespace '{}' already exists",
                name
            )));
        }
        let id = NamespaceId::generate();
        state.namespaces.insert(id.clone(), name.to_string());
        info!(target: "tabletsnap::master", namespace_id = %id, name, "Namespace created");
        Ok(id)
    }

    fn create_table(
        &self,
        namespace_id: &NamespaceId,
        table_name: &str,
        schema: TableSchema,
        mut partitions: Vec<Partition>,
    ) -> Result<TableInfo> {
        if partitions.is_empty() {
            return Err(SnapshotError::invalid_argument(format!(
                "Table '{}' needs at least one tablet",
                table_name
            )));
        }
        partitions.sort();

        let table = {
            let mut state = self.shared.state.lock();
            let namespace_name = state.namespaces.get(namespace_id).cloned().ok_or_else(|| {
                SnapshotError::not_found(format!("Namespace {} not found", namespace_id))
            })?;
            let name = TableName::new(namespace_name, table_name);
            if state.tables.values().any(|t| t.name == name) {
                return Err(SnapshotError::illegal_state(format!(
                    "Table {} already exists",
                    name
                )));
            }
            let table = TableInfo {
                table_id: TableId::generate(),
                name,
                namespace_id: namespace_id.clone(),
                schema,
                tablets: partitions
                    .into_iter()
                    .map(|partition| TabletInfo {
                        tablet_id: TabletId::generate(),
                        partition,
                    })
                    .collect(),
                running: false,
            };
            state.failed_creates.retain(|_, (failed, _)| *failed != table.name);
            state.tables.insert(table.table_id.clone(), table.clone());
            table
        };

        let shared = Arc::clone(&self.shared);
        let table_id = table.table_id.clone();
        let spawned = std::thread::Builder::new()
            .name("tabletsnap-create-table".to_string())
            .spawn(move || {
                std::thread::sleep(shared.create_delay);
                InMemoryCatalog::finish_create(&shared, &table_id);
            });
        if let Err(e) = spawned {
            self.shared.state.lock().tables.remove(&table.table_id);
            return Err(e.into());
        }
        Ok(table)
    }

    fn is_create_table_done(&self, name: &TableName) -> Result<bool> {
        let state = self.shared.state.lock();
        if let Some(table) = state.tables.values().find(|t| &t.name == name) {
            return Ok(table.running);
        }
        match state.failed_creates.values().find(|(failed, _)| failed == name) {
            Some((_, reason)) => Err(SnapshotError::illegal_state(format!(
                "Creating table {} failed: {}",
                name, reason
            ))),
            None => Err(SnapshotError::not_found(format!("Table {} not found", name))),
        }
    }

    fn delete_table(&self, name: &TableName) -> Result<()> {
        let tablets = {
            let mut state = self.shared.state.lock();
            let table_id = state
                .tables
                .values()
                .find(|t| &t.name == name)
                .map(|t| t.table_id.clone())
                .ok_or_else(|| SnapshotError::not_found(format!("Table {} not found", name)))?;
            let table = state
                .tables
                .remove(&table_id)
                .ok_or_else(|| SnapshotError::not_found(format!("Table {} not found", name)))?;
            for tablet in &table.tablets {
                state.replicas.remove(&tablet.tablet_id);
            }
            table.tablets
        };
        for tablet in &tablets {
            self.shared.provisioner.drop_tablet(&tablet.tablet_id)?;
        }
        info!(target: "tabletsnap::master", table = %name, "Table deleted");
        Ok(())
    }

    fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        let id = state
            .namespaces
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| SnapshotError::not_found(format!("Namespace '{}' not found", name)))?;
        if state.tables.values().any(|t| t.namespace_id == id) {
            return Err(SnapshotError::illegal_state(format!(
                "Namespace '{}' is not empty",
                name
            )));
        }
        state.namespaces.remove(&id);
        info!(target: "tabletsnap::master", namespace_id = %id, name, "Namespace deleted");
        Ok(())
    }
}

impl ReplicaLocator for InMemoryCatalog {
    fn replicas(&self, tablet_id: &TabletId) -> Result<Vec<Arc<dyn TabletService>>> {
        self.shared
            .state
            .lock()
            .replicas
            .get(tablet_id)
            .cloned()
            .ok_or_else(|| {
                SnapshotError::not_found(format!("Tablet {} has no replicas", tablet_id))
            })
    }
}
