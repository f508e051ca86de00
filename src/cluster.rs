//! In-process mini cluster
//!
//! Wires a set of `TabletServer`s, an `InMemoryCatalog` and a
//! `SnapshotCoordinator` together so the whole snapshot protocol can be
//! driven from a test: create tables, write rows, stop and restart servers,
//! garbage collect logs, take and restore snapshots.
//!
//! Rows are `i32` keys stored big-endian. A row lives in the tablet whose
//! partition holds the 16-bit hash of its key. Writes go through the first
//! running replica of the tablet, which acts as leader, and are replicated
//! to every other running replica before they commit.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabletsnap_core::{
    ColumnSchema, DataType, NamespaceId, Partition, Result, SnapshotConfig, SnapshotError,
    SnapshotId, TableName, TableSchema, TabletId, TabletService,
};
use tabletsnap_master::{
    wait_for_create_table_done, CatalogManager, InMemoryCatalog, SnapshotCoordinator, TableInfo,
    TabletProvisioner, WaitOptions,
};
use tabletsnap_tablet::{
    file_inode, has_checkpoint_files, is_manifest_file, is_sst_file, remote_bootstrap,
    TabletReplica, TabletServer,
};
use tracing::{debug, info};

/// Mini cluster settings
#[derive(Debug, Clone)]
pub struct MiniClusterOptions {
    /// Tablet servers, each hosting a replica of every tablet
    pub num_tablet_servers: usize,
    /// Snapshot configuration
    pub config: SnapshotConfig,
    /// How long the catalog takes to create a table
    pub create_table_delay: Duration,
}

impl Default for MiniClusterOptions {
    fn default() -> Self {
        Self {
            num_tablet_servers: 3,
            config: SnapshotConfig::for_testing(),
            create_table_delay: Duration::from_millis(20),
        }
    }
}

/// Places a replica of every tablet on every server
struct ClusterPlacement {
    servers: Vec<Arc<TabletServer>>,
}

impl TabletProvisioner for ClusterPlacement {
    fn provision(&self, tablet_id: &TabletId) -> Result<Vec<Arc<dyn TabletService>>> {
        let mut services: Vec<Arc<dyn TabletService>> = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            server.add_tablet(tablet_id)?;
            services.push(Arc::clone(server) as Arc<dyn TabletService>);
        }
        Ok(services)
    }

    fn drop_tablet(&self, tablet_id: &TabletId) -> Result<()> {
        for server in &self.servers {
            server.remove_tablet(tablet_id)?;
        }
        Ok(())
    }
}

/// Tablet servers, catalog and coordinator in one process
pub struct MiniCluster {
    data_dir: PathBuf,
    config: SnapshotConfig,
    servers: Vec<Arc<TabletServer>>,
    catalog: InMemoryCatalog,
    coordinator: SnapshotCoordinator,
    writes: Mutex<()>,
}

impl MiniCluster {
    /// Start a cluster under `data_dir`
    pub fn start(data_dir: impl AsRef<Path>, options: MiniClusterOptions) -> Result<Self> {
        if options.num_tablet_servers == 0 {
            return Err(SnapshotError::invalid_argument(
                "A cluster needs at least one tablet server",
            ));
        }
        let data_dir = data_dir.as_ref().to_path_buf();
        let wait_timeout = options.config.consensus_wait_timeout();
        let servers = (0..options.num_tablet_servers)
            .map(|i| {
                let id = format!("ts-{}", i);
                let dir = data_dir.join(&id);
                TabletServer::new(id, dir, wait_timeout).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let placement = Arc::new(ClusterPlacement {
            servers: servers.clone(),
        });
        let catalog = InMemoryCatalog::new(placement, options.create_table_delay);
        let coordinator = SnapshotCoordinator::open(
            options.config.clone(),
            Some(&data_dir.join("master")),
            Arc::new(catalog.clone()),
            Arc::new(catalog.clone()),
        )?;

        info!(
            target: "tabletsnap::cluster",
            servers = servers.len(),
            dir = %data_dir.display(),
            "Mini cluster started"
        );
        Ok(Self {
            data_dir,
            config: options.config,
            servers,
            catalog,
            coordinator,
            writes: Mutex::new(()),
        })
    }

    /// Root data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The snapshot coordinator
    pub fn coordinator(&self) -> &SnapshotCoordinator {
        &self.coordinator
    }

    /// The catalog
    pub fn catalog(&self) -> &InMemoryCatalog {
        &self.catalog
    }

    /// Number of tablet servers
    pub fn num_tablet_servers(&self) -> usize {
        self.servers.len()
    }

    /// Tablet server `index`
    pub fn tablet_server(&self, index: usize) -> Result<&Arc<TabletServer>> {
        self.servers
            .get(index)
            .ok_or_else(|| SnapshotError::not_found(format!("No tablet server {}", index)))
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// Create a hash-partitioned table and wait until it is running
    ///
    /// The namespace is created when missing.
    pub fn create_table(&self, name: &TableName, num_tablets: usize) -> Result<TableInfo> {
        let namespace_id = match self.catalog.find_namespace(&name.namespace_name) {
            Some(id) => id,
            None => self.catalog.create_namespace(&name.namespace_name)?,
        };
        self.create_table_in(&namespace_id, name, num_tablets)
    }

    fn create_table_in(
        &self,
        namespace_id: &NamespaceId,
        name: &TableName,
        num_tablets: usize,
    ) -> Result<TableInfo> {
        let schema = TableSchema {
            columns: vec![
                ColumnSchema::key("key", DataType::Int32),
                ColumnSchema::value("value", DataType::String),
            ],
        };
        let table = self.catalog.create_table(
            namespace_id,
            &name.table_name,
            schema,
            Partition::split_hash_space(num_tablets),
        )?;
        wait_for_create_table_done(&self.coordinator, name, WaitOptions::default())?;
        self.catalog.table(&table.table_id)
    }

    /// Current catalog info of a table
    pub fn table(&self, name: &TableName) -> Result<TableInfo> {
        self.catalog
            .find_table(name)
            .ok_or_else(|| SnapshotError::not_found(format!("Table {} not found", name)))
    }

    /// Drop a table
    pub fn delete_table(&self, name: &TableName) -> Result<()> {
        self.catalog.delete_table(name)
    }

    /// Drop an empty namespace
    pub fn delete_namespace(&self, name: &str) -> Result<()> {
        self.catalog.delete_namespace(name)
    }

    // ========================================================================
    // Rows
    // ========================================================================

    /// Insert rows `keys` with value `value-<key>`
    pub fn insert_rows(&self, name: &TableName, keys: Range<i32>) -> Result<()> {
        let table = self.table(name)?;
        let count = keys.len();
        for key in keys {
            let tablet_id = tablet_for_key(&table, key)?;
            self.write(tablet_id, key.to_be_bytes().to_vec(), format!("value-{}", key).into_bytes())?;
        }
        debug!(target: "tabletsnap::cluster", table = %name, rows = count, "Inserted rows");
        Ok(())
    }

    /// Every key of the table, read through each tablet's leader, sorted
    pub fn scan_table(&self, name: &TableName) -> Result<Vec<i32>> {
        let table = self.table(name)?;
        let mut keys = Vec::new();
        for tablet in &table.tablets {
            let (leader, _) = self.replicas_for_write(&tablet.tablet_id)?;
            for key in leader.scan()?.into_keys() {
                let bytes: [u8; 4] = key.as_slice().try_into().map_err(|_| {
                    SnapshotError::illegal_state(format!(
                        "Tablet {} holds a {}-byte key",
                        tablet.tablet_id,
                        key.len()
                    ))
                })?;
                keys.push(i32::from_be_bytes(bytes));
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    fn write(&self, tablet_id: &TabletId, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let _writes = self.writes.lock();
        let (leader, followers) = self.replicas_for_write(tablet_id)?;
        let majority = self.servers.len() / 2 + 1;
        if followers.len() + 1 < majority {
            return Err(SnapshotError::service_unavailable(format!(
                "Tablet {} has {} of {} replicas running",
                tablet_id,
                followers.len() + 1,
                self.servers.len()
            )));
        }
        let entry = leader.leader_write(key, value);
        for follower in &followers {
            follower.replicate(std::slice::from_ref(&entry));
        }
        leader.commit(entry.op_id);
        for follower in &followers {
            follower.commit(entry.op_id);
        }
        Ok(())
    }

    /// Leader and followers among the running replicas of a tablet
    fn replicas_for_write(
        &self,
        tablet_id: &TabletId,
    ) -> Result<(Arc<TabletReplica>, Vec<Arc<TabletReplica>>)> {
        let mut running = self
            .servers
            .iter()
            .filter(|s| s.is_running())
            .filter_map(|s| s.replica(tablet_id).ok());
        let leader = running.next().ok_or_else(|| {
            SnapshotError::service_unavailable(format!("Tablet {} has no running replica", tablet_id))
        })?;
        Ok((leader, running.collect()))
    }

    // ========================================================================
    // Servers
    // ========================================================================

    /// Stop tablet server `index`
    pub fn stop_tablet_server(&self, index: usize) -> Result<()> {
        self.tablet_server(index)?.stop();
        Ok(())
    }

    /// Bring tablet server `index` back and catch its replicas up
    ///
    /// Each replica replays the leader's log and takes the leader's complete
    /// snapshots it missed at the op ids they captured. When the leader
    /// already collected the entries it needs, the replica is remote
    /// bootstrapped from the leader instead.
    pub fn start_tablet_server(&self, index: usize) -> Result<()> {
        let server = self.tablet_server(index)?;
        {
            let _writes = self.writes.lock();
            for tablet_id in server.tablet_ids() {
                let replica = server.replica(&tablet_id)?;
                let Ok((leader, _)) = self.replicas_for_write(&tablet_id) else {
                    continue;
                };
                match replica.catch_up_from(&leader) {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {
                        let summary = remote_bootstrap(&leader, &replica)?;
                        info!(
                            target: "tabletsnap::cluster",
                            server_id = server.server_id(),
                            %tablet_id,
                            bootstrap_op_id = %summary.bootstrap_op_id,
                            snapshots = summary.snapshots.len(),
                            "Replica remote bootstrapped"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        server.start();
        Ok(())
    }

    /// Seal every running replica's memtable into a data file
    pub fn flush_tablets(&self) -> Result<()> {
        for server in self.servers.iter().filter(|s| s.is_running()) {
            for tablet_id in server.tablet_ids() {
                server.replica(&tablet_id)?.flush()?;
            }
        }
        Ok(())
    }

    /// Garbage collect log entries older than the retention window on every
    /// running replica
    ///
    /// Returns the number of entries dropped.
    pub fn clean_tablet_logs(&self) -> Result<usize> {
        let retention = Duration::from_secs(self.config.log_min_seconds_to_retain);
        let mut dropped = 0;
        for server in self.servers.iter().filter(|s| s.is_running()) {
            for tablet_id in server.tablet_ids() {
                dropped += server.replica(&tablet_id)?.gc_log(retention);
            }
        }
        debug!(target: "tabletsnap::cluster", dropped, "Cleaned tablet logs");
        Ok(dropped)
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Check the snapshot directory of every hosted replica of `tablets`
    ///
    /// Each directory must hold `CURRENT`, a `MANIFEST-*` and data files
    /// that share their inode with the live file of the same name. Returns
    /// the number of directories checked.
    ///
    /// # Errors
    /// `IllegalState` naming the first directory that does not qualify.
    pub fn verify_snapshot_files(&self, snapshot_id: SnapshotId, tablets: &[TabletId]) -> Result<usize> {
        let wanted: BTreeSet<&TabletId> = tablets.iter().collect();
        let mut checked = 0;
        for server in &self.servers {
            for tablet_id in server.tablet_ids() {
                if !wanted.contains(&tablet_id) {
                    continue;
                }
                let replica = server.replica(&tablet_id)?;
                let paths = replica.paths();
                let rocksdb_dir = paths.rocksdb_dir();
                let snapshot_dir = paths.snapshot_dir(snapshot_id);
                for dir in [paths.snapshots_dir(), rocksdb_dir.clone(), snapshot_dir.clone()] {
                    if !dir.is_dir() {
                        return Err(invalid_snapshot(&dir, "directory is missing"));
                    }
                }
                if !has_checkpoint_files(&snapshot_dir)? {
                    return Err(invalid_snapshot(&snapshot_dir, "CURRENT or MANIFEST is missing"));
                }

                let mut sst_files = 0;
                for entry in std::fs::read_dir(&snapshot_dir)? {
                    let name = entry?.file_name().to_string_lossy().to_string();
                    if is_manifest_file(&name) || !is_sst_file(&name) {
                        continue;
                    }
                    let live = rocksdb_dir.join(&name);
                    if !live.is_file() {
                        return Err(invalid_snapshot(&snapshot_dir, &format!("{} has no live file", name)));
                    }
                    if file_inode(&snapshot_dir.join(&name))? != file_inode(&live)? {
                        return Err(invalid_snapshot(&snapshot_dir, &format!("{} is not hard linked", name)));
                    }
                    sst_files += 1;
                }
                debug!(
                    target: "tabletsnap::cluster",
                    dir = %snapshot_dir.display(),
                    sst_files,
                    "Snapshot directory verified"
                );
                checked += 1;
            }
        }
        Ok(checked)
    }
}

fn invalid_snapshot(dir: &Path, reason: &str) -> SnapshotError {
    SnapshotError::illegal_state(format!("Snapshot directory {}: {}", dir.display(), reason))
}

/// 16-bit hash code of a row key
pub fn hash_code(key: i32) -> u16 {
    crc32fast::hash(&key.to_be_bytes()) as u16
}

fn tablet_for_key(table: &TableInfo, key: i32) -> Result<&TabletId> {
    let hash = hash_code(key);
    table
        .tablets
        .iter()
        .find(|t| t.partition.contains_hash(hash))
        .map(|t| &t.tablet_id)
        .ok_or_else(|| {
            SnapshotError::illegal_state(format!(
                "No tablet of {} covers hash {:#06x}",
                table.name, hash
            ))
        })
}
