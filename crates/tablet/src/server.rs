//! In-process tablet server
//!
//! Hosts the replicas of many tablets under one data directory and serves the
//! `TabletService` directives for them. A stopped server keeps its files but
//! answers every directive with `ServiceUnavailable`, which is how tests
//! simulate a crashed or partitioned node.

use crate::replica::TabletReplica;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabletsnap_core::{
    LocalSnapshotResult, OpId, Result, SnapshotError, SnapshotId, TabletId, TabletService,
};
use tracing::{debug, info};

/// A tablet server
pub struct TabletServer {
    server_id: String,
    data_dir: PathBuf,
    wait_timeout: Duration,
    running: AtomicBool,
    replicas: RwLock<HashMap<TabletId, Arc<TabletReplica>>>,
}

impl TabletServer {
    /// Create a running server rooted at `data_dir`
    pub fn new(server_id: impl Into<String>, data_dir: impl AsRef<Path>, wait_timeout: Duration) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(data_dir.join("tablets"))?;
        Ok(TabletServer {
            server_id: server_id.into(),
            data_dir,
            wait_timeout,
            running: AtomicBool::new(true),
            replicas: RwLock::new(HashMap::new()),
        })
    }

    /// Root data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory of one tablet replica on this server
    pub fn tablet_dir(&self, tablet_id: &TabletId) -> PathBuf {
        self.data_dir.join("tablets").join(tablet_id.as_str())
    }

    /// Open a replica of `tablet_id` on this server
    ///
    /// Opening an already hosted tablet returns the existing replica.
    pub fn add_tablet(&self, tablet_id: &TabletId) -> Result<Arc<TabletReplica>> {
        let mut replicas = self.replicas.write();
        if let Some(replica) = replicas.get(tablet_id) {
            return Ok(Arc::clone(replica));
        }
        let replica = Arc::new(TabletReplica::open(
            tablet_id.clone(),
            self.tablet_dir(tablet_id),
            self.wait_timeout,
        )?);
        replicas.insert(tablet_id.clone(), Arc::clone(&replica));
        debug!(
            target: "tabletsnap::tablet",
            server_id = %self.server_id,
            %tablet_id,
            "Opened tablet replica"
        );
        Ok(replica)
    }

    /// Close a replica and remove its files
    pub fn remove_tablet(&self, tablet_id: &TabletId) -> Result<()> {
        if self.replicas.write().remove(tablet_id).is_some() {
            let dir = self.tablet_dir(tablet_id);
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// Replica of `tablet_id`, regardless of whether the server is running
    pub fn replica(&self, tablet_id: &TabletId) -> Result<Arc<TabletReplica>> {
        self.replicas.read().get(tablet_id).cloned().ok_or_else(|| {
            SnapshotError::not_found(format!(
                "Tablet {} is not hosted on {}",
                tablet_id, self.server_id
            ))
        })
    }

    /// Ids of every hosted tablet
    pub fn tablet_ids(&self) -> Vec<TabletId> {
        let mut ids: Vec<_> = self.replicas.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop answering directives
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(target: "tabletsnap::tablet", server_id = %self.server_id, "Tablet server stopped");
    }

    /// Resume answering directives
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(target: "tabletsnap::tablet", server_id = %self.server_id, "Tablet server started");
    }

    /// Whether the server answers directives
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replica for serving a directive
    fn serving_replica(&self, tablet_id: &TabletId) -> Result<Arc<TabletReplica>> {
        if !self.is_running() {
            return Err(SnapshotError::service_unavailable(format!(
                "Tablet server {} is not running",
                self.server_id
            )));
        }
        self.replica(tablet_id)
    }
}

impl TabletService for TabletServer {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn last_received_op_id(&self, tablet_id: &TabletId) -> Result<OpId> {
        Ok(self.serving_replica(tablet_id)?.last_received_op_id())
    }

    fn create_tablet_snapshot(
        &self,
        tablet_id: &TabletId,
        snapshot_id: SnapshotId,
        target_op_id: OpId,
    ) -> Result<LocalSnapshotResult> {
        self.serving_replica(tablet_id)?
            .snapshots()
            .create_local_snapshot(snapshot_id, target_op_id)
    }

    fn delete_tablet_snapshot(&self, tablet_id: &TabletId, snapshot_id: SnapshotId) -> Result<()> {
        match self.serving_replica(tablet_id) {
            Ok(replica) => replica.snapshots().delete_local_snapshot(snapshot_id),
            // A tablet that is gone has no snapshot to delete.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn restore_tablet_snapshot(&self, tablet_id: &TabletId, snapshot_id: SnapshotId) -> Result<OpId> {
        self.serving_replica(tablet_id)?.restore_snapshot(snapshot_id)
    }
}
