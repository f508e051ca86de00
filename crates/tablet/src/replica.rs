//! One replica of one tablet
//!
//! Ties the replicated log, the data store and the snapshot executor
//! together under a single tablet directory. The replica applies a write to
//! its store as soon as the entry is in its log; the commit point is advanced
//! separately by whoever drives replication.

use crate::consensus::{ConsensusGate, LogEntry, ReplicaConsensus, ReplicaLog};
use crate::paths::TabletPaths;
use crate::snapshots::{LocalSnapshotState, TabletSnapshots};
use crate::storage::{SstStore, TabletStorage};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tabletsnap_core::{OpId, Result, SnapshotError, SnapshotId, TabletId};
use tracing::debug;

/// A tablet replica hosted by one tablet server
pub struct TabletReplica {
    tablet_id: TabletId,
    paths: TabletPaths,
    log: Arc<ReplicaLog>,
    store: Arc<SstStore>,
    snapshots: TabletSnapshots,
    /// Held while this replica's files are being copied to or from a peer
    pub(crate) bootstrap_lock: Mutex<()>,
}

impl TabletReplica {
    /// Open (or create) the replica rooted at `root`
    ///
    /// `wait_timeout` bounds how long a snapshot directive waits for the log.
    pub fn open(tablet_id: TabletId, root: impl AsRef<Path>, wait_timeout: Duration) -> Result<Self> {
        let paths = TabletPaths::from_root(root);
        paths.create_directories()?;

        let store = Arc::new(SstStore::open(paths.rocksdb_dir())?);
        let log = Arc::new(ReplicaLog::new());
        // Whatever is sealed in data files has been committed.
        log.reset_to(store.flushed_op_id());

        let snapshots = TabletSnapshots::open(
            tablet_id.clone(),
            paths.clone(),
            store.clone(),
            ConsensusGate::new(log.clone()),
            wait_timeout,
        )?;

        Ok(TabletReplica {
            tablet_id,
            paths,
            log,
            store,
            snapshots,
            bootstrap_lock: Mutex::new(()),
        })
    }

    /// Tablet id
    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    /// Directory layout
    pub fn paths(&self) -> &TabletPaths {
        &self.paths
    }

    /// Snapshot executor
    pub fn snapshots(&self) -> &TabletSnapshots {
        &self.snapshots
    }

    /// Data store
    pub fn store(&self) -> &Arc<SstStore> {
        &self.store
    }

    /// Replicated log
    pub fn log(&self) -> &Arc<ReplicaLog> {
        &self.log
    }

    /// Last op id in the local log
    pub fn last_received_op_id(&self) -> OpId {
        self.log.last_received_op_id()
    }

    /// Last committed op id in the local log
    pub fn last_committed_op_id(&self) -> OpId {
        self.log.last_committed_op_id()
    }

    /// Append and apply a write as the tablet leader
    pub fn leader_write(&self, key: Vec<u8>, value: Vec<u8>) -> LogEntry {
        let entry = self.log.append(key, value);
        self.store
            .apply(entry.op_id, entry.key.clone(), entry.value.clone());
        entry
    }

    /// Append and apply entries shipped by the leader
    ///
    /// Returns how many entries were new to this replica.
    pub fn replicate(&self, entries: &[LogEntry]) -> usize {
        let mut applied = 0;
        for entry in entries {
            if self.log.receive(entry.clone()) {
                self.store
                    .apply(entry.op_id, entry.key.clone(), entry.value.clone());
                applied += 1;
            }
        }
        applied
    }

    /// Advance the commit point
    pub fn commit(&self, op_id: OpId) {
        self.log.commit_up_to(op_id);
    }

    /// Replay the leader's log past our last received op id
    ///
    /// Complete snapshots the leader holds and this replica lacks are
    /// reproduced on the way: the log is replayed up to the op id each one
    /// captured and a local snapshot is taken there, so its files are hard
    /// links to our own data. Returns the number of entries applied.
    ///
    /// # Errors
    /// `NotFound` when the leader already collected the entries we need, or
    /// when a missing snapshot was captured before our last received op id;
    /// the replica then has to be remote bootstrapped.
    pub fn catch_up_from(&self, leader: &TabletReplica) -> Result<usize> {
        let entries = leader.log.entries_after(self.last_received_op_id())?;
        let leader_committed = leader.last_committed_op_id();
        let mut applied = 0;
        let mut reproduced = 0;
        for (captured, snapshot_id) in self.snapshots_missing_from(leader)? {
            let position = self.last_received_op_id();
            if captured < position {
                return Err(SnapshotError::not_found(format!(
                    "snapshot {} was captured at {} but replica {} is already at {}",
                    snapshot_id, captured, self.tablet_id, position
                )));
            }
            let upto: Vec<LogEntry> = entries
                .iter()
                .filter(|e| e.op_id > position && e.op_id <= captured)
                .cloned()
                .collect();
            applied += self.replicate(&upto);
            self.commit(captured.min(leader_committed));
            self.snapshots.create_local_snapshot(snapshot_id, captured)?;
            reproduced += 1;
        }
        applied += self.replicate(&entries);
        self.commit(leader_committed);
        debug!(
            target: "tabletsnap::tablet",
            tablet_id = %self.tablet_id,
            applied,
            reproduced,
            committed = %self.last_committed_op_id(),
            "Caught up from leader log"
        );
        Ok(applied)
    }

    /// Complete leader snapshots absent here, by captured op id
    fn snapshots_missing_from(&self, leader: &TabletReplica) -> Result<Vec<(OpId, SnapshotId)>> {
        let mut missing = Vec::new();
        for snapshot_id in leader.snapshots.list_local_snapshots()? {
            if leader.snapshots.local_snapshot_state(snapshot_id)? != LocalSnapshotState::Complete {
                continue;
            }
            if self.snapshots.local_snapshot_state(snapshot_id)? == LocalSnapshotState::Complete {
                continue;
            }
            let captured = leader
                .store
                .checkpoint_op_id(&leader.paths.snapshot_dir(snapshot_id))?;
            missing.push((captured, snapshot_id));
        }
        missing.sort();
        Ok(missing)
    }

    /// Seal the memtable into a data file
    pub fn flush(&self) -> Result<Option<String>> {
        self.store.flush()
    }

    /// Drop log entries already sealed in data files and older than `retention`
    pub fn gc_log(&self, retention: Duration) -> usize {
        self.log.gc(self.store.flushed_op_id(), retention)
    }

    /// All rows of the replica
    pub fn scan(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        self.store.scan()
    }

    /// Replace the live data with a local snapshot and rewind the log to it
    pub fn restore_snapshot(&self, snapshot_id: SnapshotId) -> Result<OpId> {
        let op_id = self.snapshots.restore_from_local_snapshot(snapshot_id)?;
        self.log.reset_to(op_id);
        Ok(op_id)
    }

    /// Op id the live data currently reflects
    pub fn applied_op_id(&self) -> OpId {
        self.store.applied_op_id()
    }
}
