//! Tablet snapshot executor
//!
//! Creates, deletes and restores the snapshot directories of one tablet
//! replica. All three directives are idempotent, and directives for the same
//! snapshot id are serialized through a per-id lock, so a delete can never
//! observe a half-written directory from a concurrent create.
//!
//! # Crash Safety
//!
//! A snapshot is published with the temp-then-rename pattern:
//! 1. Checkpoint the storage into `snapshots/<id>.tmp/`
//! 2. fsync the temporary directory
//! 3. Rename to `snapshots/<id>/`
//! 4. fsync `snapshots/`
//!
//! A directory without CURRENT or a MANIFEST is treated as incomplete and is
//! never restored from.

use crate::consensus::ConsensusGate;
use crate::paths::{sync_dir, TabletPaths, TEMP_SUFFIX};
use crate::storage::{has_checkpoint_files, TabletStorage};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tabletsnap_core::{LocalSnapshotResult, OpId, Result, SnapshotError, SnapshotId, TabletId};
use tracing::{debug, info, warn};

/// Observable state of a snapshot directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSnapshotState {
    /// No directory
    Missing,
    /// Directory exists but lacks CURRENT or MANIFEST
    Incomplete,
    /// Directory is a usable checkpoint
    Complete,
}

/// Snapshot executor of one tablet replica
pub struct TabletSnapshots {
    tablet_id: TabletId,
    paths: TabletPaths,
    storage: Arc<dyn TabletStorage>,
    gate: ConsensusGate,
    wait_timeout: Duration,
    /// Per-snapshot directive locks
    locks: DashMap<SnapshotId, Arc<Mutex<()>>>,
}

impl TabletSnapshots {
    /// Create the executor and make sure the directory layout exists
    ///
    /// Leftover `.tmp` directories from interrupted creations are removed.
    pub fn open(
        tablet_id: TabletId,
        paths: TabletPaths,
        storage: Arc<dyn TabletStorage>,
        gate: ConsensusGate,
        wait_timeout: Duration,
    ) -> Result<Self> {
        paths.create_directories()?;
        let executor = TabletSnapshots {
            tablet_id,
            paths,
            storage,
            gate,
            wait_timeout,
            locks: DashMap::new(),
        };
        executor.cleanup_temp_dirs()?;
        Ok(executor)
    }

    /// Tablet this executor serves
    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    /// Directory layout of the tablet
    pub fn paths(&self) -> &TabletPaths {
        &self.paths
    }

    /// Create a local snapshot once the replica has committed `target_op_id`
    ///
    /// Re-invoking with the id of an already published snapshot returns the
    /// existing snapshot without touching the disk.
    pub fn create_local_snapshot(
        &self,
        snapshot_id: SnapshotId,
        target_op_id: OpId,
    ) -> Result<LocalSnapshotResult> {
        let lock = self.lock_for(snapshot_id);
        let _guard = lock.lock();

        let final_dir = self.paths.snapshot_dir(snapshot_id);
        match self.local_snapshot_state(snapshot_id)? {
            LocalSnapshotState::Complete => {
                let captured_op_id = self.storage.checkpoint_op_id(&final_dir)?;
                debug!(
                    target: "tabletsnap::tablet",
                    tablet_id = %self.tablet_id,
                    %snapshot_id,
                    "Snapshot already present"
                );
                return Ok(LocalSnapshotResult {
                    captured_op_id,
                    already_present: true,
                });
            }
            LocalSnapshotState::Incomplete => {
                warn!(
                    target: "tabletsnap::tablet",
                    tablet_id = %self.tablet_id,
                    %snapshot_id,
                    "Removing incomplete snapshot directory"
                );
                std::fs::remove_dir_all(&final_dir)?;
            }
            LocalSnapshotState::Missing => {}
        }

        self.gate.wait_for_committed(target_op_id, self.wait_timeout)?;

        let temp_dir = self.paths.temp_snapshot_dir(snapshot_id);
        if temp_dir.exists() {
            std::fs::remove_dir_all(&temp_dir)?;
        }
        let captured_op_id = match self.storage.checkpoint(&temp_dir) {
            Ok(op_id) => op_id,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&temp_dir);
                return Err(e);
            }
        };
        std::fs::rename(&temp_dir, &final_dir)?;
        sync_dir(&self.paths.snapshots_dir())?;

        info!(
            target: "tabletsnap::tablet",
            tablet_id = %self.tablet_id,
            %snapshot_id,
            target_op_id = %target_op_id,
            captured_op_id = %captured_op_id,
            "Created local snapshot"
        );
        Ok(LocalSnapshotResult {
            captured_op_id,
            already_present: false,
        })
    }

    /// Delete a local snapshot; a missing snapshot is not an error
    pub fn delete_local_snapshot(&self, snapshot_id: SnapshotId) -> Result<()> {
        let lock = self.lock_for(snapshot_id);
        let _guard = lock.lock();
        for dir in [
            self.paths.snapshot_dir(snapshot_id),
            self.paths.temp_snapshot_dir(snapshot_id),
        ] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        sync_dir(&self.paths.snapshots_dir())?;

        info!(
            target: "tabletsnap::tablet",
            tablet_id = %self.tablet_id,
            %snapshot_id,
            "Deleted local snapshot"
        );
        Ok(())
    }

    /// Replace the live data with the snapshot's data
    ///
    /// # Errors
    /// * `NotFound` - no directory for `snapshot_id`
    /// * `IllegalState` - the directory is incomplete
    pub fn restore_from_local_snapshot(&self, snapshot_id: SnapshotId) -> Result<OpId> {
        let lock = self.lock_for(snapshot_id);
        let _guard = lock.lock();

        match self.local_snapshot_state(snapshot_id)? {
            LocalSnapshotState::Missing => {
                return Err(SnapshotError::not_found(format!(
                    "Snapshot {} not found on tablet {}",
                    snapshot_id, self.tablet_id
                )))
            }
            LocalSnapshotState::Incomplete => {
                return Err(SnapshotError::illegal_state(format!(
                    "Snapshot {} on tablet {} is incomplete",
                    snapshot_id, self.tablet_id
                )))
            }
            LocalSnapshotState::Complete => {}
        }

        let op_id = self
            .storage
            .restore_from(&self.paths.snapshot_dir(snapshot_id))?;
        info!(
            target: "tabletsnap::tablet",
            tablet_id = %self.tablet_id,
            %snapshot_id,
            %op_id,
            "Restored tablet from local snapshot"
        );
        Ok(op_id)
    }

    /// Publish a snapshot directory whose files come from elsewhere
    ///
    /// `populate` fills the staging directory; it is then published with the
    /// same rename + fsync sequence as a locally created snapshot. Any
    /// existing directory for `snapshot_id` is replaced.
    pub fn install_snapshot<F>(&self, snapshot_id: SnapshotId, populate: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let lock = self.lock_for(snapshot_id);
        let _guard = lock.lock();

        let temp_dir = self.paths.temp_snapshot_dir(snapshot_id);
        let final_dir = self.paths.snapshot_dir(snapshot_id);
        for dir in [&temp_dir, &final_dir] {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        std::fs::create_dir(&temp_dir)?;
        if let Err(e) = populate(&temp_dir) {
            let _ = std::fs::remove_dir_all(&temp_dir);
            return Err(e);
        }
        if !has_checkpoint_files(&temp_dir)? {
            std::fs::remove_dir_all(&temp_dir)?;
            return Err(SnapshotError::illegal_state(format!(
                "Snapshot {} for tablet {} has no CURRENT or MANIFEST",
                snapshot_id, self.tablet_id
            )));
        }
        sync_dir(&temp_dir)?;
        std::fs::rename(&temp_dir, &final_dir)?;
        sync_dir(&self.paths.snapshots_dir())?;

        debug!(
            target: "tabletsnap::tablet",
            tablet_id = %self.tablet_id,
            %snapshot_id,
            "Installed snapshot copied from peer"
        );
        Ok(())
    }

    /// Inspect the directory of one snapshot
    pub fn local_snapshot_state(&self, snapshot_id: SnapshotId) -> Result<LocalSnapshotState> {
        let dir = self.paths.snapshot_dir(snapshot_id);
        if !dir.exists() {
            return Ok(LocalSnapshotState::Missing);
        }
        if has_checkpoint_files(&dir)? {
            Ok(LocalSnapshotState::Complete)
        } else {
            Ok(LocalSnapshotState::Incomplete)
        }
    }

    /// Ids of every published snapshot directory, complete or not
    pub fn list_local_snapshots(&self) -> Result<Vec<SnapshotId>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(self.paths.snapshots_dir())? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            if let Ok(id) = name.parse::<SnapshotId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn lock_for(&self, snapshot_id: SnapshotId) -> Arc<Mutex<()>> {
        self.locks
            .entry(snapshot_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cleanup_temp_dirs(&self) -> Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(self.paths.snapshots_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TEMP_SUFFIX) {
                std::fs::remove_dir_all(entry.path())?;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ReplicaLog;
    use crate::paths::{file_inode, is_sst_file};
    use crate::storage::SstStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        log: Arc<ReplicaLog>,
        store: Arc<SstStore>,
        snapshots: TabletSnapshots,
    }

    fn fixture(wait_timeout: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let paths = TabletPaths::from_root(dir.path().join("tablet"));
        let log = Arc::new(ReplicaLog::new());
        let store = Arc::new(SstStore::open(paths.rocksdb_dir()).unwrap());
        let snapshots = TabletSnapshots::open(
            TabletId::generate(),
            paths,
            store.clone(),
            ConsensusGate::new(log.clone()),
            wait_timeout,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            log,
            store,
            snapshots,
        }
    }

    fn write_committed(f: &Fixture, key: &str) -> OpId {
        let entry = f.log.append(key.as_bytes().to_vec(), b"v".to_vec());
        f.log.commit_up_to(entry.op_id);
        f.store.apply(entry.op_id, entry.key, entry.value);
        entry.op_id
    }

    #[test]
    fn test_directories_exist_before_any_snapshot() {
        let f = fixture(Duration::from_secs(1));
        assert!(f.snapshots.paths().rocksdb_dir().is_dir());
        assert!(f.snapshots.paths().snapshots_dir().is_dir());
        assert!(f.snapshots.list_local_snapshots().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_create_publishes_hard_linked_directory() {
        let f = fixture(Duration::from_secs(1));
        write_committed(&f, "a");
        f.store.flush().unwrap();
        let target = write_committed(&f, "b");

        let id = SnapshotId::new();
        let result = f.snapshots.create_local_snapshot(id, target).unwrap();
        assert!(!result.already_present);
        assert!(result.captured_op_id >= target);

        let dir = f.snapshots.paths().snapshot_dir(id);
        let rocksdb = f.snapshots.paths().rocksdb_dir();
        let mut ssts = 0;
        for entry in std::fs::read_dir(&dir).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            if is_sst_file(&name) {
                ssts += 1;
                assert_eq!(
                    file_inode(&dir.join(&name)).unwrap(),
                    file_inode(&rocksdb.join(&name)).unwrap()
                );
            }
        }
        assert_eq!(ssts, 2);
        assert_eq!(
            f.snapshots.local_snapshot_state(id).unwrap(),
            LocalSnapshotState::Complete
        );
        assert!(!f.snapshots.paths().temp_snapshot_dir(id).exists());
    }

    #[test]
    fn test_create_is_idempotent() {
        let f = fixture(Duration::from_secs(1));
        let target = write_committed(&f, "a");
        let id = SnapshotId::new();

        let first = f.snapshots.create_local_snapshot(id, target).unwrap();
        write_committed(&f, "b");
        let second = f.snapshots.create_local_snapshot(id, target).unwrap();

        assert!(second.already_present);
        assert_eq!(first.captured_op_id, second.captured_op_id);
    }

    #[test]
    fn test_create_waits_for_commit_then_times_out() {
        let f = fixture(Duration::from_millis(30));
        let entry = f.log.append(b"a".to_vec(), b"v".to_vec());

        let id = SnapshotId::new();
        let err = f.snapshots.create_local_snapshot(id, entry.op_id).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(
            f.snapshots.local_snapshot_state(id).unwrap(),
            LocalSnapshotState::Missing
        );
    }

    #[test]
    fn test_delete_is_idempotent() {
        let f = fixture(Duration::from_secs(1));
        let target = write_committed(&f, "a");
        let id = SnapshotId::new();
        f.snapshots.create_local_snapshot(id, target).unwrap();

        f.snapshots.delete_local_snapshot(id).unwrap();
        assert_eq!(
            f.snapshots.local_snapshot_state(id).unwrap(),
            LocalSnapshotState::Missing
        );
        f.snapshots.delete_local_snapshot(id).unwrap();
        f.snapshots.delete_local_snapshot(SnapshotId::new()).unwrap();
    }

    #[test]
    fn test_restore_rolls_back_later_writes() {
        let f = fixture(Duration::from_secs(1));
        write_committed(&f, "k1");
        let target = write_committed(&f, "k2");
        let id = SnapshotId::new();
        f.snapshots.create_local_snapshot(id, target).unwrap();

        write_committed(&f, "k3");
        f.store.flush().unwrap();
        write_committed(&f, "k4");

        let op = f.snapshots.restore_from_local_snapshot(id).unwrap();
        assert_eq!(op, target);
        let keys: Vec<_> = f.store.scan().unwrap().into_keys().collect();
        assert_eq!(keys, vec![b"k1".to_vec(), b"k2".to_vec()]);
    }

    #[test]
    fn test_restore_refuses_missing_or_incomplete() {
        let f = fixture(Duration::from_secs(1));
        write_committed(&f, "a");

        let missing = SnapshotId::new();
        assert!(f
            .snapshots
            .restore_from_local_snapshot(missing)
            .unwrap_err()
            .is_not_found());

        let partial = SnapshotId::new();
        std::fs::create_dir(f.snapshots.paths().snapshot_dir(partial)).unwrap();
        assert_eq!(
            f.snapshots.local_snapshot_state(partial).unwrap(),
            LocalSnapshotState::Incomplete
        );
        let err = f.snapshots.restore_from_local_snapshot(partial).unwrap_err();
        assert!(matches!(err, SnapshotError::IllegalState(_)));
        assert_eq!(f.store.scan().unwrap().len(), 1);
    }

    #[test]
    fn test_incomplete_directory_is_replaced_on_create() {
        let f = fixture(Duration::from_secs(1));
        let target = write_committed(&f, "a");
        let id = SnapshotId::new();
        let dir = f.snapshots.paths().snapshot_dir(id);
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("junk"), b"x").unwrap();

        let result = f.snapshots.create_local_snapshot(id, target).unwrap();
        assert!(!result.already_present);
        assert!(!dir.join("junk").exists());
        assert_eq!(
            f.snapshots.local_snapshot_state(id).unwrap(),
            LocalSnapshotState::Complete
        );
    }

    #[test]
    fn test_install_rejects_directory_without_manifest() {
        let f = fixture(Duration::from_secs(1));
        let id = SnapshotId::new();
        let err = f
            .snapshots
            .install_snapshot(id, |dir| {
                std::fs::write(dir.join("000001.sst"), b"x")?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, SnapshotError::IllegalState(_)));
        assert_eq!(
            f.snapshots.local_snapshot_state(id).unwrap(),
            LocalSnapshotState::Missing
        );
        assert!(!f.snapshots.paths().temp_snapshot_dir(id).exists());
    }

    #[test]
    fn test_open_removes_stale_temp_dirs() {
        let dir = TempDir::new().unwrap();
        let paths = TabletPaths::from_root(dir.path().join("tablet"));
        paths.create_directories().unwrap();
        let stale = paths.temp_snapshot_dir(SnapshotId::new());
        std::fs::create_dir(&stale).unwrap();

        let log = Arc::new(ReplicaLog::new());
        let store = Arc::new(SstStore::open(paths.rocksdb_dir()).unwrap());
        let _snapshots = TabletSnapshots::open(
            TabletId::generate(),
            paths,
            store,
            ConsensusGate::new(log),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_concurrent_create_and_delete_serialize() {
        let f = Arc::new(fixture(Duration::from_secs(1)));
        let target = write_committed(&f, "a");
        let id = SnapshotId::new();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        f.snapshots.create_local_snapshot(id, target).map(|_| ())
                    } else {
                        f.snapshots.delete_local_snapshot(id)
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        // Whatever the interleaving, the directory is either gone or whole.
        let state = f.snapshots.local_snapshot_state(id).unwrap();
        assert_ne!(state, LocalSnapshotState::Incomplete);
        assert!(!f.snapshots.paths().temp_snapshot_dir(id).exists());
    }
}
