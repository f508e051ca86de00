//! Tablet storage adapter
//!
//! The snapshot executor depends on the storage engine for exactly two
//! things: materialize an immutable checkpoint of the live data into a
//! directory, and replace the live data with such a checkpoint. Both are
//! expressed by `TabletStorage`.
//!
//! `SstStore` is a small log-structured store that satisfies the contract
//! the way an LSM engine does: writes land in a memtable, flushes seal the
//! memtable into an immutable `NNNNNN.sst` file, and a checkpoint is a new
//! MANIFEST plus hard links to the sealed files. Checkpoint cost does not
//! depend on data size, and removing a live file (compaction) leaves every
//! snapshot that links to it intact.

use crate::format::{
    manifest_file_name, manifest_number, read_current_manifest, sst_file_name, write_manifest,
    DataManifest,
};
use crate::paths::{is_manifest_file, is_sst_file, sync_dir, CURRENT_FILE};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tabletsnap_core::{OpId, Result, SnapshotError};
use tracing::{debug, info};

/// Storage operations the snapshot executor relies on
pub trait TabletStorage: Send + Sync {
    /// Op id of the last write applied to the live data
    fn applied_op_id(&self) -> OpId;

    /// Write CURRENT, a MANIFEST and hard links to every data file into `dest`
    ///
    /// `dest` must not exist. Returns the op id the checkpoint reflects.
    fn checkpoint(&self, dest: &Path) -> Result<OpId>;

    /// Replace the live data with the checkpoint in `src`
    ///
    /// Returns the op id the live data was rolled back to.
    fn restore_from(&self, src: &Path) -> Result<OpId>;

    /// Op id captured by the checkpoint in `dir`
    fn checkpoint_op_id(&self, dir: &Path) -> Result<OpId>;
}

type Rows = BTreeMap<Vec<u8>, Vec<u8>>;

struct StoreState {
    memtable: Rows,
    applied: OpId,
    manifest: DataManifest,
    manifest_number: u64,
}

/// Memtable + immutable data file store rooted at a tablet's `rocksdb/`
pub struct SstStore {
    dir: PathBuf,
    state: Mutex<StoreState>,
}

impl SstStore {
    /// Open the store, creating an empty data set if none exists
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let (number, manifest) = if dir.join(CURRENT_FILE).exists() {
            let (name, manifest) = read_current_manifest(&dir)?;
            let number = manifest_number(&name).ok_or_else(|| {
                SnapshotError::illegal_state(format!("Malformed manifest name '{}'", name))
            })?;
            (number, manifest)
        } else {
            let manifest = DataManifest::empty();
            write_manifest(&dir, 1, &manifest)?;
            (1, manifest)
        };

        debug!(
            target: "tabletsnap::tablet",
            dir = %dir.display(),
            files = manifest.sst_files.len(),
            flushed = %manifest.flushed_op_id,
            "Opened data directory"
        );

        Ok(SstStore {
            dir,
            state: Mutex::new(StoreState {
                memtable: Rows::new(),
                applied: manifest.flushed_op_id,
                manifest,
                manifest_number: number,
            }),
        })
    }

    /// Live data directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Apply a committed write
    pub fn apply(&self, op_id: OpId, key: Vec<u8>, value: Vec<u8>) {
        let mut state = self.state.lock();
        state.memtable.insert(key, value);
        state.applied.make_at_least(op_id);
    }

    /// Seal the memtable into a new data file
    ///
    /// Returns the name of the new file, or `None` if the memtable was empty.
    pub fn flush(&self) -> Result<Option<String>> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    /// Op id below which every write is sealed in a data file
    pub fn flushed_op_id(&self) -> OpId {
        self.state.lock().manifest.flushed_op_id
    }

    /// Data files of the live data set
    pub fn live_files(&self) -> Vec<String> {
        self.state.lock().manifest.sst_files.clone()
    }

    /// Look up a single row
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.scan()?.remove(key))
    }

    /// Read every row, newest write winning
    pub fn scan(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let state = self.state.lock();
        let mut rows = Rows::new();
        for file in &state.manifest.sst_files {
            rows.extend(read_sst(&self.dir.join(file))?);
        }
        rows.extend(state.memtable.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(rows)
    }

    /// Merge every data file into one and unlink the inputs
    ///
    /// Snapshots that hard-link an input keep their copy: unlinking only
    /// removes the live directory entry.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.manifest.sst_files.len() < 2 {
            return Ok(());
        }
        let mut merged = Rows::new();
        for file in &state.manifest.sst_files {
            merged.extend(read_sst(&self.dir.join(file))?);
        }

        let number = state.manifest.next_file_number;
        let name = sst_file_name(number);
        write_sst(&self.dir, &name, &merged)?;

        let inputs = std::mem::replace(&mut state.manifest.sst_files, vec![name]);
        state.manifest.next_file_number = number + 1;
        self.install_manifest(&mut state)?;
        for input in inputs {
            std::fs::remove_file(self.dir.join(input))?;
        }
        Ok(())
    }

    fn flush_locked(&self, state: &mut StoreState) -> Result<Option<String>> {
        if state.memtable.is_empty() {
            return Ok(None);
        }
        let number = state.manifest.next_file_number;
        let name = sst_file_name(number);
        write_sst(&self.dir, &name, &state.memtable)?;

        state.manifest.sst_files.push(name.clone());
        state.manifest.next_file_number = number + 1;
        state.manifest.flushed_op_id = state.applied;
        self.install_manifest(state)?;
        state.memtable.clear();

        debug!(
            target: "tabletsnap::tablet",
            file = %name,
            flushed = %state.applied,
            "Flushed memtable"
        );
        Ok(Some(name))
    }

    /// Write the next MANIFEST, point CURRENT at it, drop the previous one
    fn install_manifest(&self, state: &mut StoreState) -> Result<()> {
        let previous = state.manifest_number;
        let number = previous + 1;
        write_manifest(&self.dir, number, &state.manifest)?;
        state.manifest_number = number;
        let old = self.dir.join(manifest_file_name(previous));
        if old.exists() {
            std::fs::remove_file(old)?;
        }
        Ok(())
    }
}

impl TabletStorage for SstStore {
    fn applied_op_id(&self) -> OpId {
        self.state.lock().applied
    }

    fn checkpoint(&self, dest: &Path) -> Result<OpId> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)?;

        std::fs::create_dir(dest)?;
        for file in &state.manifest.sst_files {
            std::fs::hard_link(self.dir.join(file), dest.join(file))?;
        }
        write_manifest(dest, state.manifest_number, &state.manifest)?;
        sync_dir(dest)?;

        Ok(state.manifest.flushed_op_id)
    }

    fn restore_from(&self, src: &Path) -> Result<OpId> {
        let (_, snapshot) = read_current_manifest(src)?;
        for file in &snapshot.sst_files {
            if !src.join(file).is_file() {
                return Err(SnapshotError::illegal_state(format!(
                    "Snapshot {} is missing data file {}",
                    src.display(),
                    file
                )));
            }
        }

        let mut state = self.state.lock();

        // Unlink the live files first: a snapshot's data file may share a
        // name with a live file that has since been rewritten.
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_sst_file(&name) {
                std::fs::remove_file(entry.path())?;
            }
        }
        for file in &snapshot.sst_files {
            std::fs::hard_link(src.join(file), self.dir.join(file))?;
        }

        state.memtable.clear();
        state.applied = snapshot.flushed_op_id;
        state.manifest = DataManifest {
            sst_files: snapshot.sst_files.clone(),
            flushed_op_id: snapshot.flushed_op_id,
            next_file_number: state
                .manifest
                .next_file_number
                .max(snapshot.next_file_number),
        };
        self.install_manifest(&mut state)?;
        sync_dir(&self.dir)?;

        info!(
            target: "tabletsnap::tablet",
            dir = %self.dir.display(),
            op_id = %snapshot.flushed_op_id,
            files = snapshot.sst_files.len(),
            "Live data replaced from checkpoint"
        );
        Ok(snapshot.flushed_op_id)
    }

    fn checkpoint_op_id(&self, dir: &Path) -> Result<OpId> {
        let (_, manifest) = read_current_manifest(dir)?;
        Ok(manifest.flushed_op_id)
    }
}

/// Whether `dir` holds a CURRENT file and at least one MANIFEST
pub fn has_checkpoint_files(dir: &Path) -> std::io::Result<bool> {
    let mut has_current = false;
    let mut has_manifest = false;
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name == CURRENT_FILE {
            has_current = true;
        } else if is_manifest_file(&name) {
            has_manifest = true;
        }
    }
    Ok(has_current && has_manifest)
}

fn write_sst(dir: &Path, name: &str, rows: &Rows) -> Result<()> {
    let bytes = rmp_serde::to_vec(rows)?;
    let temp = dir.join(format!(".{}.tmp", name));
    let mut file = OpenOptions::new().create_new(true).write(true).open(&temp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&temp, dir.join(name))?;
    Ok(())
}

fn read_sst(path: &Path) -> Result<Rows> {
    let bytes = std::fs::read(path)?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::file_inode;
    use tempfile::TempDir;

    fn put(store: &SstStore, index: u64, key: &str) {
        store.apply(OpId::new(1, index), key.as_bytes().to_vec(), b"v".to_vec());
    }

    #[test]
    fn test_open_creates_current_and_manifest() {
        let dir = TempDir::new().unwrap();
        let store = SstStore::open(dir.path().join("rocksdb")).unwrap();
        assert!(has_checkpoint_files(store.dir()).unwrap());
        assert_eq!(store.applied_op_id(), OpId::MIN);
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rocksdb");
        {
            let store = SstStore::open(&path).unwrap();
            put(&store, 1, "a");
            put(&store, 2, "b");
            assert_eq!(store.flush().unwrap().as_deref(), Some("000001.sst"));
            assert_eq!(store.flush().unwrap(), None);
        }
        let store = SstStore::open(&path).unwrap();
        assert_eq!(store.flushed_op_id(), OpId::new(1, 2));
        assert_eq!(store.scan().unwrap().len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_checkpoint_hard_links_data_files() {
        let dir = TempDir::new().unwrap();
        let store = SstStore::open(dir.path().join("rocksdb")).unwrap();
        put(&store, 1, "a");
        store.flush().unwrap();
        put(&store, 2, "b");

        let dest = dir.path().join("snap");
        let op = store.checkpoint(&dest).unwrap();
        assert_eq!(op, OpId::new(1, 2));
        assert!(has_checkpoint_files(&dest).unwrap());

        for file in store.live_files() {
            assert_eq!(
                file_inode(&dest.join(&file)).unwrap(),
                file_inode(&store.dir().join(&file)).unwrap()
            );
        }
        assert_eq!(store.checkpoint_op_id(&dest).unwrap(), op);
    }

    #[test]
    fn test_restore_drops_later_writes() {
        let dir = TempDir::new().unwrap();
        let store = SstStore::open(dir.path().join("rocksdb")).unwrap();
        put(&store, 1, "a");
        let dest = dir.path().join("snap");
        store.checkpoint(&dest).unwrap();

        put(&store, 2, "b");
        store.flush().unwrap();
        put(&store, 3, "c");

        let op = store.restore_from(&dest).unwrap();
        assert_eq!(op, OpId::new(1, 1));
        assert_eq!(store.applied_op_id(), op);
        let rows = store.scan().unwrap();
        assert_eq!(rows.keys().cloned().collect::<Vec<_>>(), vec![b"a".to_vec()]);

        // New flushes never reuse a name already handed out.
        put(&store, 4, "d");
        let name = store.flush().unwrap().unwrap();
        assert_eq!(name, "000003.sst");
    }

    #[test]
    fn test_compaction_keeps_snapshot_files() {
        let dir = TempDir::new().unwrap();
        let store = SstStore::open(dir.path().join("rocksdb")).unwrap();
        put(&store, 1, "a");
        store.flush().unwrap();
        put(&store, 2, "b");
        let dest = dir.path().join("snap");
        store.checkpoint(&dest).unwrap();

        store.compact().unwrap();
        assert_eq!(store.live_files(), vec!["000003.sst".to_string()]);
        assert!(dest.join("000001.sst").exists());
        assert!(dest.join("000002.sst").exists());
        assert_eq!(store.scan().unwrap().len(), 2);
    }

    #[test]
    fn test_restore_refuses_incomplete_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = SstStore::open(dir.path().join("rocksdb")).unwrap();
        put(&store, 1, "a");
        let dest = dir.path().join("snap");
        store.checkpoint(&dest).unwrap();
        std::fs::remove_file(dest.join("000001.sst")).unwrap();

        let err = store.restore_from(&dest).unwrap_err();
        assert!(matches!(err, SnapshotError::IllegalState(_)));
        assert_eq!(store.scan().unwrap().len(), 1);
    }
}
