//! Tablet directory structure
//!
//! Every tablet replica owns a directory on its tablet server:
//!
//! ```text
//! <tablet_root>/
//! ├── rocksdb/                 # Live data files
//! │   ├── CURRENT
//! │   ├── MANIFEST-000002
//! │   └── 000001.sst
//! └── snapshots/               # One directory per snapshot
//!     ├── <snapshot_id>/
//!     │   ├── CURRENT
//!     │   ├── MANIFEST-000002
//!     │   └── 000001.sst       # hard link, same inode as rocksdb/000001.sst
//!     └── <snapshot_id>.tmp/   # in-progress creation, never read
//! ```
//!
//! `rocksdb/` and `snapshots/` are created when the tablet is opened, so
//! external inspection never fails on a missing directory.

use std::path::{Path, PathBuf};
use tabletsnap_core::SnapshotId;

/// Name of the manifest pointer file
pub const CURRENT_FILE: &str = "CURRENT";
/// Prefix of manifest descriptor files
pub const MANIFEST_PREFIX: &str = "MANIFEST-";
/// Suffix of immutable data files
pub const SST_SUFFIX: &str = ".sst";
/// Suffix of in-progress snapshot directories
pub const TEMP_SUFFIX: &str = ".tmp";

/// Paths within one tablet replica directory
#[derive(Debug, Clone)]
pub struct TabletPaths {
    root: PathBuf,
}

impl TabletPaths {
    /// Create paths from the tablet root directory
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        TabletPaths {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory of the tablet
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Live data directory
    pub fn rocksdb_dir(&self) -> PathBuf {
        self.root.join("rocksdb")
    }

    /// Top-level snapshots directory
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Directory of one published snapshot
    pub fn snapshot_dir(&self, snapshot_id: SnapshotId) -> PathBuf {
        self.snapshots_dir().join(snapshot_id.to_string())
    }

    /// Staging directory used while a snapshot is being written
    pub fn temp_snapshot_dir(&self, snapshot_id: SnapshotId) -> PathBuf {
        self.snapshots_dir()
            .join(format!("{}{}", snapshot_id, TEMP_SUFFIX))
    }

    /// Staging directory used while receiving a remote bootstrap
    pub fn bootstrap_dir(&self) -> PathBuf {
        self.root.join(format!("bootstrap{}", TEMP_SUFFIX))
    }

    /// Create the live data and snapshots directories
    pub fn create_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.rocksdb_dir())?;
        std::fs::create_dir_all(self.snapshots_dir())?;
        Ok(())
    }
}

/// Whether a file name is an immutable data file
pub fn is_sst_file(name: &str) -> bool {
    name.ends_with(SST_SUFFIX)
}

/// Whether a file name is a manifest descriptor
pub fn is_manifest_file(name: &str) -> bool {
    name.starts_with(MANIFEST_PREFIX)
}

/// fsync a directory so renames inside it are durable
pub fn sync_dir(path: &Path) -> std::io::Result<()> {
    let dir = std::fs::File::open(path)?;
    dir.sync_all()
}

/// Inode number of a file
#[cfg(unix)]
pub fn file_inode(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(path)?.ino())
}

/// Inode number of a file
#[cfg(not(unix))]
pub fn file_inode(_path: &Path) -> std::io::Result<u64> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "inode numbers are only available on unix",
    ))
}
