//! Durable `sys_catalog` file
//!
//! Holds every snapshot and restoration entry as one image.
//!
//! # Format
//!
//! ```text
//! +------------------+
//! | Magic: "TSCT"    | 4 bytes
//! | Format Version   | 4 bytes (u32 LE)
//! | Body             | MessagePack-encoded CatalogImage
//! | CRC32            | 4 bytes (over magic, version and body)
//! +------------------+
//! ```
//!
//! # Crash Safety
//!
//! 1. Write to `.sys_catalog.tmp`
//! 2. fsync the temporary file
//! 3. Atomic rename to `sys_catalog`
//! 4. fsync the parent directory
//!
//! A crash leaves either the previous image or the new one, never a mix.

use crate::registry::{RestorationEntry, SnapshotEntry};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tabletsnap_core::{Result, SnapshotError};
use tracing::debug;

/// File name of the catalog image
pub const SYS_CATALOG_FILE: &str = "sys_catalog";

const CATALOG_MAGIC: [u8; 4] = *b"TSCT";
const CATALOG_FORMAT_VERSION: u32 = 1;
const TEMP_FILE: &str = ".sys_catalog.tmp";

/// Everything the registry persists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogImage {
    /// Snapshot entries
    pub snapshots: Vec<SnapshotEntry>,
    /// Restoration entries
    pub restorations: Vec<RestorationEntry>,
}

/// The `sys_catalog` file of a master data directory
#[derive(Debug, Clone)]
pub struct CatalogStore {
    dir: PathBuf,
}

impl CatalogStore {
    /// Use `dir` for the catalog, creating it if needed
    ///
    /// A temporary file left by an interrupted save is removed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let temp = dir.join(TEMP_FILE);
        if temp.exists() {
            std::fs::remove_file(&temp)?;
        }
        Ok(Self { dir })
    }

    /// Path of the catalog file
    pub fn path(&self) -> PathBuf {
        self.dir.join(SYS_CATALOG_FILE)
    }

    /// Read the catalog; `None` if it was never written
    pub fn load(&self) -> Result<Option<CatalogImage>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        decode(&bytes).map(Some)
    }

    /// Replace the catalog with `image`
    pub fn save(&self, image: &CatalogImage) -> Result<()> {
        let bytes = encode(image)?;
        let temp = self.dir.join(TEMP_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp, self.path())?;
        File::open(&self.dir)?.sync_all()?;

        debug!(
            target: "tabletsnap::registry",
            snapshots = image.snapshots.len(),
            restorations = image.restorations.len(),
            bytes = bytes.len(),
            "Catalog saved"
        );
        Ok(())
    }
}

fn encode(image: &CatalogImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&CATALOG_MAGIC);
    bytes.extend_from_slice(&CATALOG_FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&rmp_serde::to_vec(image)?);
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> Result<CatalogImage> {
    if bytes.len() < 12 || bytes[0..4] != CATALOG_MAGIC {
        return Err(SnapshotError::illegal_state("sys_catalog has no valid header"));
    }
    let (data, footer) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    let computed = crc32fast::hash(data);
    if stored != computed {
        return Err(SnapshotError::illegal_state(format!(
            "sys_catalog checksum mismatch: expected {:#x}, computed {:#x}",
            stored, computed
        )));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != CATALOG_FORMAT_VERSION {
        return Err(SnapshotError::illegal_state(format!(
            "Unsupported sys_catalog version {}",
            version
        )));
    }
    Ok(rmp_serde::from_slice(&data[8..])?)
}
