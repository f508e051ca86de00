//! Data MANIFEST and CURRENT file formats
//!
//! A MANIFEST describes one immutable version of a tablet's data set: the
//! data files that make it up and the op id it reflects. CURRENT names the
//! MANIFEST in effect. A published snapshot directory carries its own copy
//! of both.
//!
//! # Format
//!
//! ```text
//! +------------------+
//! | Magic: "TSNM"    | 4 bytes
//! | Format Version   | 4 bytes (u32 LE)
//! | Body             | MessagePack-encoded ManifestBody
//! | CRC32            | 4 bytes (over magic, version and body)
//! +------------------+
//! ```

use crate::paths::{sync_dir, CURRENT_FILE, MANIFEST_PREFIX};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tabletsnap_core::{OpId, SnapshotError};

/// MANIFEST magic bytes
pub const MANIFEST_MAGIC: [u8; 4] = *b"TSNM";

/// Current MANIFEST format version
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Contents of a data MANIFEST
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataManifest {
    /// Data file names, oldest first
    pub sst_files: Vec<String>,
    /// Every op up to and including this one is in the data files
    pub flushed_op_id: OpId,
    /// Next number used to name a data file
    pub next_file_number: u64,
}

impl DataManifest {
    /// Manifest of an empty data set
    pub fn empty() -> Self {
        DataManifest {
            sst_files: Vec::new(),
            flushed_op_id: OpId::MIN,
            next_file_number: 1,
        }
    }

    /// Serialize to bytes with magic, version and CRC footer
    pub fn to_bytes(&self) -> Result<Vec<u8>, ManifestError> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MANIFEST_MAGIC);
        bytes.extend_from_slice(&MANIFEST_FORMAT_VERSION.to_le_bytes());
        let body =
            rmp_serde::to_vec(self).map_err(|e| ManifestError::Encoding(e.to_string()))?;
        bytes.extend_from_slice(&body);

        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    /// Deserialize from bytes, verifying magic, version and CRC
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        if bytes.len() < 12 {
            return Err(ManifestError::TooShort);
        }
        if bytes[0..4] != MANIFEST_MAGIC {
            return Err(ManifestError::InvalidMagic);
        }

        let (data, footer) = bytes.split_at(bytes.len() - 4);
        let stored_crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
        let computed_crc = crc32fast::hash(data);
        if stored_crc != computed_crc {
            return Err(ManifestError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != MANIFEST_FORMAT_VERSION {
            return Err(ManifestError::UnsupportedVersion(version));
        }

        rmp_serde::from_slice(&data[8..]).map_err(|e| ManifestError::Encoding(e.to_string()))
    }
}

/// Name of the MANIFEST file with the given number
pub fn manifest_file_name(number: u64) -> String {
    format!("{}{:06}", MANIFEST_PREFIX, number)
}

/// Name of the data file with the given number
pub fn sst_file_name(number: u64) -> String {
    format!("{:06}.sst", number)
}

/// Write MANIFEST-NNNNNN and point CURRENT at it
///
/// Both files are written to a temporary name, fsynced and renamed, then the
/// directory is fsynced. A crash leaves either the old or the new CURRENT.
pub fn write_manifest(
    dir: &Path,
    number: u64,
    manifest: &DataManifest,
) -> Result<String, ManifestError> {
    let name = manifest_file_name(number);
    write_atomic(dir, &name, &manifest.to_bytes()?)?;
    write_atomic(dir, CURRENT_FILE, format!("{}\n", name).as_bytes())?;
    sync_dir(dir)?;
    Ok(name)
}

/// Read the MANIFEST that CURRENT points to
///
/// Returns the manifest and its file name.
pub fn read_current_manifest(dir: &Path) -> Result<(String, DataManifest), ManifestError> {
    let current = std::fs::read_to_string(dir.join(CURRENT_FILE))?;
    let name = current.trim().to_string();
    if !name.starts_with(MANIFEST_PREFIX) {
        return Err(ManifestError::BadCurrent(name));
    }
    let bytes = std::fs::read(dir.join(&name))?;
    Ok((name, DataManifest::from_bytes(&bytes)?))
}

/// Parse the number out of a MANIFEST file name
pub fn manifest_number(name: &str) -> Option<u64> {
    name.strip_prefix(MANIFEST_PREFIX)?.parse().ok()
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    let temp = dir.join(format!(".{}.tmp", name));
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&temp, dir.join(name))
}

/// MANIFEST errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// File too short to hold a manifest
    #[error("MANIFEST too short")]
    TooShort,

    /// Magic bytes do not match
    #[error("Invalid MANIFEST magic")]
    InvalidMagic,

    /// Unknown format version
    #[error("Unsupported MANIFEST version {0}")]
    UnsupportedVersion(u32),

    /// CRC footer does not match the content
    #[error("MANIFEST checksum mismatch: expected {expected:#x}, computed {computed:#x}")]
    ChecksumMismatch {
        /// Stored CRC
        expected: u32,
        /// Computed CRC
        computed: u32,
    },

    /// CURRENT does not name a manifest
    #[error("CURRENT does not reference a MANIFEST: '{0}'")]
    BadCurrent(String),

    /// Body could not be encoded or decoded
    #[error("MANIFEST encoding error: {0}")]
    Encoding(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ManifestError> for SnapshotError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Io(io) => SnapshotError::Io(io),
            other => SnapshotError::illegal_state(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> DataManifest {
        DataManifest {
            sst_files: vec![sst_file_name(1), sst_file_name(2)],
            flushed_op_id: OpId::new(1, 42),
            next_file_number: 3,
        }
    }

    #[test]
    fn test_manifest_bytes_roundtrip() {
        let manifest = sample();
        let bytes = manifest.to_bytes().unwrap();
        assert_eq!(&bytes[0..4], &MANIFEST_MAGIC);
        assert_eq!(DataManifest::from_bytes(&bytes).unwrap(), manifest);
    }

    #[test]
    fn test_manifest_detects_corruption() {
        let mut bytes = sample().to_bytes().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            DataManifest::from_bytes(&bytes),
            Err(ManifestError::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            DataManifest::from_bytes(b"TSNM"),
            Err(ManifestError::TooShort)
        ));
    }

    #[test]
    fn test_write_and_read_current() {
        let dir = TempDir::new().unwrap();
        let name = write_manifest(dir.path(), 7, &sample()).unwrap();
        assert_eq!(name, "MANIFEST-000007");

        let (current, manifest) = read_current_manifest(dir.path()).unwrap();
        assert_eq!(current, name);
        assert_eq!(manifest, sample());
        assert_eq!(manifest_number(&current), Some(7));
    }

    #[test]
    fn test_missing_current_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err: SnapshotError = read_current_manifest(dir.path()).unwrap_err().into();
        assert!(matches!(err, SnapshotError::Io(_)));
    }
}
