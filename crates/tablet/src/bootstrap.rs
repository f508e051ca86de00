//! Remote bootstrap
//!
//! A replica whose leader has already garbage collected the log entries it
//! needs cannot catch up by replay. It instead copies the peer's state
//! wholesale: the live data set plus every complete snapshot directory.
//!
//! The copy preserves the hard-link invariant on the receiving side. A data
//! file that the peer's snapshot shares with the peer's live directory is
//! linked to the receiver's copy of that live file instead of being copied a
//! second time.

use crate::paths::{file_inode, is_sst_file, sync_dir, TabletPaths, TEMP_SUFFIX};
use crate::replica::TabletReplica;
use crate::snapshots::LocalSnapshotState;
use crate::storage::TabletStorage;
use std::path::Path;
use tabletsnap_core::{OpId, Result, SnapshotError, SnapshotId};
use tracing::info;

/// Summary of one remote bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapSummary {
    /// Op id the receiver's data reflected after the copy
    pub bootstrap_op_id: OpId,
    /// Log entries replayed on top of the copied data
    pub replayed: usize,
    /// Snapshot directories copied from the peer
    pub snapshots: Vec<SnapshotId>,
}

/// Replace `dest`'s state with a copy of `source`'s
pub fn remote_bootstrap(source: &TabletReplica, dest: &TabletReplica) -> Result<BootstrapSummary> {
    if source.tablet_id() != dest.tablet_id() {
        return Err(SnapshotError::invalid_argument(format!(
            "Cannot bootstrap tablet {} from tablet {}",
            dest.tablet_id(),
            source.tablet_id()
        )));
    }
    let _source_guard = source.bootstrap_lock.lock();
    let _dest_guard = dest.bootstrap_lock.lock();

    // 1. Live data: checkpoint on the peer, ship, install.
    let outgoing = outgoing_dir(source.paths());
    remove_if_exists(&outgoing)?;
    let checkpoint_op_id = source.store().checkpoint(&outgoing)?;

    let incoming = dest.paths().bootstrap_dir();
    remove_if_exists(&incoming)?;
    copy_dir(&outgoing, &incoming)?;
    std::fs::remove_dir_all(&outgoing)?;

    let bootstrap_op_id = dest.store().restore_from(&incoming)?;
    std::fs::remove_dir_all(&incoming)?;
    dest.log().reset_to(bootstrap_op_id);

    // 2. Snapshot directories, replacing whatever the receiver had.
    for snapshot_id in dest.snapshots().list_local_snapshots()? {
        dest.snapshots().delete_local_snapshot(snapshot_id)?;
    }
    let mut snapshots = Vec::new();
    for snapshot_id in source.snapshots().list_local_snapshots()? {
        if source.snapshots().local_snapshot_state(snapshot_id)? != LocalSnapshotState::Complete {
            continue;
        }
        copy_snapshot(source, dest, snapshot_id)?;
        snapshots.push(snapshot_id);
    }

    // 3. Replay whatever the peer still has past the checkpoint.
    let replayed = dest.catch_up_from(source)?;

    info!(
        target: "tabletsnap::tablet",
        tablet_id = %dest.tablet_id(),
        %checkpoint_op_id,
        replayed,
        snapshots = snapshots.len(),
        "Remote bootstrap finished"
    );
    Ok(BootstrapSummary {
        bootstrap_op_id,
        replayed,
        snapshots,
    })
}

fn copy_snapshot(source: &TabletReplica, dest: &TabletReplica, snapshot_id: SnapshotId) -> Result<()> {
    let src_dir = source.paths().snapshot_dir(snapshot_id);
    let src_live = source.paths().rocksdb_dir();
    let dest_live = dest.paths().rocksdb_dir();

    dest.snapshots().install_snapshot(snapshot_id, |staging| {
        for entry in std::fs::read_dir(&src_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let from = entry.path();
            let to = staging.join(&name);
            let linkable = is_sst_file(&name)
                && shares_inode(&from, &src_live.join(&name))
                && dest_live.join(&name).is_file();
            if linkable {
                std::fs::hard_link(dest_live.join(&name), &to)?;
            } else {
                std::fs::copy(&from, &to)?;
            }
        }
        Ok(())
    })
}

fn shares_inode(a: &Path, b: &Path) -> bool {
    match (file_inode(a), file_inode(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

fn outgoing_dir(paths: &TabletPaths) -> std::path::PathBuf {
    paths.root().join(format!("bootstrap-source{}", TEMP_SUFFIX))
}

fn remove_if_exists(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        std::fs::copy(entry.path(), to.join(entry.file_name()))?;
    }
    sync_dir(to)
}
