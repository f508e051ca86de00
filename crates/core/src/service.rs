//! Tablet server RPC surface used by the coordinator
//!
//! The coordinator never touches tablet storage directly. Every per-tablet
//! directive goes through this trait, which is where a network transport
//! plugs in. In-process implementations live in the tablet crate.

use crate::error::Result;
use crate::types::{OpId, SnapshotId, TabletId};

/// Outcome of a successful local snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSnapshotResult {
    /// Op id the replica's data reflects in the published directory
    pub captured_op_id: OpId,
    /// True when the directory already existed and nothing was written
    pub already_present: bool,
}

/// Snapshot directives served by one tablet server
pub trait TabletService: Send + Sync {
    /// Stable identifier of the tablet server
    fn server_id(&self) -> &str;

    /// Last op id received by the local replica of `tablet_id`
    fn last_received_op_id(&self, tablet_id: &TabletId) -> Result<OpId>;

    /// Create a local snapshot once the replica has committed `target_op_id`
    fn create_tablet_snapshot(
        &self,
        tablet_id: &TabletId,
        snapshot_id: SnapshotId,
        target_op_id: OpId,
    ) -> Result<LocalSnapshotResult>;

    /// Delete a local snapshot; deleting a missing snapshot succeeds
    fn delete_tablet_snapshot(&self, tablet_id: &TabletId, snapshot_id: SnapshotId) -> Result<()>;

    /// Replace the replica's live data with the snapshot's data
    ///
    /// Returns the op id the replica was rolled back to.
    fn restore_tablet_snapshot(&self, tablet_id: &TabletId, snapshot_id: SnapshotId) -> Result<OpId>;
}
