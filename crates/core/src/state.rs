//! Lifecycle states of snapshots and restorations
//!
//! ```text
//! Snapshot:     CREATING ──► COMPLETE ──► DELETING ──► (removed)
//!                   │                        ▲
//!                   └──────► FAILED ─────────┘
//!
//! Restoration:  RESTORING ──► RESTORED
//!                   │
//!                   └──────► FAILED
//! ```
//!
//! States only move forward. A terminal state never reverts, which is what
//! lets pollers and completion callbacks be applied any number of times.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotState {
    /// Tablet-level snapshots are being produced
    Creating,
    /// Every tablet has at least the required replicas snapshotted
    Complete,
    /// Some tablet could not be snapshotted within the retry budget
    Failed,
    /// Tablet-level snapshots are being removed
    Deleting,
}

impl SnapshotState {
    /// Whether the creation pipeline has finished (successfully or not)
    pub fn is_terminal(&self) -> bool {
        matches!(self, SnapshotState::Complete | SnapshotState::Failed)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: SnapshotState) -> bool {
        use SnapshotState::*;
        matches!(
            (self, next),
            (Creating, Complete) | (Creating, Failed) | (Complete, Deleting) | (Failed, Deleting)
        )
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotState::Creating => "CREATING",
            SnapshotState::Complete => "COMPLETE",
            SnapshotState::Failed => "FAILED",
            SnapshotState::Deleting => "DELETING",
        };
        f.write_str(s)
    }
}

/// State of a restoration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestorationState {
    /// Tablets are being rolled back to the snapshot
    Restoring,
    /// Every tablet confirmed the restore
    Restored,
    /// Some tablet could not be restored; affected tablets need an operator
    Failed,
}

impl RestorationState {
    /// Whether the restoration has finished (successfully or not)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RestorationState::Restoring)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: RestorationState) -> bool {
        matches!(
            (self, next),
            (RestorationState::Restoring, RestorationState::Restored)
                | (RestorationState::Restoring, RestorationState::Failed)
        )
    }
}

impl fmt::Display for RestorationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestorationState::Restoring => "RESTORING",
            RestorationState::Restored => "RESTORED",
            RestorationState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
