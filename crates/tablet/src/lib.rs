//! Tablet-side snapshot support for tabletsnap
//!
//! This crate implements everything that runs on a tablet server:
//! - `TabletSnapshots`: create / delete / restore local snapshot directories
//! - `ConsensusGate`: wait until the replica has committed a target op id
//! - `SstStore`: hard-link friendly data store behind `TabletStorage`
//! - `TabletReplica` / `TabletServer`: replicas and the `TabletService` impl
//! - `remote_bootstrap`: copy a replica wholesale from a peer
//!
//! # Directory Layout
//!
//! See [`paths`] for the on-disk structure of a tablet.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootstrap;
pub mod consensus;
pub mod format;
pub mod paths;
pub mod replica;
pub mod server;
pub mod snapshots;
pub mod storage;

pub use bootstrap::{remote_bootstrap, BootstrapSummary};
pub use consensus::{ConsensusGate, LogEntry, ReplicaConsensus, ReplicaLog};
pub use format::{DataManifest, ManifestError};
pub use paths::{file_inode, is_manifest_file, is_sst_file, TabletPaths};
pub use replica::TabletReplica;
pub use server::TabletServer;
pub use snapshots::{LocalSnapshotState, TabletSnapshots};
pub use storage::{has_checkpoint_files, SstStore, TabletStorage};
