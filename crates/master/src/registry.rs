//! Global snapshot / restoration registry
//!
//! The registry is the only owner of snapshot and restoration entries. Other
//! components never mutate an entry; they hand the registry a `TabletReport`
//! and the registry folds it in with a pure function:
//!
//! ```text
//! apply_snapshot_report(entry, report)    -> entry'
//! apply_restoration_report(entry, report) -> entry'
//! ```
//!
//! Replica acknowledgements are tracked as sets, so applying the same report
//! twice yields the same entry, and terminal states never revert. Explicit
//! state changes go through compare-and-set on the current state.
//!
//! Every accepted change is written to the durable `sys_catalog` before it
//! becomes visible.

use crate::store::{CatalogImage, CatalogStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tabletsnap_core::{
    OpId, RestorationId, RestorationState, Result, SnapshotError, SnapshotId, SnapshotState,
    SysRowEntry, TabletId,
};
use tracing::{info, warn};

/// Per-tablet directive progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletProgress {
    /// Tablet
    pub tablet_id: TabletId,
    /// Servers hosting a replica when the directive was fanned out
    pub replicas: Vec<String>,
    /// Acknowledgements needed for the tablet to count as done
    pub required: usize,
    /// Target op id chosen for the tablet, once known
    pub target_op_id: Option<OpId>,
    /// Servers that acknowledged
    pub acked: BTreeSet<String>,
    /// Servers that gave up, with their last error
    pub failed: BTreeMap<String, String>,
}

impl TabletProgress {
    /// Fresh progress for a directive
    pub fn new(tablet_id: TabletId, replicas: Vec<String>, required: usize) -> Self {
        Self {
            tablet_id,
            replicas,
            required,
            target_op_id: None,
            acked: BTreeSet::new(),
            failed: BTreeMap::new(),
        }
    }

    /// Enough replicas acknowledged
    pub fn is_done(&self) -> bool {
        self.acked.len() >= self.required
    }

    /// Too many replicas gave up for the tablet to ever be done
    pub fn is_failed(&self) -> bool {
        !self.is_done() && self.replicas.len().saturating_sub(self.failed.len()) < self.required
    }

    fn record(&mut self, server_id: &str, result: &ReportResult) {
        match result {
            ReportResult::Succeeded(_) => {
                self.failed.remove(server_id);
                self.acked.insert(server_id.to_string());
            }
            ReportResult::Failed(error) => {
                if !self.acked.contains(server_id) {
                    self.failed.insert(server_id.to_string(), error.clone());
                }
            }
        }
    }
}

/// Durable record of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Snapshot id
    pub id: SnapshotId,
    /// Lifecycle state
    pub state: SnapshotState,
    /// Whether the snapshot was requested as transaction aware
    pub transaction_aware: bool,
    /// Namespace, table and tablet records captured at creation
    pub entries: Vec<SysRowEntry>,
    /// Progress of the current phase (creation or deletion)
    pub tablets: Vec<TabletProgress>,
    /// Highest op id any replica captured
    pub current_op_id: OpId,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Delete once the blocking operation reaches a terminal state
    pub delete_requested: bool,
}

impl SnapshotEntry {
    /// New entry in `CREATING`
    pub fn new(
        id: SnapshotId,
        transaction_aware: bool,
        entries: Vec<SysRowEntry>,
        tablets: Vec<TabletProgress>,
    ) -> Self {
        Self {
            id,
            state: SnapshotState::Creating,
            transaction_aware,
            entries,
            tablets,
            current_op_id: OpId::MIN,
            created_at: Utc::now(),
            delete_requested: false,
        }
    }

    /// Ids of every tablet the snapshot spans
    pub fn tablet_ids(&self) -> Vec<TabletId> {
        self.tablets.iter().map(|t| t.tablet_id.clone()).collect()
    }

    /// Every tablet confirmed the delete
    pub fn is_deleted(&self) -> bool {
        self.state == SnapshotState::Deleting && self.tablets.iter().all(TabletProgress::is_done)
    }
}

/// Durable record of one restoration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorationEntry {
    /// Restoration id
    pub id: RestorationId,
    /// Snapshot being restored
    pub snapshot_id: SnapshotId,
    /// Lifecycle state
    pub state: RestorationState,
    /// Per-tablet progress
    pub tablets: Vec<TabletProgress>,
    /// Start time
    pub created_at: DateTime<Utc>,
}

impl RestorationEntry {
    /// New entry in `RESTORING`
    pub fn new(id: RestorationId, snapshot_id: SnapshotId, tablets: Vec<TabletProgress>) -> Self {
        Self {
            id,
            snapshot_id,
            state: RestorationState::Restoring,
            tablets,
            created_at: Utc::now(),
        }
    }

    /// Tablets being restored
    pub fn tablets_total(&self) -> usize {
        self.tablets.len()
    }

    /// Tablets with enough replicas restored
    pub fn tablets_done(&self) -> usize {
        self.tablets.iter().filter(|t| t.is_done()).count()
    }

    /// Tablets that cannot be restored
    pub fn tablets_failed(&self) -> usize {
        self.tablets.iter().filter(|t| t.is_failed()).count()
    }

    /// Failed tablets on which at least one replica did restore
    pub fn inconsistent_tablets(&self) -> Vec<TabletId> {
        self.tablets
            .iter()
            .filter(|t| t.is_failed() && !t.acked.is_empty())
            .map(|t| t.tablet_id.clone())
            .collect()
    }
}

/// Directive a report answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectiveKind {
    /// Create local snapshot
    Create,
    /// Delete local snapshot
    Delete,
    /// Restore from local snapshot
    Restore,
}

/// Final result of one directive on one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportResult {
    /// Directive succeeded, with the op id the replica captured or rolled back to
    Succeeded(Option<OpId>),
    /// Directive gave up after its retry budget
    Failed(String),
}

/// Completion report of one directive on one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletReport {
    /// Directive
    pub kind: DirectiveKind,
    /// Tablet
    pub tablet_id: TabletId,
    /// Reporting server
    pub server_id: String,
    /// Outcome
    pub result: ReportResult,
}

impl TabletReport {
    /// Successful directive
    pub fn succeeded(
        kind: DirectiveKind,
        tablet_id: TabletId,
        server_id: impl Into<String>,
        op_id: Option<OpId>,
    ) -> Self {
        Self {
            kind,
            tablet_id,
            server_id: server_id.into(),
            result: ReportResult::Succeeded(op_id),
        }
    }

    /// Directive that gave up
    pub fn failed(
        kind: DirectiveKind,
        tablet_id: TabletId,
        server_id: impl Into<String>,
        error: &SnapshotError,
    ) -> Self {
        Self {
            kind,
            tablet_id,
            server_id: server_id.into(),
            result: ReportResult::Failed(error.to_string()),
        }
    }
}

/// Fold a create or delete report into a snapshot entry
///
/// Reports for a phase the entry is not in are ignored.
pub fn apply_snapshot_report(entry: &SnapshotEntry, report: &TabletReport) -> SnapshotEntry {
    let mut next = entry.clone();
    let phase = match report.kind {
        DirectiveKind::Create => SnapshotState::Creating,
        DirectiveKind::Delete => SnapshotState::Deleting,
        DirectiveKind::Restore => return next,
    };
    if entry.state != phase {
        return next;
    }
    let Some(progress) = next
        .tablets
        .iter_mut()
        .find(|t| t.tablet_id == report.tablet_id)
    else {
        return next;
    };
    progress.record(&report.server_id, &report.result);

    if phase == SnapshotState::Creating {
        if let ReportResult::Succeeded(Some(op_id)) = report.result {
            next.current_op_id.make_at_least(op_id);
        }
        if next.tablets.iter().any(TabletProgress::is_failed) {
            next.state = SnapshotState::Failed;
        } else if next.tablets.iter().all(TabletProgress::is_done) {
            next.state = SnapshotState::Complete;
        }
    }
    next
}

/// Fold a restore report into a restoration entry
///
/// A `FAILED` restoration keeps recording replica outcomes so the listing
/// shows which replicas did roll back; its state no longer changes.
pub fn apply_restoration_report(entry: &RestorationEntry, report: &TabletReport) -> RestorationEntry {
    let mut next = entry.clone();
    if report.kind != DirectiveKind::Restore || entry.state == RestorationState::Restored {
        return next;
    }
    let Some(progress) = next
        .tablets
        .iter_mut()
        .find(|t| t.tablet_id == report.tablet_id)
    else {
        return next;
    };
    progress.record(&report.server_id, &report.result);

    if entry.state != RestorationState::Restoring {
        return next;
    }
    if next.tablets.iter().any(TabletProgress::is_failed) {
        next.state = RestorationState::Failed;
    } else if next.tablets.iter().all(TabletProgress::is_done) {
        next.state = RestorationState::Restored;
    }
    next
}

struct RegistryState {
    snapshots: BTreeMap<SnapshotId, SnapshotEntry>,
    restorations: BTreeMap<RestorationId, RestorationEntry>,
    loaded: bool,
}

impl RegistryState {
    fn image(&self) -> CatalogImage {
        CatalogImage {
            snapshots: self.snapshots.values().cloned().collect(),
            restorations: self.restorations.values().cloned().collect(),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.loaded {
            Ok(())
        } else {
            Err(SnapshotError::service_unavailable(
                "Snapshot registry is not loaded yet",
            ))
        }
    }
}

/// Owner of every snapshot and restoration entry
pub struct Registry {
    state: Mutex<RegistryState>,
    store: Option<CatalogStore>,
}

impl Registry {
    /// Registry backed by `store`; unusable until [`Registry::load`] succeeds
    pub fn new(store: Option<CatalogStore>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                snapshots: BTreeMap::new(),
                restorations: BTreeMap::new(),
                loaded: false,
            }),
            store,
        }
    }

    /// Ready registry without durable storage
    pub fn in_memory() -> Self {
        let registry = Self::new(None);
        registry.state.lock().loaded = true;
        registry
    }

    /// Read the durable store and start answering queries
    pub fn load(&self) -> Result<()> {
        let image = match &self.store {
            Some(store) => store.load()?.unwrap_or_default(),
            None => CatalogImage::default(),
        };
        let mut state = self.state.lock();
        state.snapshots = image.snapshots.into_iter().map(|e| (e.id, e)).collect();
        state.restorations = image.restorations.into_iter().map(|e| (e.id, e)).collect();
        state.loaded = true;
        info!(
            target: "tabletsnap::registry",
            snapshots = state.snapshots.len(),
            restorations = state.restorations.len(),
            "Registry loaded"
        );
        Ok(())
    }

    /// Whether the registry has been loaded
    pub fn is_ready(&self) -> bool {
        self.state.lock().loaded
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Persist a new snapshot entry
    pub fn insert_snapshot(&self, entry: SnapshotEntry) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_ready()?;
        if state.snapshots.contains_key(&entry.id) {
            return Err(SnapshotError::illegal_state(format!(
                "Snapshot {} already exists",
                entry.id
            )));
        }
        let id = entry.id;
        state.snapshots.insert(id, entry);
        if let Err(e) = self.persist(&state) {
            state.snapshots.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// One snapshot entry
    pub fn snapshot(&self, id: SnapshotId) -> Result<SnapshotEntry> {
        let state = self.state.lock();
        state.ensure_ready()?;
        state
            .snapshots
            .get(&id)
            .cloned()
            .ok_or_else(|| SnapshotError::not_found(format!("Snapshot {} not found", id)))
    }

    /// Every snapshot entry, ordered by id
    pub fn snapshots(&self) -> Result<Vec<SnapshotEntry>> {
        let state = self.state.lock();
        state.ensure_ready()?;
        Ok(state.snapshots.values().cloned().collect())
    }

    /// Compare-and-set the state of a snapshot
    ///
    /// `update` runs on the entry after the state change and before it is
    /// persisted.
    ///
    /// # Errors
    /// * `NotFound` - no such snapshot
    /// * `IllegalState` - the entry is not in `expected`, or `expected -> next`
    ///   is not a legal transition
    pub fn transition_snapshot<F>(
        &self,
        id: SnapshotId,
        expected: SnapshotState,
        next: SnapshotState,
        update: F,
    ) -> Result<SnapshotEntry>
    where
        F: FnOnce(&mut SnapshotEntry),
    {
        if !expected.can_transition_to(next) {
            return Err(SnapshotError::illegal_state(format!(
                "Illegal snapshot transition {} -> {}",
                expected, next
            )));
        }
        self.modify_snapshot(id, |entry| {
            if entry.state != expected {
                return Err(SnapshotError::illegal_state(format!(
                    "Snapshot {} is {}, expected {}",
                    id, entry.state, expected
                )));
            }
            entry.state = next;
            update(entry);
            Ok(())
        })
        .map(|entry| {
            info!(
                target: "tabletsnap::registry",
                snapshot_id = %id,
                from = %expected,
                to = %next,
                "Snapshot state changed"
            );
            entry
        })
    }

    /// Change fields of a snapshot other than its state
    pub fn update_snapshot<F>(&self, id: SnapshotId, update: F) -> Result<SnapshotEntry>
    where
        F: FnOnce(&mut SnapshotEntry),
    {
        self.modify_snapshot(id, |entry| {
            let state = entry.state;
            update(entry);
            entry.state = state;
            Ok(())
        })
    }

    /// Fold a report into its snapshot
    ///
    /// Returns the entry afterwards, or `None` if the snapshot is gone,
    /// including when this report completed its deletion.
    pub fn apply_snapshot_report(
        &self,
        snapshot_id: SnapshotId,
        report: &TabletReport,
    ) -> Result<Option<SnapshotEntry>> {
        let mut state = self.state.lock();
        state.ensure_ready()?;
        let Some(current) = state.snapshots.get(&snapshot_id).cloned() else {
            return Ok(None);
        };
        let next = apply_snapshot_report(&current, report);
        if next == current {
            return Ok(Some(current));
        }

        if next.is_deleted() {
            state.snapshots.remove(&snapshot_id);
        } else {
            state.snapshots.insert(snapshot_id, next.clone());
        }
        if let Err(e) = self.persist(&state) {
            state.snapshots.insert(snapshot_id, current);
            return Err(e);
        }

        if next.is_deleted() {
            info!(target: "tabletsnap::registry", %snapshot_id, "Snapshot deleted");
            return Ok(None);
        }
        if next.state != current.state {
            let failed = next.state == SnapshotState::Failed;
            log_transition("Snapshot", &snapshot_id.to_string(), current.state, next.state, failed);
        }
        Ok(Some(next))
    }

    /// Drop a `DELETING` entry whose tablets have all confirmed
    ///
    /// Covers deletions that need no directive at all, such as a snapshot
    /// whose tablets no longer have replicas. Returns whether it was removed.
    pub fn remove_deleted_snapshot(&self, id: SnapshotId) -> Result<bool> {
        let mut state = self.state.lock();
        state.ensure_ready()?;
        let Some(current) = state.snapshots.get(&id).cloned() else {
            return Ok(false);
        };
        if !current.is_deleted() {
            return Ok(false);
        }
        state.snapshots.remove(&id);
        if let Err(e) = self.persist(&state) {
            state.snapshots.insert(id, current);
            return Err(e);
        }
        info!(target: "tabletsnap::registry", snapshot_id = %id, "Snapshot deleted");
        Ok(true)
    }

    fn modify_snapshot<F>(&self, id: SnapshotId, f: F) -> Result<SnapshotEntry>
    where
        F: FnOnce(&mut SnapshotEntry) -> Result<()>,
    {
        let mut state = self.state.lock();
        state.ensure_ready()?;
        let current = state
            .snapshots
            .get(&id)
            .cloned()
            .ok_or_else(|| SnapshotError::not_found(format!("Snapshot {} not found", id)))?;
        let mut next = current.clone();
        f(&mut next)?;
        state.snapshots.insert(id, next.clone());
        if let Err(e) = self.persist(&state) {
            state.snapshots.insert(id, current);
            return Err(e);
        }
        Ok(next)
    }

    // ========================================================================
    // Restorations
    // ========================================================================

    /// Persist a new restoration entry
    pub fn insert_restoration(&self, entry: RestorationEntry) -> Result<()> {
        entry.id.require_valid()?;
        let mut state = self.state.lock();
        state.ensure_ready()?;
        let id = entry.id;
        state.restorations.insert(id, entry);
        if let Err(e) = self.persist(&state) {
            state.restorations.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// One restoration entry
    pub fn restoration(&self, id: RestorationId) -> Result<RestorationEntry> {
        let state = self.state.lock();
        state.ensure_ready()?;
        state
            .restorations
            .get(&id)
            .cloned()
            .ok_or_else(|| SnapshotError::not_found(format!("Restoration {} not found", id)))
    }

    /// Every restoration entry, ordered by id
    pub fn restorations(&self) -> Result<Vec<RestorationEntry>> {
        let state = self.state.lock();
        state.ensure_ready()?;
        Ok(state.restorations.values().cloned().collect())
    }

    /// Restorations of `snapshot_id` still in `RESTORING`
    pub fn active_restorations(&self, snapshot_id: SnapshotId) -> Result<Vec<RestorationId>> {
        let state = self.state.lock();
        state.ensure_ready()?;
        Ok(state
            .restorations
            .values()
            .filter(|r| r.snapshot_id == snapshot_id && r.state == RestorationState::Restoring)
            .map(|r| r.id)
            .collect())
    }

    /// Fold a report into a restoration
    pub fn apply_restoration_report(
        &self,
        restoration_id: RestorationId,
        report: &TabletReport,
    ) -> Result<Option<RestorationEntry>> {
        let mut state = self.state.lock();
        state.ensure_ready()?;
        let Some(current) = state.restorations.get(&restoration_id).cloned() else {
            return Ok(None);
        };
        let next = apply_restoration_report(&current, report);
        if next == current {
            return Ok(Some(current));
        }
        state.restorations.insert(restoration_id, next.clone());
        if let Err(e) = self.persist(&state) {
            state.restorations.insert(restoration_id, current);
            return Err(e);
        }
        if next.state != current.state {
            let failed = next.state == RestorationState::Failed;
            log_transition(
                "Restoration",
                &restoration_id.to_string(),
                current.state,
                next.state,
                failed,
            );
        }
        Ok(Some(next))
    }

    fn persist(&self, state: &RegistryState) -> Result<()> {
        match &self.store {
            Some(store) => store.save(&state.image()),
            None => Ok(()),
        }
    }
}

fn log_transition<S: std::fmt::Display>(kind: &str, id: &str, from: S, to: S, failed: bool) {
    if failed {
        warn!(target: "tabletsnap::registry", kind, id, %from, %to, "State changed");
    } else {
        info!(target: "tabletsnap::registry", kind, id, %from, %to, "State changed");
    }
}
