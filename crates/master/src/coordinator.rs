//! Snapshot coordinator
//!
//! Public operations validate their input, persist the initial entry and
//! return. The per-tablet work runs on the fan-out pool:
//!
//! ```text
//! create_snapshot ──► one task per tablet ──► resolve target op id
//!                                          └─► one task per replica ──► CreateLocalSnapshot
//!                                                                    └─► TabletReport ──► Registry
//! ```
//!
//! Restore and delete fan out the same way without the target step. Every
//! directive result comes back as a `TabletReport` folded in by the
//! registry; the coordinator never edits an entry itself.

use crate::catalog::{CatalogManager, ReplicaLocator};
use crate::import::{import_snapshot_meta, ImportedTable};
use crate::pool::{FanoutHandle, FanoutPool, PoolStats};
use crate::registry::{
    DirectiveKind, Registry, RestorationEntry, SnapshotEntry, TabletProgress, TabletReport,
};
use crate::retry::{Attempt, RetryPolicy};
use crate::store::CatalogStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tabletsnap_core::{
    AckPolicy, NamespaceRecord, OpId, RestorationId, RestorationState, Result, SnapshotConfig,
    SnapshotError, SnapshotId, SnapshotState, SysRowEntry, TableId, TableName, TableRecord,
    TabletId, TabletRecord, TabletService,
};
use tracing::{debug, info, warn};

/// One snapshot as returned by [`SnapshotCoordinator::list_snapshots`]
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    /// Snapshot id
    pub id: SnapshotId,
    /// Lifecycle state
    pub state: SnapshotState,
    /// Requested as transaction aware
    pub transaction_aware: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Tablets the snapshot spans
    pub tablet_ids: Vec<TabletId>,
    /// Captured catalog entries, only when preparing for backup
    pub entries: Option<Vec<SysRowEntry>>,
}

/// Answer of [`SnapshotCoordinator::list_snapshots`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListSnapshotsResponse {
    /// Matching snapshots, ordered by id
    pub snapshots: Vec<SnapshotInfo>,
    /// Non-transaction-aware snapshot still being created, if any
    pub current_snapshot_id: Option<SnapshotId>,
}

/// One restoration as returned by [`SnapshotCoordinator::list_snapshot_restorations`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorationInfo {
    /// Restoration id
    pub id: RestorationId,
    /// Restored snapshot
    pub snapshot_id: SnapshotId,
    /// Lifecycle state
    pub state: RestorationState,
    /// Tablets being restored
    pub tablets_total: usize,
    /// Tablets restored on every replica
    pub tablets_done: usize,
    /// Tablets that cannot be restored
    pub tablets_failed: usize,
    /// Failed tablets whose replicas now disagree: some hold the snapshot's
    /// data, others still hold their own
    pub inconsistent_tablets: Vec<TabletId>,
}

impl From<&RestorationEntry> for RestorationInfo {
    fn from(entry: &RestorationEntry) -> Self {
        Self {
            id: entry.id,
            snapshot_id: entry.snapshot_id,
            state: entry.state,
            tablets_total: entry.tablets_total(),
            tablets_done: entry.tablets_done(),
            tablets_failed: entry.tablets_failed(),
            inconsistent_tablets: entry.inconsistent_tablets(),
        }
    }
}

struct Shared {
    config: SnapshotConfig,
    registry: Registry,
    catalog: Arc<dyn CatalogManager>,
    locator: Arc<dyn ReplicaLocator>,
    fanout: FanoutHandle,
    retry: RetryPolicy,
    /// Serializes restore/delete admission so a delete never starts while a
    /// restoration of the same snapshot is being admitted.
    admission: Mutex<()>,
}

/// Drives snapshot creation, restoration, deletion and import
pub struct SnapshotCoordinator {
    shared: Arc<Shared>,
    pool: FanoutPool,
}

impl SnapshotCoordinator {
    /// Open a coordinator and resume in-flight work
    ///
    /// With `data_dir` the registry is durable under `data_dir/sys_catalog`;
    /// without it everything is kept in memory.
    pub fn open(
        config: SnapshotConfig,
        data_dir: Option<&Path>,
        catalog: Arc<dyn CatalogManager>,
        locator: Arc<dyn ReplicaLocator>,
    ) -> Result<Self> {
        let coordinator = Self::new(config, data_dir, catalog, locator)?;
        coordinator.load()?;
        Ok(coordinator)
    }

    /// Create a coordinator whose registry is not loaded yet
    ///
    /// Queries answer `ServiceUnavailable` until [`SnapshotCoordinator::load`]
    /// runs.
    pub fn new(
        config: SnapshotConfig,
        data_dir: Option<&Path>,
        catalog: Arc<dyn CatalogManager>,
        locator: Arc<dyn ReplicaLocator>,
    ) -> Result<Self> {
        config.validate()?;
        let store = data_dir.map(CatalogStore::open).transpose()?;
        let pool = FanoutPool::new(config.fanout_threads, config.fanout_queue_depth)?;
        let shared = Arc::new(Shared {
            retry: RetryPolicy::from_config(&config),
            config,
            registry: Registry::new(store),
            catalog,
            locator,
            fanout: pool.handle(),
            admission: Mutex::new(()),
        });
        Ok(Self { shared, pool })
    }

    /// Load the registry and restart directives of unfinished entries
    pub fn load(&self) -> Result<()> {
        self.shared.registry.load()?;
        resume(&self.shared)
    }

    /// Whether the registry is loaded
    pub fn is_ready(&self) -> bool {
        self.shared.registry.is_ready()
    }

    /// Configuration in use
    pub fn config(&self) -> &SnapshotConfig {
        &self.shared.config
    }

    /// Block until every queued directive has finished
    pub fn drain(&self) {
        self.pool.drain();
    }

    /// Fan-out pool metrics
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Start a snapshot of `table_ids`
    ///
    /// Returns once the entry is persisted in `CREATING`; poll
    /// [`SnapshotCoordinator::list_snapshots`] for completion.
    ///
    /// # Errors
    /// * `InvalidArgument` - no tables given
    /// * `NotFound` - a table does not exist
    /// * `ServiceUnavailable` - a table is still being created, or the
    ///   registry is not loaded
    pub fn create_snapshot(&self, table_ids: &[TableId], transaction_aware: bool) -> Result<SnapshotId> {
        if table_ids.is_empty() {
            return Err(SnapshotError::invalid_argument("No tables to snapshot"));
        }
        let shared = &self.shared;

        let mut entries = Vec::new();
        let mut namespaces = BTreeSet::new();
        let mut tablets = Vec::new();
        let mut seen_tables = BTreeSet::new();
        for table_id in table_ids {
            if !seen_tables.insert(table_id.clone()) {
                continue;
            }
            let table = shared.catalog.table(table_id)?;
            if !table.running {
                return Err(SnapshotError::service_unavailable(format!(
                    "Table {} is still being created",
                    table.name
                )));
            }
            if namespaces.insert(table.namespace_id.clone()) {
                let name = shared.catalog.namespace_name(&table.namespace_id)?;
                entries.push(SysRowEntry::namespace(
                    &table.namespace_id,
                    &NamespaceRecord { name },
                )?);
            }
            entries.push(SysRowEntry::table(
                &table.table_id,
                &TableRecord {
                    name: table.name.table_name.clone(),
                    namespace_id: table.namespace_id.clone(),
                    schema: table.schema.clone(),
                },
            )?);
            for tablet in &table.tablets {
                entries.push(SysRowEntry::tablet(
                    &tablet.tablet_id,
                    &TabletRecord {
                        table_id: table.table_id.clone(),
                        partition: tablet.partition.clone(),
                    },
                )?);
                tablets.push(progress_for(
                    shared,
                    &tablet.tablet_id,
                    shared.config.create_ack,
                )?);
            }
        }
        if tablets.is_empty() {
            return Err(SnapshotError::illegal_state("Tables have no tablets"));
        }

        let entry = SnapshotEntry::new(SnapshotId::new(), transaction_aware, entries, tablets);
        let snapshot_id = entry.id;
        let tablet_ids = entry.tablet_ids();
        shared.registry.insert_snapshot(entry)?;
        info!(
            target: "tabletsnap::master",
            %snapshot_id,
            tables = seen_tables.len(),
            tablets = tablet_ids.len(),
            transaction_aware,
            "Snapshot creation started"
        );

        for tablet_id in tablet_ids {
            submit_create_tablet(shared, snapshot_id, tablet_id);
        }
        Ok(snapshot_id)
    }

    /// List snapshots, or just the one matching `filter`
    ///
    /// Catalog entries are attached only when `prepare_for_backup` is set.
    /// `current_snapshot_id` is reported for unfiltered queries only.
    pub fn list_snapshots(
        &self,
        filter: Option<SnapshotId>,
        prepare_for_backup: bool,
    ) -> Result<ListSnapshotsResponse> {
        let entries = self.shared.registry.snapshots()?;
        let current_snapshot_id = match filter {
            Some(_) => None,
            None => entries
                .iter()
                .find(|e| !e.transaction_aware && e.state == SnapshotState::Creating)
                .map(|e| e.id),
        };
        let snapshots = entries
            .into_iter()
            .filter(|e| filter.map_or(true, |id| e.id == id))
            .map(|e| SnapshotInfo {
                id: e.id,
                state: e.state,
                transaction_aware: e.transaction_aware,
                created_at: e.created_at,
                tablet_ids: e.tablet_ids(),
                entries: prepare_for_backup.then_some(e.entries),
            })
            .collect();
        Ok(ListSnapshotsResponse {
            snapshots,
            current_snapshot_id,
        })
    }

    /// Delete a snapshot
    ///
    /// A snapshot still being created or restored is marked and deleted once
    /// that operation finishes. Deleting a snapshot already in `DELETING`
    /// re-sends the delete to every replica that has not confirmed.
    pub fn delete_snapshot(&self, snapshot_id: SnapshotId) -> Result<()> {
        let shared = &self.shared;
        let _admission = shared.admission.lock();
        let entry = shared.registry.snapshot(snapshot_id)?;
        match entry.state {
            SnapshotState::Creating => {
                shared
                    .registry
                    .update_snapshot(snapshot_id, |e| e.delete_requested = true)?;
                info!(target: "tabletsnap::master", %snapshot_id, "Delete deferred until creation finishes");
                // Creation may have finished before the flag landed.
                let entry = shared.registry.snapshot(snapshot_id)?;
                if entry.state.is_terminal() {
                    begin_delete(shared, snapshot_id, entry.state)?;
                }
            }
            SnapshotState::Complete | SnapshotState::Failed => {
                if shared.registry.active_restorations(snapshot_id)?.is_empty() {
                    begin_delete(shared, snapshot_id, entry.state)?;
                } else {
                    shared
                        .registry
                        .update_snapshot(snapshot_id, |e| e.delete_requested = true)?;
                    info!(target: "tabletsnap::master", %snapshot_id, "Delete deferred until restoration finishes");
                }
            }
            SnapshotState::Deleting => {
                shared.registry.update_snapshot(snapshot_id, |e| {
                    for tablet in &mut e.tablets {
                        tablet.failed.clear();
                    }
                })?;
                info!(target: "tabletsnap::master", %snapshot_id, "Re-sending snapshot delete");
                fan_out_delete(shared, snapshot_id);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Restorations
    // ========================================================================

    /// Start restoring a complete snapshot
    ///
    /// A tablet counts as restored once every replica rolled back. A replica
    /// that cannot, for instance because it lacks the snapshot, fails the
    /// restoration; tablets left with some replicas restored and others not
    /// are listed in [`RestorationInfo::inconsistent_tablets`].
    ///
    /// # Errors
    /// * `NotFound` - no such snapshot
    /// * `IllegalState` - the snapshot is not `COMPLETE`, or is being deleted
    pub fn restore_snapshot(&self, snapshot_id: SnapshotId) -> Result<RestorationId> {
        let shared = &self.shared;
        let (restoration_id, tablet_ids) = {
            let _admission = shared.admission.lock();
            let snapshot = shared.registry.snapshot(snapshot_id)?;
            if snapshot.state != SnapshotState::Complete || snapshot.delete_requested {
                return Err(SnapshotError::illegal_state(format!(
                    "Snapshot {} is {}{}, only COMPLETE snapshots can be restored",
                    snapshot_id,
                    snapshot.state,
                    if snapshot.delete_requested { " (delete pending)" } else { "" }
                )));
            }

            let tablets = snapshot
                .tablets
                .iter()
                .map(|t| progress_for(shared, &t.tablet_id, AckPolicy::All))
                .collect::<Result<Vec<_>>>()?;
            let entry = RestorationEntry::new(RestorationId::new(), snapshot_id, tablets);
            let restoration_id = entry.id;
            let tablet_ids: Vec<_> = entry.tablets.iter().map(|t| t.tablet_id.clone()).collect();
            shared.registry.insert_restoration(entry)?;
            (restoration_id, tablet_ids)
        };
        info!(
            target: "tabletsnap::master",
            %restoration_id,
            %snapshot_id,
            tablets = tablet_ids.len(),
            "Restoration started"
        );

        for tablet_id in tablet_ids {
            fan_out_restore(shared, restoration_id, snapshot_id, &tablet_id, &BTreeSet::new());
        }
        Ok(restoration_id)
    }

    /// List restorations, or just the one matching `filter`
    ///
    /// # Errors
    /// * `InvalidArgument` - `filter` is the nil id
    /// * `ServiceUnavailable` - the registry is not loaded yet
    pub fn list_snapshot_restorations(
        &self,
        filter: Option<RestorationId>,
    ) -> Result<Vec<RestorationInfo>> {
        if let Some(id) = filter {
            id.require_valid()?;
        }
        Ok(self
            .shared
            .registry
            .restorations()?
            .iter()
            .filter(|r| filter.map_or(true, |id| r.id == id))
            .map(RestorationInfo::from)
            .collect())
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Recreate the tables of an exported snapshot bundle
    pub fn import_snapshot_meta(&self, entries: &[SysRowEntry]) -> Result<Vec<ImportedTable>> {
        import_snapshot_meta(self.shared.catalog.as_ref(), entries)
    }

    /// Whether creation of the named table has finished
    pub fn is_create_table_done(&self, name: &TableName) -> Result<bool> {
        self.shared.catalog.is_create_table_done(name)
    }
}

fn progress_for(shared: &Shared, tablet_id: &TabletId, policy: AckPolicy) -> Result<TabletProgress> {
    let replicas: Vec<String> = shared
        .locator
        .replicas(tablet_id)?
        .iter()
        .map(|s| s.server_id().to_string())
        .collect();
    let required = policy.required(replicas.len());
    Ok(TabletProgress::new(tablet_id.clone(), replicas, required))
}

fn resume(shared: &Arc<Shared>) -> Result<()> {
    for entry in shared.registry.snapshots()? {
        match entry.state {
            SnapshotState::Creating => {
                debug!(target: "tabletsnap::master", snapshot_id = %entry.id, "Resuming snapshot creation");
                for tablet in entry.tablets.iter().filter(|t| !t.is_done()) {
                    submit_create_tablet(shared, entry.id, tablet.tablet_id.clone());
                }
            }
            SnapshotState::Deleting => {
                debug!(target: "tabletsnap::master", snapshot_id = %entry.id, "Resuming snapshot delete");
                fan_out_delete(shared, entry.id);
            }
            SnapshotState::Complete | SnapshotState::Failed if entry.delete_requested => {
                maybe_finish_deferred_delete(shared, entry.id);
            }
            SnapshotState::Complete | SnapshotState::Failed => {}
        }
    }
    for entry in shared.registry.restorations()? {
        if entry.state != RestorationState::Restoring {
            continue;
        }
        debug!(target: "tabletsnap::master", restoration_id = %entry.id, "Resuming restoration");
        for tablet in entry.tablets.iter().filter(|t| !t.is_done()) {
            fan_out_restore(shared, entry.id, entry.snapshot_id, &tablet.tablet_id, &tablet.acked);
        }
    }
    Ok(())
}

// ============================================================================
// Fan-out
// ============================================================================

fn submit(shared: &Arc<Shared>, what: &str, task: impl FnOnce() + Send + 'static) -> bool {
    match shared.fanout.submit(task) {
        Ok(()) => true,
        Err(e) => {
            if !shared.fanout.is_shutting_down() {
                warn!(target: "tabletsnap::master", what, error = %e, "Could not queue directive");
            }
            false
        }
    }
}

fn is_cancelled(shared: &Shared) -> bool {
    shared.fanout.is_shutting_down()
}

/// Directive results are dropped during shutdown; the entry stays in flight
/// and is resumed on the next open.
fn should_report(shared: &Shared, result: &Result<impl Sized>) -> bool {
    result.is_ok() || !is_cancelled(shared)
}

fn submit_create_tablet(shared: &Arc<Shared>, snapshot_id: SnapshotId, tablet_id: TabletId) {
    let task_shared = Arc::clone(shared);
    let task_tablet = tablet_id.clone();
    if !submit(shared, "create snapshot", move || {
        create_tablet(&task_shared, snapshot_id, task_tablet, Attempt::first())
    }) && !is_cancelled(shared)
    {
        let error = SnapshotError::service_unavailable("Fan-out queue is full");
        fail_tablet(shared, snapshot_id, &tablet_id, DirectiveKind::Create, &error);
    }
}

/// Settle one attempt of a directive
///
/// Returns the final result, or `None` once the next attempt is queued on
/// the pool or the directive is no longer needed.
fn settle<T>(
    shared: &Arc<Shared>,
    what: &'static str,
    attempt: Attempt,
    result: Result<T>,
    abandoned: impl FnOnce() -> bool,
    retry: impl FnOnce(Attempt) + Send + 'static,
) -> Option<Result<T>> {
    let err = match result {
        Ok(value) => return Some(Ok(value)),
        Err(e) if is_cancelled(shared) => return Some(Err(e)),
        Err(e) => e,
    };
    let delay = match shared.retry.backoff(what, attempt, err) {
        Ok(delay) => delay,
        Err(e) => return Some(Err(e)),
    };
    if abandoned() {
        debug!(target: "tabletsnap::master", what, "Directive no longer needed");
        return None;
    }
    match shared.fanout.submit_after(delay, move || retry(attempt.next())) {
        Ok(()) => None,
        Err(e) => Some(Err(SnapshotError::service_unavailable(e.to_string()))),
    }
}

/// Resolve the tablet's target op id, then send the directive to each replica
fn create_tablet(shared: &Arc<Shared>, snapshot_id: SnapshotId, tablet_id: TabletId, attempt: Attempt) {
    let entry = match shared.registry.snapshot(snapshot_id) {
        Ok(entry) if entry.state == SnapshotState::Creating => entry,
        _ => return,
    };
    let Some(progress) = entry.tablets.iter().find(|t| t.tablet_id == tablet_id) else {
        return;
    };

    let services = match shared.locator.replicas(&tablet_id) {
        Ok(services) => services,
        Err(e) => {
            fail_tablet(shared, snapshot_id, &tablet_id, DirectiveKind::Create, &e);
            return;
        }
    };

    let target = match progress.target_op_id {
        Some(target) => target,
        None => {
            let result = resolve_target(shared, snapshot_id, &tablet_id, &services);
            let retry_shared = Arc::clone(shared);
            let retry_tablet = tablet_id.clone();
            let settled = settle(shared, "resolve target op id", attempt, result, || false, move |next| {
                create_tablet(&retry_shared, snapshot_id, retry_tablet, next)
            });
            match settled {
                None => return,
                Some(Ok(target)) => target,
                Some(Err(e)) => {
                    if !is_cancelled(shared) {
                        fail_tablet(shared, snapshot_id, &tablet_id, DirectiveKind::Create, &e);
                    }
                    return;
                }
            }
        }
    };

    for service in services {
        let server_id = service.server_id().to_string();
        if progress.acked.contains(&server_id) || !progress.replicas.contains(&server_id) {
            continue;
        }
        let task_shared = Arc::clone(shared);
        let task_tablet = tablet_id.clone();
        submit(shared, "create snapshot", move || {
            run_create(&task_shared, snapshot_id, task_tablet, service, target, Attempt::first())
        });
    }
}

/// Highest last-received op id among the replicas that answer
///
/// The value is recorded on the entry so every replica, including ones
/// retried after a restart, waits for the same position.
fn resolve_target(
    shared: &Shared,
    snapshot_id: SnapshotId,
    tablet_id: &TabletId,
    services: &[Arc<dyn TabletService>],
) -> Result<OpId> {
    let mut best: Option<OpId> = None;
    let mut last_error = None;
    for service in services {
        match service.last_received_op_id(tablet_id) {
            Ok(op_id) => best.get_or_insert(op_id).make_at_least(op_id),
            Err(e) => last_error = Some(e),
        }
    }
    let target = match (best, last_error) {
        (Some(op_id), _) => op_id,
        (None, Some(e)) => return Err(e),
        (None, None) => {
            return Err(SnapshotError::service_unavailable(format!(
                "Tablet {} has no replicas",
                tablet_id
            )))
        }
    };

    let entry = shared.registry.update_snapshot(snapshot_id, |e| {
        if let Some(t) = e.tablets.iter_mut().find(|t| &t.tablet_id == tablet_id) {
            t.target_op_id.get_or_insert(target);
        }
    })?;
    let recorded = entry
        .tablets
        .iter()
        .find(|t| &t.tablet_id == tablet_id)
        .and_then(|t| t.target_op_id)
        .unwrap_or(target);
    debug!(
        target: "tabletsnap::master",
        %snapshot_id,
        %tablet_id,
        target_op_id = %recorded,
        "Resolved snapshot target"
    );
    Ok(recorded)
}

/// Retrying a create stops once the snapshot is failed, waiting for its
/// delete, or gone, or once this replica's acknowledgement is on record.
///
/// A `COMPLETE` snapshot keeps retrying so lagging replicas still get it.
fn create_abandoned(shared: &Shared, snapshot_id: SnapshotId, tablet_id: &TabletId, server_id: &str) -> bool {
    let Ok(entry) = shared.registry.snapshot(snapshot_id) else {
        return true;
    };
    let acked = entry
        .tablets
        .iter()
        .any(|t| &t.tablet_id == tablet_id && t.acked.contains(server_id));
    match entry.state {
        SnapshotState::Creating => acked,
        SnapshotState::Complete => acked || entry.delete_requested,
        SnapshotState::Failed | SnapshotState::Deleting => true,
    }
}

fn run_create(
    shared: &Arc<Shared>,
    snapshot_id: SnapshotId,
    tablet_id: TabletId,
    service: Arc<dyn TabletService>,
    target: OpId,
    attempt: Attempt,
) {
    let result = service.create_tablet_snapshot(&tablet_id, snapshot_id, target);
    let retry_shared = Arc::clone(shared);
    let retry_tablet = tablet_id.clone();
    let retry_service = Arc::clone(&service);
    let Some(result) = settle(
        shared,
        "create tablet snapshot",
        attempt,
        result,
        || create_abandoned(shared, snapshot_id, &tablet_id, service.server_id()),
        move |next| run_create(&retry_shared, snapshot_id, retry_tablet, retry_service, target, next),
    ) else {
        return;
    };
    if !should_report(shared, &result) {
        return;
    }
    let report = match result {
        Ok(local) => TabletReport::succeeded(
            DirectiveKind::Create,
            tablet_id,
            service.server_id(),
            Some(local.captured_op_id),
        ),
        Err(e) => {
            warn!(
                target: "tabletsnap::master",
                %snapshot_id,
                %tablet_id,
                server_id = service.server_id(),
                error = %e,
                "Tablet snapshot failed"
            );
            TabletReport::failed(DirectiveKind::Create, tablet_id, service.server_id(), &e)
        }
    };
    handle_snapshot_report(shared, snapshot_id, &report);
}

fn fan_out_delete(shared: &Arc<Shared>, snapshot_id: SnapshotId) {
    let entry = match shared.registry.snapshot(snapshot_id) {
        Ok(entry) if entry.state == SnapshotState::Deleting => entry,
        _ => return,
    };
    for progress in entry.tablets.iter().filter(|t| !t.is_done()) {
        let services = match shared.locator.replicas(&progress.tablet_id) {
            Ok(services) => services,
            Err(e) => {
                fail_tablet(shared, snapshot_id, &progress.tablet_id, DirectiveKind::Delete, &e);
                continue;
            }
        };
        for service in services {
            let server_id = service.server_id().to_string();
            if progress.acked.contains(&server_id) || !progress.replicas.contains(&server_id) {
                continue;
            }
            let task_shared = Arc::clone(shared);
            let tablet_id = progress.tablet_id.clone();
            submit(shared, "delete snapshot", move || {
                run_delete(&task_shared, snapshot_id, tablet_id, service, Attempt::first())
            });
        }
    }
}

fn run_delete(
    shared: &Arc<Shared>,
    snapshot_id: SnapshotId,
    tablet_id: TabletId,
    service: Arc<dyn TabletService>,
    attempt: Attempt,
) {
    let result = service.delete_tablet_snapshot(&tablet_id, snapshot_id);
    let retry_shared = Arc::clone(shared);
    let retry_tablet = tablet_id.clone();
    let retry_service = Arc::clone(&service);
    let Some(result) = settle(
        shared,
        "delete tablet snapshot",
        attempt,
        result,
        || !matches!(shared.registry.snapshot(snapshot_id), Ok(e) if e.state == SnapshotState::Deleting),
        move |next| run_delete(&retry_shared, snapshot_id, retry_tablet, retry_service, next),
    ) else {
        return;
    };
    if !should_report(shared, &result) {
        return;
    }
    let report = match result {
        Ok(()) => TabletReport::succeeded(DirectiveKind::Delete, tablet_id, service.server_id(), None),
        Err(e) => {
            warn!(
                target: "tabletsnap::master",
                %snapshot_id,
                %tablet_id,
                server_id = service.server_id(),
                error = %e,
                "Tablet snapshot delete failed"
            );
            TabletReport::failed(DirectiveKind::Delete, tablet_id, service.server_id(), &e)
        }
    };
    handle_snapshot_report(shared, snapshot_id, &report);
}

fn fan_out_restore(
    shared: &Arc<Shared>,
    restoration_id: RestorationId,
    snapshot_id: SnapshotId,
    tablet_id: &TabletId,
    acked: &BTreeSet<String>,
) {
    let services = match shared.locator.replicas(tablet_id) {
        Ok(services) => services,
        Err(e) => {
            for server_id in replicas_of_restoration(shared, restoration_id, tablet_id) {
                let report = TabletReport::failed(DirectiveKind::Restore, tablet_id.clone(), server_id, &e);
                handle_restoration_report(shared, restoration_id, &report);
            }
            return;
        }
    };
    for service in services {
        if acked.contains(service.server_id()) {
            continue;
        }
        let task_shared = Arc::clone(shared);
        let task_tablet = tablet_id.clone();
        let queued = submit(shared, "restore snapshot", move || {
            run_restore(&task_shared, restoration_id, snapshot_id, task_tablet, service, Attempt::first())
        });
        if !queued && !is_cancelled(shared) {
            let error = SnapshotError::service_unavailable("Fan-out queue is full");
            for server_id in replicas_of_restoration(shared, restoration_id, tablet_id) {
                let report =
                    TabletReport::failed(DirectiveKind::Restore, tablet_id.clone(), server_id, &error);
                handle_restoration_report(shared, restoration_id, &report);
            }
            return;
        }
    }
}

fn replicas_of_restoration(
    shared: &Shared,
    restoration_id: RestorationId,
    tablet_id: &TabletId,
) -> Vec<String> {
    shared
        .registry
        .restoration(restoration_id)
        .ok()
        .and_then(|r| r.tablets.into_iter().find(|t| &t.tablet_id == tablet_id))
        .map(|t| t.replicas)
        .unwrap_or_default()
}

/// Restores are retried to the deadline even after the restoration failed;
/// every replica brought back to the snapshot narrows the inconsistency.
fn run_restore(
    shared: &Arc<Shared>,
    restoration_id: RestorationId,
    snapshot_id: SnapshotId,
    tablet_id: TabletId,
    service: Arc<dyn TabletService>,
    attempt: Attempt,
) {
    let result = service.restore_tablet_snapshot(&tablet_id, snapshot_id);
    let retry_shared = Arc::clone(shared);
    let retry_tablet = tablet_id.clone();
    let retry_service = Arc::clone(&service);
    let Some(result) = settle(
        shared,
        "restore tablet snapshot",
        attempt,
        result,
        || false,
        move |next| {
            run_restore(&retry_shared, restoration_id, snapshot_id, retry_tablet, retry_service, next)
        },
    ) else {
        return;
    };
    if !should_report(shared, &result) {
        return;
    }
    let report = match result {
        Ok(op_id) => TabletReport::succeeded(
            DirectiveKind::Restore,
            tablet_id,
            service.server_id(),
            Some(op_id),
        ),
        Err(e) => {
            warn!(
                target: "tabletsnap::master",
                %restoration_id,
                %tablet_id,
                server_id = service.server_id(),
                error = %e,
                "Tablet restore failed"
            );
            TabletReport::failed(DirectiveKind::Restore, tablet_id, service.server_id(), &e)
        }
    };
    handle_restoration_report(shared, restoration_id, &report);
}

// ============================================================================
// Reports
// ============================================================================

/// Report every replica of a tablet as failed
fn fail_tablet(
    shared: &Arc<Shared>,
    snapshot_id: SnapshotId,
    tablet_id: &TabletId,
    kind: DirectiveKind,
    error: &SnapshotError,
) {
    let replicas = shared
        .registry
        .snapshot(snapshot_id)
        .ok()
        .and_then(|e| e.tablets.into_iter().find(|t| &t.tablet_id == tablet_id))
        .map(|t| t.replicas)
        .unwrap_or_default();
    warn!(
        target: "tabletsnap::master",
        %snapshot_id,
        %tablet_id,
        error = %error,
        "Tablet directive could not be sent"
    );
    for server_id in replicas {
        let report = TabletReport::failed(kind, tablet_id.clone(), server_id, error);
        handle_snapshot_report(shared, snapshot_id, &report);
    }
}

fn handle_snapshot_report(shared: &Arc<Shared>, snapshot_id: SnapshotId, report: &TabletReport) {
    match shared.registry.apply_snapshot_report(snapshot_id, report) {
        Ok(Some(entry)) if entry.state.is_terminal() && entry.delete_requested => {
            maybe_finish_deferred_delete(shared, snapshot_id);
        }
        Ok(_) => {}
        Err(e) => warn!(
            target: "tabletsnap::master",
            %snapshot_id,
            error = %e,
            "Could not record tablet report"
        ),
    }
}

fn handle_restoration_report(
    shared: &Arc<Shared>,
    restoration_id: RestorationId,
    report: &TabletReport,
) {
    match shared.registry.apply_restoration_report(restoration_id, report) {
        Ok(Some(entry)) if entry.state.is_terminal() => {
            maybe_finish_deferred_delete(shared, entry.snapshot_id);
        }
        Ok(_) => {}
        Err(e) => warn!(
            target: "tabletsnap::master",
            %restoration_id,
            error = %e,
            "Could not record restoration report"
        ),
    }
}

/// Start a deferred delete once nothing blocks it any more
fn maybe_finish_deferred_delete(shared: &Arc<Shared>, snapshot_id: SnapshotId) {
    let _admission = shared.admission.lock();
    let Ok(entry) = shared.registry.snapshot(snapshot_id) else {
        return;
    };
    if !entry.delete_requested || !entry.state.is_terminal() {
        return;
    }
    match shared.registry.active_restorations(snapshot_id) {
        Ok(active) if active.is_empty() => {}
        _ => return,
    }
    if let Err(e) = begin_delete(shared, snapshot_id, entry.state) {
        warn!(target: "tabletsnap::master", %snapshot_id, error = %e, "Deferred delete failed to start");
    }
}

/// Move a terminal snapshot to `DELETING` and fan out the deletes
fn begin_delete(shared: &Arc<Shared>, snapshot_id: SnapshotId, from: SnapshotState) -> Result<()> {
    let entry = shared.registry.snapshot(snapshot_id)?;
    let tablets = entry
        .tablets
        .iter()
        .map(|t| match progress_for(shared, &t.tablet_id, AckPolicy::All) {
            Ok(progress) => progress,
            // No replicas left means nothing to delete for this tablet.
            Err(_) => TabletProgress::new(t.tablet_id.clone(), Vec::new(), 0),
        })
        .collect::<Vec<_>>();
    shared
        .registry
        .transition_snapshot(snapshot_id, from, SnapshotState::Deleting, |e| {
            e.tablets = tablets;
            e.delete_requested = false;
        })?;
    if shared.registry.remove_deleted_snapshot(snapshot_id)? {
        return Ok(());
    }
    fan_out_delete(shared, snapshot_id);
    Ok(())
}
