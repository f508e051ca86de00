//! Wait-until-done helpers over the poll API
//!
//! Each helper polls a read-only coordinator query with a growing delay until
//! the condition holds or the deadline passes. Nothing here blocks inside the
//! coordinator.

use crate::coordinator::SnapshotCoordinator;
use std::time::{Duration, Instant};
use tabletsnap_core::{
    RestorationId, RestorationState, Result, SnapshotError, SnapshotId, SnapshotState, TableName,
};
use tracing::{debug, info};

/// Poll timing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitOptions {
    /// Delay before the second poll
    pub initial_delay: Duration,
    /// Factor applied to the delay after every poll
    pub backoff: f64,
    /// Cap on a single delay
    pub max_delay: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            backoff: 1.5,
            max_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
        }
    }
}

impl WaitOptions {
    /// Set the overall timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Poll `check` until it yields a value
///
/// `Ok(None)` means "not yet". Errors end the wait immediately.
pub fn wait_for<T, F>(what: &str, options: WaitOptions, mut check: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    let mut delay = options.initial_delay;
    let mut polls = 0u32;
    loop {
        polls += 1;
        if let Some(value) = check()? {
            info!(
                target: "tabletsnap::master",
                what,
                polls,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Wait finished"
            );
            return Ok(value);
        }
        if start.elapsed() + delay > options.timeout {
            return Err(SnapshotError::timeout(format!(
                "{} not done after {:?} ({} polls)",
                what, options.timeout, polls
            )));
        }
        debug!(target: "tabletsnap::master", what, polls, delay_ms = delay.as_millis() as u64, "Waiting");
        std::thread::sleep(delay);
        delay = delay.mul_f64(options.backoff).min(options.max_delay);
    }
}

/// Wait until a snapshot leaves `CREATING`
///
/// Returns the terminal state, `COMPLETE` or `FAILED`.
///
/// # Errors
/// `IllegalState` if the filtered listing holds anything but exactly one
/// snapshot.
pub fn wait_for_snapshot_op_done(
    coordinator: &SnapshotCoordinator,
    snapshot_id: SnapshotId,
    options: WaitOptions,
) -> Result<SnapshotState> {
    wait_for("IsCreateSnapshotDone", options, || {
        let listed = coordinator.list_snapshots(Some(snapshot_id), false)?;
        if listed.snapshots.len() != 1 {
            return Err(SnapshotError::illegal_state(format!(
                "Wrong number of snapshots: {}",
                listed.snapshots.len()
            )));
        }
        let state = listed.snapshots[0].state;
        Ok(state.is_terminal().then_some(state))
    })
}

/// Wait until a deleted snapshot is gone from the registry
pub fn wait_for_snapshot_deleted(
    coordinator: &SnapshotCoordinator,
    snapshot_id: SnapshotId,
    options: WaitOptions,
) -> Result<()> {
    wait_for("IsDeleteSnapshotDone", options, || {
        let listed = coordinator.list_snapshots(Some(snapshot_id), false)?;
        Ok(listed.snapshots.is_empty().then_some(()))
    })
}

/// How a restoration wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestorationOutcome {
    /// Final state, `RESTORED` or `FAILED`
    pub state: RestorationState,
    /// Polls answered with `ServiceUnavailable`
    pub unavailable_polls: u32,
}

/// Wait until a restoration reaches a terminal state
///
/// A coordinator that is not ready yet is polled again; those polls are
/// counted in the outcome rather than treated as "still restoring".
///
/// # Errors
/// * `InvalidArgument` - nil restoration id
/// * `IllegalState` - the listing holds anything but exactly one restoration
pub fn wait_for_restoration_done(
    coordinator: &SnapshotCoordinator,
    restoration_id: RestorationId,
    options: WaitOptions,
) -> Result<RestorationOutcome> {
    restoration_id.require_valid()?;
    let mut unavailable_polls = 0;
    wait_for("IsRestorationDone", options, || {
        let restorations = match coordinator.list_snapshot_restorations(Some(restoration_id)) {
            Ok(restorations) => restorations,
            Err(e) if e.is_service_unavailable() => {
                unavailable_polls += 1;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if restorations.len() != 1 {
            return Err(SnapshotError::illegal_state(format!(
                "Wrong number of restorations: {}",
                restorations.len()
            )));
        }
        let state = restorations[0].state;
        Ok(state.is_terminal().then_some(RestorationOutcome {
            state,
            unavailable_polls,
        }))
    })
}

/// Wait until the catalog reports the table as created
pub fn wait_for_create_table_done(
    coordinator: &SnapshotCoordinator,
    table_name: &TableName,
    options: WaitOptions,
) -> Result<()> {
    wait_for("IsCreateTableDone", options, || {
        Ok(coordinator.is_create_table_done(table_name)?.then_some(()))
    })
}
