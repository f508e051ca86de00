//! Replica consensus view and the consensus gate
//!
//! The snapshot executor only needs two facts from the replication layer:
//! the last op id the replica has received, and the last op id it has
//! committed. `ReplicaLog` is an in-process log that provides both, plus
//! the append / replicate / garbage-collect hooks the mini cluster drives.
//!
//! `ConsensusGate` blocks a directive until the replica has committed a
//! target op id, so a local snapshot never captures speculative state.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabletsnap_core::{OpId, Result, SnapshotError};
use tracing::{debug, warn};

/// What a snapshot directive needs to know about the local replica's log
pub trait ReplicaConsensus: Send + Sync {
    /// Last op id appended to the local log
    fn last_received_op_id(&self) -> OpId;

    /// Last op id known to be committed by a majority
    fn last_committed_op_id(&self) -> OpId;
}

/// One replicated write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position in the log
    pub op_id: OpId,
    /// Row key
    pub key: Vec<u8>,
    /// Row value
    pub value: Vec<u8>,
}

struct RetainedEntry {
    entry: LogEntry,
    appended_at: Instant,
}

struct LogState {
    term: u64,
    entries: Vec<RetainedEntry>,
    received: OpId,
    committed: OpId,
    /// Everything at or below this op id has been garbage collected
    gc_watermark: OpId,
}

/// In-process replicated log of one tablet replica
pub struct ReplicaLog {
    state: Mutex<LogState>,
}

impl ReplicaLog {
    /// Create an empty log in term 1
    pub fn new() -> Self {
        ReplicaLog {
            state: Mutex::new(LogState {
                term: 1,
                entries: Vec::new(),
                received: OpId::MIN,
                committed: OpId::MIN,
                gc_watermark: OpId::MIN,
            }),
        }
    }

    /// Append a new write as leader and return its op id
    pub fn append(&self, key: Vec<u8>, value: Vec<u8>) -> LogEntry {
        let mut state = self.state.lock();
        let op_id = OpId::new(state.term, state.received.index + 1);
        let entry = LogEntry { op_id, key, value };
        state.entries.push(RetainedEntry {
            entry: entry.clone(),
            appended_at: Instant::now(),
        });
        state.received = op_id;
        entry
    }

    /// Append an entry received from the leader
    ///
    /// Entries at or below the last received op id are ignored, so replaying
    /// the same batch twice is harmless.
    pub fn receive(&self, entry: LogEntry) -> bool {
        let mut state = self.state.lock();
        if entry.op_id <= state.received {
            return false;
        }
        state.received = entry.op_id;
        state.entries.push(RetainedEntry {
            entry,
            appended_at: Instant::now(),
        });
        true
    }

    /// Advance the commit point, never past the last received op id
    pub fn commit_up_to(&self, op_id: OpId) {
        let mut state = self.state.lock();
        let target = op_id.min(state.received);
        state.committed.make_at_least(target);
    }

    /// Retained entries strictly after `after`
    ///
    /// # Errors
    /// `NotFound` if some of those entries were garbage collected, meaning
    /// the caller must fall back to a remote bootstrap.
    pub fn entries_after(&self, after: OpId) -> Result<Vec<LogEntry>> {
        let state = self.state.lock();
        if after < state.gc_watermark {
            return Err(SnapshotError::not_found(format!(
                "log entries after {} were garbage collected (watermark {})",
                after, state.gc_watermark
            )));
        }
        Ok(state
            .entries
            .iter()
            .filter(|e| e.entry.op_id > after)
            .map(|e| e.entry.clone())
            .collect())
    }

    /// Drop entries that are durable in data files and older than `retention`
    ///
    /// Returns the number of entries removed.
    pub fn gc(&self, flushed: OpId, retention: Duration) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let before = state.entries.len();
        let mut watermark = state.gc_watermark;
        state.entries.retain(|e| {
            let collectable =
                e.entry.op_id <= flushed && now.duration_since(e.appended_at) >= retention;
            if collectable {
                watermark.make_at_least(e.entry.op_id);
            }
            !collectable
        });
        state.gc_watermark = watermark;
        before - state.entries.len()
    }

    /// Reset the log after a remote bootstrap so it continues at `op_id`
    pub fn reset_to(&self, op_id: OpId) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.received = op_id;
        state.committed = op_id;
        state.gc_watermark = op_id;
        state.term = state.term.max(op_id.term);
    }
}

impl Default for ReplicaLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaConsensus for ReplicaLog {
    fn last_received_op_id(&self) -> OpId {
        self.state.lock().received
    }

    fn last_committed_op_id(&self) -> OpId {
        self.state.lock().committed
    }
}

/// Blocks until the local replica has committed a target op id
#[derive(Clone)]
pub struct ConsensusGate {
    consensus: Arc<dyn ReplicaConsensus>,
    max_poll_interval: Duration,
}

impl ConsensusGate {
    /// Create a gate over a replica's consensus view
    pub fn new(consensus: Arc<dyn ReplicaConsensus>) -> Self {
        ConsensusGate {
            consensus,
            max_poll_interval: Duration::from_millis(50),
        }
    }

    /// Wait until the last committed op id is at least `target`
    ///
    /// Polls with short sleeps that double up to a small cap.
    ///
    /// # Returns
    /// * `Ok(committed)` - the committed op id observed when the wait ended
    /// * `Err(Timeout)` - `timeout` expired first; the caller must not proceed
    pub fn wait_for_committed(&self, target: OpId, timeout: Duration) -> Result<OpId> {
        let start = Instant::now();
        let mut sleep = Duration::from_millis(1);

        loop {
            let committed = self.consensus.last_committed_op_id();
            if committed >= target {
                debug!(
                    target: "tabletsnap::consensus",
                    target_op_id = %target,
                    %committed,
                    "Log caught up"
                );
                return Ok(committed);
            }
            if start.elapsed() >= timeout {
                warn!(
                    target: "tabletsnap::consensus",
                    target_op_id = %target,
                    %committed,
                    timeout_ms = timeout.as_millis() as u64,
                    "Log catch-up wait expired"
                );
                return Err(SnapshotError::timeout(format!(
                    "committed op id {} did not reach {} within {:?}",
                    committed, target, timeout
                )));
            }
            std::thread::sleep(sleep.min(timeout.saturating_sub(start.elapsed())));
            sleep = (sleep * 2).min(self.max_poll_interval);
        }
    }
}
