//! Retry policy for per-tablet directives
//!
//! A directive is retried with capped exponential backoff until it succeeds,
//! fails with a non-retryable error, or the overall deadline passes. The
//! policy only decides the delay; the fan-out pool runs the next attempt.

use std::time::{Duration, Instant};
use tabletsnap_core::{Result, SnapshotConfig, SnapshotError};
use tracing::debug;

/// Backoff and deadline for one directive
///
/// # Example
/// ```
/// use std::time::Duration;
/// use tabletsnap_master::RetryPolicy;
///
/// let policy = RetryPolicy::new()
///     .with_initial_delay(Duration::from_millis(10))
///     .with_deadline(Duration::from_secs(1));
/// assert_eq!(policy.delay_for(0), Duration::from_millis(10));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Overall budget, attempts and delays included
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            deadline: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy described by the snapshot configuration
    pub fn from_config(config: &SnapshotConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            deadline: config.directive_deadline(),
        }
    }

    /// Set the first delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the overall deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(31);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Delay before the attempt that follows `attempt`, which failed with `err`
    ///
    /// The caller schedules the next attempt itself, so no thread sleeps
    /// through the delay.
    ///
    /// # Errors
    /// * `err` unchanged when it is not retryable
    /// * `Timeout` wrapping `err` when the deadline would pass first
    pub fn backoff(&self, what: &str, attempt: Attempt, err: SnapshotError) -> Result<Duration> {
        if !err.is_retryable() {
            return Err(err);
        }
        let delay = self.delay_for(attempt.number);
        if attempt.started.elapsed() + delay >= self.deadline {
            return Err(SnapshotError::timeout(format!(
                "{} did not succeed within {:?} ({} attempts): {}",
                what,
                self.deadline,
                attempt.number + 1,
                err
            )));
        }
        debug!(
            target: "tabletsnap::master",
            what,
            attempt = attempt.number,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying directive"
        );
        Ok(delay)
    }
}

/// Where a directive stands in its retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 0-based attempt number
    pub number: u32,
    /// When the first attempt started
    pub started: Instant,
}

impl Attempt {
    /// The first attempt, starting now
    pub fn first() -> Self {
        Self {
            number: 0,
            started: Instant::now(),
        }
    }

    /// The attempt after this one
    pub fn next(self) -> Self {
        Self {
            number: self.number + 1,
            ..self
        }
    }
}
