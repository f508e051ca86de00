//! Snapshot subsystem configuration via `tabletsnap.toml`
//!
//! Two settings belong to external collaborators and are only consumed here:
//! `log_min_seconds_to_retain` (replication-log retention, which sizes the
//! consensus gate timeout) and `verbose_catalog_version_logging` (unused by
//! the snapshot core, kept so a shared config file parses).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the master data directory.
pub const CONFIG_FILE_NAME: &str = "tabletsnap.toml";

/// How many replicas of a tablet must acknowledge a directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// At least one replica
    Any,
    /// A strict majority of replicas
    Majority,
    /// Every replica
    All,
}

impl AckPolicy {
    /// Number of acknowledgements required out of `replicas`
    pub fn required(&self, replicas: usize) -> usize {
        match self {
            AckPolicy::Any => replicas.min(1),
            AckPolicy::Majority => replicas / 2 + 1,
            AckPolicy::All => replicas,
        }
        .min(replicas)
    }
}

/// Snapshot configuration loaded from `tabletsnap.toml`.
///
/// # Example
///
/// ```toml
/// log_min_seconds_to_retain = 900
/// directive_deadline_ms = 30000
/// create_ack = "any"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Minimum seconds replication-log segments are retained
    #[serde(default = "default_log_retention")]
    pub log_min_seconds_to_retain: u64,
    /// Verbose catalog-version cache logging (external, ignored here)
    #[serde(default)]
    pub verbose_catalog_version_logging: bool,
    /// Explicit consensus gate timeout; derived from log retention when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_wait_timeout_ms: Option<u64>,
    /// First retry delay for a failed tablet directive
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Cap on the retry delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Overall deadline for one tablet directive, retries included
    #[serde(default = "default_directive_deadline_ms")]
    pub directive_deadline_ms: u64,
    /// Worker threads driving the fan-out
    #[serde(default = "default_fanout_threads")]
    pub fanout_threads: usize,
    /// Maximum queued fan-out tasks
    #[serde(default = "default_fanout_queue_depth")]
    pub fanout_queue_depth: usize,
    /// Replicas per tablet that must finish a local snapshot
    ///
    /// Restores always need every replica.
    #[serde(default = "default_create_ack")]
    pub create_ack: AckPolicy,
}

fn default_log_retention() -> u64 {
    900
}

fn default_initial_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_directive_deadline_ms() -> u64 {
    30_000
}

fn default_fanout_threads() -> usize {
    4
}

fn default_fanout_queue_depth() -> usize {
    4096
}

fn default_create_ack() -> AckPolicy {
    AckPolicy::Any
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            log_min_seconds_to_retain: default_log_retention(),
            verbose_catalog_version_logging: false,
            consensus_wait_timeout_ms: None,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            directive_deadline_ms: default_directive_deadline_ms(),
            fanout_threads: default_fanout_threads(),
            fanout_queue_depth: default_fanout_queue_depth(),
            create_ack: default_create_ack(),
        }
    }
}

impl SnapshotConfig {
    /// Create config for testing
    ///
    /// Short deadlines and a 5 second log retention window.
    pub fn for_testing() -> Self {
        SnapshotConfig {
            log_min_seconds_to_retain: 5,
            initial_delay_ms: 10,
            max_delay_ms: 200,
            directive_deadline_ms: 5_000,
            fanout_threads: 8,
            ..Default::default()
        }
    }

    /// How long the consensus gate may wait for log catch-up
    ///
    /// A replica further behind than the retention window cannot catch up by
    /// log replay anyway, so the window bounds the wait.
    pub fn consensus_wait_timeout(&self) -> Duration {
        match self.consensus_wait_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.log_min_seconds_to_retain.max(1)),
        }
    }

    /// Overall deadline for one tablet directive
    pub fn directive_deadline(&self) -> Duration {
        Duration::from_millis(self.directive_deadline_ms)
    }

    /// Set the directive deadline
    pub fn with_directive_deadline_ms(mut self, ms: u64) -> Self {
        self.directive_deadline_ms = ms;
        self
    }

    /// Set the log retention window
    pub fn with_log_retention_secs(mut self, secs: u64) -> Self {
        self.log_min_seconds_to_retain = secs;
        self
    }

    /// Set the creation acknowledgement policy
    pub fn with_create_ack(mut self, policy: AckPolicy) -> Self {
        self.create_ack = policy;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fanout_threads == 0 {
            return Err(ConfigError::Invalid("fanout_threads must be at least 1".into()));
        }
        if self.fanout_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "fanout_queue_depth must be at least 1".into(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "initial_delay_ms ({}) exceeds max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        if self.directive_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "directive_deadline_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# tabletsnap configuration
#
# Minimum seconds to retain replication-log segments (owned by the consensus
# layer). Also bounds how long a tablet waits for its log to catch up before
# taking a local snapshot.
log_min_seconds_to_retain = 900

# Retry policy for per-tablet directives: capped exponential backoff until the
# deadline, after which the snapshot or restoration is marked FAILED.
initial_delay_ms = 50
max_delay_ms = 2000
directive_deadline_ms = 30000

# Fan-out worker pool.
fanout_threads = 4
fanout_queue_depth = 4096

# Replicas per tablet that must finish a local snapshot: "any", "majority"
# or "all". A restore always waits for every replica.
create_ack = "any"
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: SnapshotConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read or written
    #[error("Failed to access config file '{path}': {source}")]
    Read {
        /// File path
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse config file '{path}': {message}")]
    Parse {
        /// File path
        path: String,
        /// Parser message
        message: String,
    },

    /// A setting is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}
