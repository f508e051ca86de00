//! Error types for the snapshot subsystem
//!
//! A single error enum covers every layer (tablet executor, registry,
//! import translator). We use `thiserror` for automatic `Display` and
//! `Error` trait implementations.
//!
//! The taxonomy matters to callers:
//!
//! - `ServiceUnavailable` is transient: retry the same request later.
//! - `NotFound` is definitive: the referenced object does not exist.
//! - `Timeout` means a bounded wait expired; the underlying operation may
//!   still complete.

use crate::config::ConfigError;
use std::io;
use thiserror::Error;

/// Result type alias for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Error types for snapshot, restoration and import operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Malformed identifier or argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Structural invariant violated, or a response carried an embedded error
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The coordinator (or a tablet server) is not ready to answer yet
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A directive or a log catch-up wait exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Referenced snapshot, restoration, table or namespace does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SnapshotError {
    /// Create an `InvalidArgument` error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        SnapshotError::InvalidArgument(msg.into())
    }

    /// Create an `IllegalState` error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        SnapshotError::IllegalState(msg.into())
    }

    /// Create a `ServiceUnavailable` error
    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        SnapshotError::ServiceUnavailable(msg.into())
    }

    /// Create a `Timeout` error
    pub fn timeout(msg: impl Into<String>) -> Self {
        SnapshotError::Timeout(msg.into())
    }

    /// Create a `NotFound` error
    pub fn not_found(msg: impl Into<String>) -> Self {
        SnapshotError::NotFound(msg.into())
    }

    /// True for `ServiceUnavailable`
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, SnapshotError::ServiceUnavailable(_))
    }

    /// True for `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::NotFound(_))
    }

    /// True for `Timeout`
    pub fn is_timeout(&self) -> bool {
        matches!(self, SnapshotError::Timeout(_))
    }

    /// Whether a directive that failed with this error may be retried
    ///
    /// Unavailability, timeouts and I/O hiccups are transient. Argument,
    /// state and lookup errors will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SnapshotError::ServiceUnavailable(_) | SnapshotError::Timeout(_) | SnapshotError::Io(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for SnapshotError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SnapshotError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}

impl From<ConfigError> for SnapshotError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Read { source, .. } => SnapshotError::Io(source),
            other => SnapshotError::InvalidArgument(other.to_string()),
        }
    }
}
