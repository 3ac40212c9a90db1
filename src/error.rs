//! Error types shared by every storage component.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the storage engine.
///
/// Primitives (locks, queues, batches) hand failures back to the caller
/// instead of retrying. The only internal retry loops are lock acquisition
/// and queue polling, which end in [`StorageError::LockTimeout`] or
/// [`StorageError::Cancelled`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The distributed lock could not be placed before the deadline.
    #[error("Timed out after {timeout:?} waiting for lock on resource '{resource}'")]
    LockTimeout { resource: String, timeout: Duration },

    /// Releasing a distributed lock removed no row.
    ///
    /// This means the lock protocol was violated somewhere and must never be
    /// swallowed.
    #[error("Could not release lock on resource '{resource}': no lock row was removed")]
    LockRelease { resource: String },

    /// The writer lock or the database itself could not be obtained.
    #[error("Connection to '{target}' unavailable: {reason}")]
    ConnectionUnavailable { target: String, reason: String },

    /// A queued mutation failed during commit; nothing was applied.
    #[error("Transaction failed at operation #{index} ({operation}): {source}")]
    Transaction {
        index: usize,
        operation: &'static str,
        #[source]
        source: Box<StorageError>,
    },

    /// A cooperative stop was requested while waiting.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid job id '{0}'")]
    InvalidJobId(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StorageError {
    /// Whether this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Convert an opaque job identifier into its integer key.
pub(crate) fn parse_job_id(job_id: &str) -> Result<i64> {
    job_id
        .trim()
        .parse::<i64>()
        .map_err(|_| StorageError::InvalidJobId(job_id.to_string()))
}
