//! Stockpile: SQLite persistence for background job processing.
//!
//! Stores jobs, their state history, work queues, distributed locks and the
//! auxiliary counters, sets, lists and hashes a job framework keeps, all in
//! one SQLite file that several processes may share.
//!
//! # Architecture
//!
//! - **Gatekeeper**: one in-process writer lock per database file, so writers
//!   queue up instead of colliding on `SQLITE_BUSY`
//! - **Distributed Lock**: a unique row in the lock table, visible to every
//!   process using the file
//! - **Job Queue**: at-least-once delivery with an invisibility timeout
//! - **Transactions**: queued mutations replayed atomically on commit
//! - **Expiration**: a background sweeper deleting rows past `ExpireAt`
//!
//! # Modules
//!
//! - [`config`]: Storage options and daemon CLI configuration
//! - [`daemon`]: Standalone process running the expiration sweeper
//! - [`engine`]: The [`Storage`] entry point
//! - [`error`]: Error taxonomy
//! - [`expiration`]: Expired-row sweeper
//! - [`lock`]: Database-backed distributed lock
//! - [`observability`]: Tracing setup
//! - [`queue`]: Persistent job queue
//! - [`storage`]: Schema, connections, batches and reads

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // storage::StorageOptions is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::similar_names,              // job/jobs/job_id are fine
    clippy::struct_excessive_bools,     // Config structs may have flags
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod expiration;
pub mod lock;
pub mod observability;
pub mod queue;
pub mod storage;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use config::{IsolationLevel, StorageOptions};
pub use engine::Storage;
pub use error::{Result, StorageError};
pub use expiration::{ExpirationManager, SweepReport};
pub use lock::{with_lock, DistributedLock};
pub use queue::{FetchedJob, JobQueue};
pub use storage::batch::{Operation, WriteOnlyTransaction};
pub use storage::gate::WriterLockRegistry;
pub use storage::models::{JobRecord, JobState, StateRecord};
pub use tokio_util::sync::CancellationToken;

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as i64
}

/// Duration in milliseconds, saturating at `i64::MAX`.
pub fn to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_millis_saturates() {
        assert_eq!(to_millis(Duration::from_secs(2)), 2000);
        assert_eq!(to_millis(Duration::MAX), i64::MAX);
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(now_millis() > 1_577_836_800_000);
    }
}
