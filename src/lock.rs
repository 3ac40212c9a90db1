//! Distributed lock built on a database row.
//!
//! Holding a lock means a row with the resource name exists in the lock
//! table. Acquire inserts the row, release deletes it. Every process pointed
//! at the same database file sees the same rows, so this works across
//! processes as well as tasks.
//!
//! The lock is advisory and non-reentrant:
//! - there is no owner tracking; anyone with a connection can delete the row
//! - acquiring a resource already held, even by the same task, waits for
//!   its release like any other contender
//!
//! Callers must pair every acquire with a release on all exit paths;
//! [`with_lock`] does this for a single async section.

use rusqlite::params;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::Storage;
use crate::error::{Result, StorageError};
use crate::storage::gate::{ConnectionGate, Intent};
use crate::storage::schema::Tables;

/// Delay between insert attempts while a resource is held elsewhere.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A held distributed lock.
///
/// Dropping the handle does NOT release the row; call [`release`](Self::release).
#[must_use = "a distributed lock stays held until release() is called"]
#[derive(Debug)]
pub struct DistributedLock {
    resource: String,
    gate: ConnectionGate,
    tables: Arc<Tables>,
}

impl DistributedLock {
    /// Acquire `resource`, retrying until `timeout` elapses.
    pub async fn acquire(storage: &Storage, resource: &str, timeout: Duration) -> Result<Self> {
        Self::acquire_cancellable(storage, resource, timeout, &CancellationToken::new()).await
    }

    /// Acquire `resource`, giving up on timeout or when `cancel` fires.
    ///
    /// Any insert failure, including the unique-constraint violation raised
    /// while someone else holds the row, counts as "not yet available".
    /// The last failure is only reported through the timeout error.
    #[tracing::instrument(skip(storage, cancel))]
    pub async fn acquire_cancellable(
        storage: &Storage,
        resource: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if resource.is_empty() {
            return Err(StorageError::InvalidArgument(
                "lock resource cannot be empty".into(),
            ));
        }

        let lock = Self {
            resource: resource.to_string(),
            gate: storage.gate().clone(),
            tables: storage.tables().clone(),
        };
        let deadline = Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            match lock.try_insert().await {
                Ok(()) => {
                    tracing::debug!(resource, "Lock acquired");
                    return Ok(lock);
                }
                Err(e) => {
                    tracing::trace!(resource, error = %e, "Lock not available yet");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(resource, "Lock acquisition timed out");
                return Err(StorageError::LockTimeout {
                    resource: resource.to_string(),
                    timeout,
                });
            }

            let wait = LOCK_RETRY_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Name of the locked resource.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Delete the lock row.
    ///
    /// Fails with [`StorageError::LockRelease`] when no row was removed,
    /// meaning the lock was already released by someone else.
    pub async fn release(self) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE Resource = ?1", self.tables.lock);
        let resource = self.resource.clone();

        let deleted = self
            .gate
            .with_connection(Intent::Write, move |conn| {
                Ok(conn.execute(&sql, params![resource])?)
            })
            .await?;

        if deleted == 0 {
            tracing::error!(resource = %self.resource, "Lock row missing on release");
            return Err(StorageError::LockRelease {
                resource: self.resource,
            });
        }

        tracing::debug!(resource = %self.resource, "Lock released");
        Ok(())
    }

    async fn try_insert(&self) -> Result<()> {
        let sql = format!("INSERT INTO {} (Resource) VALUES (?1)", self.tables.lock);
        let resource = self.resource.clone();
        self.gate
            .with_connection(Intent::Write, move |conn| {
                conn.execute(&sql, params![resource])?;
                Ok(())
            })
            .await
    }
}

/// Run `f` while holding a lock on `resource`.
///
/// The lock is released whether `f` succeeds or fails. A failure of `f`
/// wins over a release failure; a release failure after a successful `f` is
/// returned as the result.
pub async fn with_lock<T, F, Fut>(
    storage: &Storage,
    resource: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lock = DistributedLock::acquire_cancellable(storage, resource, timeout, cancel).await?;
    let outcome = f().await;
    let released = lock.release().await;

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            tracing::error!(resource, error = %release_err, "Lock release failed after error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use tempfile::TempDir;

    async fn open_storage(dir: &TempDir) -> Storage {
        Storage::open(dir.path().join("test.db"), StorageOptions::test_options())
            .await
            .unwrap()
    }

    async fn lock_rows(storage: &Storage, resource: &str) -> i64 {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE Resource = ?1",
            storage.tables().lock
        );
        let resource = resource.to_string();
        storage
            .gate()
            .with_connection(Intent::Read, move |conn| {
                Ok(conn.query_row(&sql, params![resource], |row| row.get(0))?)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_acquire_release_leaves_no_rows() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;

        for _ in 0..3 {
            let lock = storage
                .acquire_lock("resource:a", Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(lock_rows(&storage, "resource:a").await, 1);
            lock.release().await.unwrap();
            assert_eq!(lock_rows(&storage, "resource:a").await, 0);
        }
    }

    #[tokio::test]
    async fn test_release_without_row_fails() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;

        let lock = storage
            .acquire_lock("resource:b", Duration::from_secs(1))
            .await
            .unwrap();

        // Someone else removes the row behind our back.
        let sql = format!("DELETE FROM {}", storage.tables().lock);
        storage
            .gate()
            .with_connection(Intent::Write, move |conn| Ok(conn.execute(&sql, [])?))
            .await
            .unwrap();

        let result = lock.release().await;
        assert!(matches!(
            result,
            Err(StorageError::LockRelease { resource }) if resource == "resource:b"
        ));
    }

    #[tokio::test]
    async fn test_lock_is_not_reentrant() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;

        let held = storage
            .acquire_lock("resource:c", Duration::from_secs(1))
            .await
            .unwrap();
        let second = storage
            .acquire_lock("resource:c", Duration::from_millis(100))
            .await;
        assert!(matches!(
            second,
            Err(StorageError::LockTimeout { ref resource, .. }) if resource == "resource:c"
        ));

        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;

        let held = storage
            .acquire_lock("resource:d", Duration::from_secs(1))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = DistributedLock::acquire_cancellable(
            &storage,
            "resource:d",
            Duration::from_secs(30),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(StorageError::Cancelled)));

        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;

        let result: Result<()> = with_lock(
            &storage,
            "resource:e",
            Duration::from_secs(1),
            &CancellationToken::new(),
            || async { Err(StorageError::InvalidArgument("inner".into())) },
        )
        .await;

        assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
        assert_eq!(lock_rows(&storage, "resource:e").await, 0);
    }
}
