//! Background removal of expired rows.
//!
//! Each sweep walks the expirable tables in a fixed order and deletes rows
//! whose `ExpireAt` lies in the past, at most `batch_size` rows per pass.
//! Every pass runs under the `locks:expirationmanager` distributed lock so
//! that only one process deletes at a time. Job state history is removed by
//! the foreign-key cascade when its job goes.

use rusqlite::params;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::engine::Storage;
use crate::error::{Result, StorageError};
use crate::lock::with_lock;
use crate::now_millis;
use crate::storage::gate::Intent;

/// Lock held for each deletion pass.
pub const DISTRIBUTED_LOCK_KEY: &str = "locks:expirationmanager";

const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_DELAY_BETWEEN_PASSES: Duration = Duration::from_secs(1);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Rows removed from one table during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSweep {
    pub table: String,
    /// Rows deleted by each pass, in order. The last entry is below the
    /// batch size, which is what ended the loop.
    pub passes: Vec<usize>,
}

impl TableSweep {
    pub fn removed(&self) -> usize {
        self.passes.iter().sum()
    }
}

/// Outcome of one full sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub tables: Vec<TableSweep>,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.tables.iter().map(TableSweep::removed).sum()
    }
}

/// Periodically deletes expired counters, jobs, lists, sets and hashes.
#[derive(Debug, Clone)]
pub struct ExpirationManager {
    storage: Storage,
    check_interval: Duration,
    batch_size: usize,
    delay_between_passes: Duration,
    lock_timeout: Duration,
}

impl ExpirationManager {
    pub fn new(storage: Storage, check_interval: Duration) -> Self {
        Self {
            storage,
            check_interval,
            batch_size: DEFAULT_BATCH_SIZE,
            delay_between_passes: DEFAULT_DELAY_BETWEEN_PASSES,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Maximum rows deleted per pass.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Pause after a full pass, before looking for more rows.
    pub fn with_delay_between_passes(mut self, delay: Duration) -> Self {
        self.delay_between_passes = delay;
        self
    }

    /// How long a pass waits for the sweeper lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run one sweep over every expirable table.
    ///
    /// Returns [`StorageError::Cancelled`] if `cancel` fires at any wait
    /// point; rows deleted by completed passes stay deleted.
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for table in self.storage.tables().expirable() {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            tracing::debug!(table, "Removing outdated records");
            let mut sweep = TableSweep {
                table: table.to_string(),
                passes: Vec::new(),
            };

            loop {
                let removed = with_lock(
                    &self.storage,
                    DISTRIBUTED_LOCK_KEY,
                    self.lock_timeout,
                    cancel,
                    || self.delete_pass(table),
                )
                .await?;
                sweep.passes.push(removed);

                if removed < self.batch_size {
                    break;
                }
                tracing::trace!(table, removed, "Removed outdated records");
                self.pause(cancel).await?;
            }

            if sweep.removed() > 0 {
                tracing::info!(table, removed = sweep.removed(), "Expired records removed");
            }
            report.tables.push(sweep);
        }

        Ok(report)
    }

    /// Sweep every `check_interval` until `cancel` fires.
    ///
    /// Failed sweeps are logged and retried on the next interval.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval = ?self.check_interval, "Expiration manager started");

        loop {
            match self.execute(&cancel).await {
                Ok(report) => {
                    tracing::debug!(removed = report.removed(), "Expiration sweep finished");
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    tracing::error!(error = %e, "Expiration sweep failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }

        tracing::info!("Expiration manager stopped");
    }

    async fn delete_pass(&self, table: &str) -> Result<usize> {
        let sql = format!(
            "DELETE FROM {table} WHERE Id IN (\
             SELECT Id FROM {table} WHERE ExpireAt < ?1 LIMIT ?2)"
        );
        let limit = i64::try_from(self.batch_size).unwrap_or(i64::MAX);

        self.storage
            .gate()
            .with_connection(Intent::Write, move |conn| {
                Ok(conn.execute(&sql, params![now_millis(), limit])?)
            })
            .await
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            _ = tokio::time::sleep(self.delay_between_passes) => Ok(()),
        }
    }
}
