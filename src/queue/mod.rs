//! Persistent job queue with invisibility-timeout delivery.
//!
//! Each queue row moves through:
//!
//! ```text
//! Available --dequeue--> Leased --remove_from_queue--> (deleted)
//!     ^                    |
//!     +----requeue---------+
//!     +----lease older than invisibility timeout
//! ```
//!
//! A fetch stamps `FetchedAt = now` instead of deleting the row. If the
//! consumer crashes, the row becomes eligible again once `FetchedAt` falls
//! out of the invisibility window, so delivery is at-least-once and
//! consumers must be idempotent. Deleting on fetch would give at-most-once
//! delivery instead, losing any item whose consumer dies mid-processing.

mod cache;
mod fetched;

pub use fetched::FetchedJob;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use cache::QueueNameCache;

use crate::config::StorageOptions;
use crate::error::{parse_job_id, Result, StorageError};
use crate::storage::gate::{ConnectionGate, Intent};
use crate::storage::schema::Tables;
use crate::{now_millis, to_millis};

/// Queue operations over the `JobQueue` table.
#[derive(Clone)]
pub struct JobQueue {
    gate: ConnectionGate,
    tables: Arc<Tables>,
    options: Arc<StorageOptions>,
    names: Arc<QueueNameCache>,
}

impl JobQueue {
    pub(crate) fn new(
        gate: ConnectionGate,
        tables: Arc<Tables>,
        options: Arc<StorageOptions>,
    ) -> Self {
        Self {
            gate,
            tables,
            options,
            names: Arc::new(QueueNameCache::default()),
        }
    }

    /// Make `job_id` available on `queue`.
    pub async fn enqueue(&self, queue: &str, job_id: &str) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        let tables = self.tables.clone();
        let queue = queue.to_string();
        self.gate
            .with_connection(Intent::Write, move |conn| {
                insert_queue_row(conn, &tables, &queue, job_id)
            })
            .await
    }

    /// Fetch the oldest available job across `queues`, waiting until one
    /// shows up.
    ///
    /// Polls every `queue_poll_interval`. Returns [`StorageError::Cancelled`]
    /// as soon as `cancel` fires, either before a poll or during the wait.
    pub async fn dequeue(&self, queues: &[String], cancel: &CancellationToken) -> Result<FetchedJob> {
        if queues.is_empty() {
            return Err(StorageError::InvalidArgument(
                "queue list must be non-empty".into(),
            ));
        }

        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            if let Some(job) = self.try_dequeue(queues).await? {
                return Ok(job);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = tokio::time::sleep(self.options.queue_poll_interval) => {}
            }
        }
    }

    /// Single fetch attempt; `None` when nothing is eligible.
    pub async fn try_dequeue(&self, queues: &[String]) -> Result<Option<FetchedJob>> {
        let select_sql = format!(
            "SELECT Id, JobId, Queue FROM {} \
             WHERE (FetchedAt IS NULL OR FetchedAt < ?1) AND Queue IN ({}) \
             ORDER BY Id ASC LIMIT 1",
            self.tables.job_queue,
            placeholders(2, queues.len())
        );
        let claim_sql = format!(
            "UPDATE {} SET FetchedAt = ?1 WHERE Id = ?2 AND (FetchedAt IS NULL OR FetchedAt < ?3)",
            self.tables.job_queue
        );
        let invisibility = to_millis(self.options.invisibility_timeout);
        let behavior = self.options.isolation_level.behavior();

        let mut values = Vec::with_capacity(queues.len() + 1);
        values.push(Value::Null);
        values.extend(queues.iter().cloned().map(Value::Text));

        let fetched = self
            .gate
            .with_transaction(behavior, move |tx| {
                let now = now_millis();
                let cutoff = now.saturating_sub(invisibility);
                values[0] = Value::Integer(cutoff);

                let row = tx
                    .query_row(&select_sql, params_from_iter(values.iter()), |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })
                    .optional()?;

                let Some((id, job_id, queue)) = row else {
                    return Ok(None);
                };

                // Guarded update: another process may have claimed it in between.
                let claimed = tx.execute(&claim_sql, params![now, id, cutoff])?;
                Ok((claimed == 1).then_some((id, job_id, queue)))
            })
            .await?;

        Ok(fetched.map(|(id, job_id, queue)| {
            tracing::debug!(id, job_id, queue = %queue, "Job fetched");
            FetchedJob::new(self.gate.clone(), self.tables.clone(), id, job_id.to_string(), queue)
        }))
    }

    /// Distinct queue names, cached for a few seconds.
    pub async fn queues(&self) -> Result<Vec<String>> {
        if let Some(names) = self.names.get() {
            return Ok(names);
        }

        let sql = format!(
            "SELECT DISTINCT Queue FROM {} ORDER BY Queue ASC",
            self.tables.job_queue
        );
        let names: Vec<String> = self
            .gate
            .with_connection(Intent::Read, move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        self.names.put(names.clone());
        Ok(names)
    }
}

/// Insert an available row; shared by direct enqueue and transaction batches.
pub(crate) fn insert_queue_row(
    conn: &Connection,
    tables: &Tables,
    queue: &str,
    job_id: i64,
) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO {} (JobId, Queue) VALUES (?1, ?2)", tables.job_queue),
        params![job_id, queue],
    )?;
    Ok(())
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}
