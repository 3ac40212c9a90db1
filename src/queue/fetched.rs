//! Handle for a leased queue item.

use rusqlite::params;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::gate::{ConnectionGate, Intent};
use crate::storage::schema::Tables;

/// A job leased from the queue.
///
/// Finish with [`remove_from_queue`](Self::remove_from_queue) after
/// successful processing or [`requeue`](Self::requeue) after a failure.
/// Dropping the handle does neither: the lease simply runs out and the
/// item is fetched again once the invisibility timeout passes.
#[derive(Debug)]
pub struct FetchedJob {
    gate: ConnectionGate,
    tables: Arc<Tables>,
    id: i64,
    job_id: String,
    queue: String,
}

impl FetchedJob {
    pub(crate) fn new(
        gate: ConnectionGate,
        tables: Arc<Tables>,
        id: i64,
        job_id: String,
        queue: String,
    ) -> Self {
        Self {
            gate,
            tables,
            id,
            job_id,
            queue,
        }
    }

    /// Queue row id.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Acknowledge: delete the queue row for good.
    pub async fn remove_from_queue(self) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE Id = ?1", self.tables.job_queue);
        let id = self.id;
        self.gate
            .with_connection(Intent::Write, move |conn| {
                conn.execute(&sql, params![id])?;
                Ok(())
            })
            .await?;
        tracing::debug!(id, job_id = %self.job_id, "Job removed from queue");
        Ok(())
    }

    /// Same as [`remove_from_queue`](Self::remove_from_queue).
    pub async fn acknowledge(self) -> Result<()> {
        self.remove_from_queue().await
    }

    /// Put the item back immediately, bypassing the invisibility window.
    pub async fn requeue(self) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET FetchedAt = NULL WHERE Id = ?1",
            self.tables.job_queue
        );
        let id = self.id;
        self.gate
            .with_connection(Intent::Write, move |conn| {
                conn.execute(&sql, params![id])?;
                Ok(())
            })
            .await?;
        tracing::debug!(id, job_id = %self.job_id, "Job requeued");
        Ok(())
    }
}
