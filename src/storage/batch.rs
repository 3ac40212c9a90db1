//! Write-only transaction batches.
//!
//! A [`WriteOnlyTransaction`] records mutations as [`Operation`] values and
//! touches the database only on [`commit`](WriteOnlyTransaction::commit):
//! - collection locks (`<prefix>:Set:Lock` etc.) are acquired, sorted
//! - operations replay in call order inside one write transaction
//! - any failure rolls back everything in the batch
//! - collection locks are released on every exit path
//!
//! Set and hash writes are select-then-insert-or-update, which is only safe
//! while the collection lock is held.

use rusqlite::{params, OptionalExtension, Transaction};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::models::JobState;
use super::schema::Tables;
use crate::engine::Storage;
use crate::error::{parse_job_id, Result, StorageError};
use crate::lock::DistributedLock;
use crate::queue::insert_queue_row;
use crate::{now_millis, to_millis};

/// How long commit waits for each collection lock.
pub const COLLECTION_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Collection types whose structural changes are serialized by a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Collection {
    Hash,
    List,
    Set,
}

impl Collection {
    /// Lock resource name for this collection type.
    pub fn lock_resource(self, prefix: &str) -> String {
        format!("{prefix}:{self}:Lock")
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hash => "Hash",
            Self::List => "List",
            Self::Set => "Set",
        })
    }
}

/// One queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    ExpireJob { job_id: String, expire_in: Duration },
    PersistJob { job_id: String },
    SetJobState { job_id: String, state: JobState },
    AddJobState { job_id: String, state: JobState },
    AddToQueue { queue: String, job_id: String },
    Counter { key: String, delta: i64, expire_in: Option<Duration> },
    AddToSet { key: String, value: String, score: f64 },
    AddRangeToSet { key: String, values: Vec<String> },
    RemoveFromSet { key: String, value: String },
    RemoveSet { key: String },
    ExpireSet { key: String, expire_in: Duration },
    PersistSet { key: String },
    InsertToList { key: String, value: String },
    RemoveFromList { key: String, value: String },
    TrimList { key: String, keep_from: usize, keep_to: usize },
    ExpireList { key: String, expire_in: Duration },
    PersistList { key: String },
    SetRangeInHash { key: String, fields: Vec<(String, String)> },
    RemoveHash { key: String },
    ExpireHash { key: String, expire_in: Duration },
    PersistHash { key: String },
}

impl Operation {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExpireJob { .. } => "expire_job",
            Self::PersistJob { .. } => "persist_job",
            Self::SetJobState { .. } => "set_job_state",
            Self::AddJobState { .. } => "add_job_state",
            Self::AddToQueue { .. } => "add_to_queue",
            Self::Counter { delta, .. } if *delta < 0 => "decrement_counter",
            Self::Counter { .. } => "increment_counter",
            Self::AddToSet { .. } => "add_to_set",
            Self::AddRangeToSet { .. } => "add_range_to_set",
            Self::RemoveFromSet { .. } => "remove_from_set",
            Self::RemoveSet { .. } => "remove_set",
            Self::ExpireSet { .. } => "expire_set",
            Self::PersistSet { .. } => "persist_set",
            Self::InsertToList { .. } => "insert_to_list",
            Self::RemoveFromList { .. } => "remove_from_list",
            Self::TrimList { .. } => "trim_list",
            Self::ExpireList { .. } => "expire_list",
            Self::PersistList { .. } => "persist_list",
            Self::SetRangeInHash { .. } => "set_range_in_hash",
            Self::RemoveHash { .. } => "remove_hash",
            Self::ExpireHash { .. } => "expire_hash",
            Self::PersistHash { .. } => "persist_hash",
        }
    }

    /// The collection lock this operation needs, if any.
    pub fn collection(&self) -> Option<Collection> {
        match self {
            Self::AddToSet { .. }
            | Self::AddRangeToSet { .. }
            | Self::RemoveFromSet { .. }
            | Self::RemoveSet { .. }
            | Self::ExpireSet { .. }
            | Self::PersistSet { .. } => Some(Collection::Set),
            Self::InsertToList { .. }
            | Self::RemoveFromList { .. }
            | Self::TrimList { .. }
            | Self::ExpireList { .. }
            | Self::PersistList { .. } => Some(Collection::List),
            Self::SetRangeInHash { .. }
            | Self::RemoveHash { .. }
            | Self::ExpireHash { .. }
            | Self::PersistHash { .. } => Some(Collection::Hash),
            _ => None,
        }
    }

    /// Execute against an open transaction. `now` is the commit timestamp.
    pub fn apply(&self, tx: &Transaction<'_>, tables: &Tables, now: i64) -> Result<()> {
        let expire_at = |d: &Duration| now.saturating_add(to_millis(*d));

        match self {
            Self::ExpireJob { job_id, expire_in } => {
                tx.execute(
                    &format!("UPDATE {} SET ExpireAt = ?1 WHERE Id = ?2", tables.job),
                    params![expire_at(expire_in), parse_job_id(job_id)?],
                )?;
            }
            Self::PersistJob { job_id } => {
                tx.execute(
                    &format!("UPDATE {} SET ExpireAt = NULL WHERE Id = ?1", tables.job),
                    params![parse_job_id(job_id)?],
                )?;
            }
            Self::SetJobState { job_id, state } => {
                let id = parse_job_id(job_id)?;
                let state_id = insert_state(tx, tables, id, state, now)?;
                tx.execute(
                    &format!(
                        "UPDATE {} SET StateId = ?1, StateName = ?2 WHERE Id = ?3",
                        tables.job
                    ),
                    params![state_id, state.name, id],
                )?;
            }
            Self::AddJobState { job_id, state } => {
                insert_state(tx, tables, parse_job_id(job_id)?, state, now)?;
            }
            Self::AddToQueue { queue, job_id } => {
                insert_queue_row(tx, tables, queue, parse_job_id(job_id)?)?;
            }
            Self::Counter { key, delta, expire_in } => {
                tx.execute(
                    &format!(
                        "INSERT INTO {} (Key, Value, ExpireAt) VALUES (?1, ?2, ?3)",
                        tables.counter
                    ),
                    params![key, delta, expire_in.as_ref().map(expire_at)],
                )?;
            }
            Self::AddToSet { key, value, score } => {
                let existing: Option<i64> = tx
                    .query_row(
                        &format!("SELECT Id FROM {} WHERE Key = ?1 AND Value = ?2", tables.set),
                        params![key, value],
                        |row| row.get(0),
                    )
                    .optional()?;
                match existing {
                    Some(id) => tx.execute(
                        &format!("UPDATE {} SET Score = ?1 WHERE Id = ?2", tables.set),
                        params![score, id],
                    )?,
                    None => tx.execute(
                        &format!(
                            "INSERT INTO {} (Key, Value, Score) VALUES (?1, ?2, ?3)",
                            tables.set
                        ),
                        params![key, value, score],
                    )?,
                };
            }
            Self::AddRangeToSet { key, values } => {
                let mut exists = tx.prepare(&format!(
                    "SELECT 1 FROM {} WHERE Key = ?1 AND Value = ?2",
                    tables.set
                ))?;
                let mut insert = tx.prepare(&format!(
                    "INSERT INTO {} (Key, Value, Score) VALUES (?1, ?2, 0.0)",
                    tables.set
                ))?;
                for value in values {
                    if !exists.exists(params![key, value])? {
                        insert.execute(params![key, value])?;
                    }
                }
            }
            Self::RemoveFromSet { key, value } => {
                tx.execute(
                    &format!("DELETE FROM {} WHERE Key = ?1 AND Value = ?2", tables.set),
                    params![key, value],
                )?;
            }
            Self::RemoveSet { key } => {
                tx.execute(
                    &format!("DELETE FROM {} WHERE Key = ?1", tables.set),
                    params![key],
                )?;
            }
            Self::ExpireSet { key, expire_in } => {
                expire_key(tx, &tables.set, key, Some(expire_at(expire_in)))?;
            }
            Self::PersistSet { key } => expire_key(tx, &tables.set, key, None)?,
            Self::InsertToList { key, value } => {
                tx.execute(
                    &format!("INSERT INTO {} (Key, Value) VALUES (?1, ?2)", tables.list),
                    params![key, value],
                )?;
            }
            Self::RemoveFromList { key, value } => {
                tx.execute(
                    &format!("DELETE FROM {} WHERE Key = ?1 AND Value = ?2", tables.list),
                    params![key, value],
                )?;
            }
            Self::TrimList { key, keep_from, keep_to } => {
                if keep_to < keep_from {
                    // Empty range: nothing is kept.
                    tx.execute(
                        &format!("DELETE FROM {} WHERE Key = ?1", tables.list),
                        params![key],
                    )?;
                } else {
                    let limit = i64::try_from((keep_to - keep_from).saturating_add(1))
                        .unwrap_or(i64::MAX);
                    tx.execute(
                        &format!(
                            "DELETE FROM {list} WHERE Key = ?1 AND Id NOT IN (\
                             SELECT Id FROM {list} WHERE Key = ?1 ORDER BY Id DESC LIMIT ?2 OFFSET ?3)",
                            list = tables.list
                        ),
                        params![key, limit, i64::try_from(*keep_from).unwrap_or(i64::MAX)],
                    )?;
                }
            }
            Self::ExpireList { key, expire_in } => {
                expire_key(tx, &tables.list, key, Some(expire_at(expire_in)))?;
            }
            Self::PersistList { key } => expire_key(tx, &tables.list, key, None)?,
            Self::SetRangeInHash { key, fields } => {
                let mut select = tx.prepare(&format!(
                    "SELECT Id FROM {} WHERE Key = ?1 AND Field = ?2",
                    tables.hash
                ))?;
                let mut insert = tx.prepare(&format!(
                    "INSERT INTO {} (Key, Field, Value) VALUES (?1, ?2, ?3)",
                    tables.hash
                ))?;
                let mut update = tx.prepare(&format!(
                    "UPDATE {} SET Value = ?1 WHERE Id = ?2",
                    tables.hash
                ))?;
                for (field, value) in fields {
                    let existing: Option<i64> = select
                        .query_row(params![key, field], |row| row.get(0))
                        .optional()?;
                    match existing {
                        Some(id) => update.execute(params![value, id])?,
                        None => insert.execute(params![key, field, value])?,
                    };
                }
            }
            Self::RemoveHash { key } => {
                tx.execute(
                    &format!("DELETE FROM {} WHERE Key = ?1", tables.hash),
                    params![key],
                )?;
            }
            Self::ExpireHash { key, expire_in } => {
                expire_key(tx, &tables.hash, key, Some(expire_at(expire_in)))?;
            }
            Self::PersistHash { key } => expire_key(tx, &tables.hash, key, None)?,
        }
        Ok(())
    }
}

fn insert_state(
    tx: &Transaction<'_>,
    tables: &Tables,
    job_id: i64,
    state: &JobState,
    now: i64,
) -> Result<i64> {
    let data = serde_json::to_string(&state.data)?;
    tx.execute(
        &format!(
            "INSERT INTO {} (JobId, Name, Reason, CreatedAt, Data) VALUES (?1, ?2, ?3, ?4, ?5)",
            tables.state
        ),
        params![job_id, state.name, state.reason, now, data],
    )?;
    Ok(tx.last_insert_rowid())
}

fn expire_key(tx: &Transaction<'_>, table: &str, key: &str, expire_at: Option<i64>) -> Result<()> {
    tx.execute(
        &format!("UPDATE {table} SET ExpireAt = ?1 WHERE Key = ?2"),
        params![expire_at, key],
    )?;
    Ok(())
}

/// A batch of mutations committed atomically.
pub struct WriteOnlyTransaction {
    storage: Storage,
    operations: Vec<Operation>,
}

impl WriteOnlyTransaction {
    pub(crate) fn new(storage: Storage) -> Self {
        Self {
            storage,
            operations: Vec::new(),
        }
    }

    /// Queued operations, in call order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Collection locks commit will take, in acquisition order.
    pub fn lock_resources(&self) -> Vec<String> {
        let prefix = self.storage.tables().prefix();
        self.operations
            .iter()
            .filter_map(Operation::collection)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|c| c.lock_resource(prefix))
            .collect()
    }

    /// Queue an arbitrary operation.
    pub fn push(&mut self, operation: Operation) -> &mut Self {
        self.operations.push(operation);
        self
    }

    pub fn expire_job(&mut self, job_id: &str, expire_in: Duration) -> &mut Self {
        self.push(Operation::ExpireJob {
            job_id: job_id.into(),
            expire_in,
        })
    }

    pub fn persist_job(&mut self, job_id: &str) -> &mut Self {
        self.push(Operation::PersistJob {
            job_id: job_id.into(),
        })
    }

    /// Record a state and make it the job's current state.
    pub fn set_job_state(&mut self, job_id: &str, state: JobState) -> &mut Self {
        self.push(Operation::SetJobState {
            job_id: job_id.into(),
            state,
        })
    }

    /// Record a state in the history without changing the current one.
    pub fn add_job_state(&mut self, job_id: &str, state: JobState) -> &mut Self {
        self.push(Operation::AddJobState {
            job_id: job_id.into(),
            state,
        })
    }

    pub fn add_to_queue(&mut self, queue: &str, job_id: &str) -> &mut Self {
        self.push(Operation::AddToQueue {
            queue: queue.into(),
            job_id: job_id.into(),
        })
    }

    pub fn increment_counter(&mut self, key: &str, expire_in: Option<Duration>) -> &mut Self {
        self.push(Operation::Counter {
            key: key.into(),
            delta: 1,
            expire_in,
        })
    }

    pub fn decrement_counter(&mut self, key: &str, expire_in: Option<Duration>) -> &mut Self {
        self.push(Operation::Counter {
            key: key.into(),
            delta: -1,
            expire_in,
        })
    }

    /// Add a member, or update its score if already present.
    pub fn add_to_set(&mut self, key: &str, value: &str, score: f64) -> &mut Self {
        self.push(Operation::AddToSet {
            key: key.into(),
            value: value.into(),
            score,
        })
    }

    /// Add members with score 0; existing members keep their score.
    pub fn add_range_to_set(&mut self, key: &str, values: Vec<String>) -> &mut Self {
        self.push(Operation::AddRangeToSet {
            key: key.into(),
            values,
        })
    }

    pub fn remove_from_set(&mut self, key: &str, value: &str) -> &mut Self {
        self.push(Operation::RemoveFromSet {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn remove_set(&mut self, key: &str) -> &mut Self {
        self.push(Operation::RemoveSet { key: key.into() })
    }

    pub fn expire_set(&mut self, key: &str, expire_in: Duration) -> &mut Self {
        self.push(Operation::ExpireSet {
            key: key.into(),
            expire_in,
        })
    }

    pub fn persist_set(&mut self, key: &str) -> &mut Self {
        self.push(Operation::PersistSet { key: key.into() })
    }

    pub fn insert_to_list(&mut self, key: &str, value: &str) -> &mut Self {
        self.push(Operation::InsertToList {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn remove_from_list(&mut self, key: &str, value: &str) -> &mut Self {
        self.push(Operation::RemoveFromList {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Keep only entries `keep_from..=keep_to`, counting from the newest.
    pub fn trim_list(&mut self, key: &str, keep_from: usize, keep_to: usize) -> &mut Self {
        self.push(Operation::TrimList {
            key: key.into(),
            keep_from,
            keep_to,
        })
    }

    pub fn expire_list(&mut self, key: &str, expire_in: Duration) -> &mut Self {
        self.push(Operation::ExpireList {
            key: key.into(),
            expire_in,
        })
    }

    pub fn persist_list(&mut self, key: &str) -> &mut Self {
        self.push(Operation::PersistList { key: key.into() })
    }

    pub fn set_range_in_hash<I, K, V>(&mut self, key: &str, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.push(Operation::SetRangeInHash {
            key: key.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        })
    }

    pub fn remove_hash(&mut self, key: &str) -> &mut Self {
        self.push(Operation::RemoveHash { key: key.into() })
    }

    pub fn expire_hash(&mut self, key: &str, expire_in: Duration) -> &mut Self {
        self.push(Operation::ExpireHash {
            key: key.into(),
            expire_in,
        })
    }

    pub fn persist_hash(&mut self, key: &str) -> &mut Self {
        self.push(Operation::PersistHash { key: key.into() })
    }

    /// Apply every queued operation atomically.
    ///
    /// Collection locks (`{prefix}:Hash:Lock`, `{prefix}:List:Lock`,
    /// `{prefix}:Set:Lock`) are taken here, at commit time, not when an
    /// operation is queued. They are acquired in sorted order, each waiting
    /// up to 30 seconds, held across the replay and released on every exit
    /// path. A batch that is dropped without committing never holds a lock.
    pub async fn commit(self) -> Result<()> {
        self.commit_cancellable(&CancellationToken::new()).await
    }

    /// Like [`commit`](Self::commit), but lock waits stop when `cancel` fires.
    pub async fn commit_cancellable(self, cancel: &CancellationToken) -> Result<()> {
        if self.operations.is_empty() {
            return Ok(());
        }

        let resources = self.lock_resources();
        let mut held = Vec::with_capacity(resources.len());
        for resource in &resources {
            match DistributedLock::acquire_cancellable(
                &self.storage,
                resource,
                COLLECTION_LOCK_TIMEOUT,
                cancel,
            )
            .await
            {
                Ok(lock) => held.push(lock),
                Err(e) => {
                    if let Err(release_err) = release_all(held).await {
                        tracing::warn!(
                            error = %release_err,
                            "Collection locks not fully released after failed acquire"
                        );
                    }
                    return Err(e);
                }
            }
        }

        let outcome = self.replay().await;

        let released = release_all(held).await;
        outcome?;
        released
    }

    async fn replay(self) -> Result<()> {
        let count = self.operations.len();
        let tables = self.storage.tables().clone();
        let operations = self.operations;
        let behavior = self.storage.options().isolation_level.behavior();

        self.storage
            .gate()
            .with_transaction(behavior, move |tx| {
                let now = now_millis();
                for (index, operation) in operations.iter().enumerate() {
                    operation
                        .apply(tx, &tables, now)
                        .map_err(|e| StorageError::Transaction {
                            index,
                            operation: operation.name(),
                            source: Box::new(e),
                        })?;
                }
                Ok(())
            })
            .await?;

        tracing::debug!(operations = count, "Transaction committed");
        Ok(())
    }
}

/// Release locks in reverse order, returning the first failure.
async fn release_all(held: Vec<DistributedLock>) -> Result<()> {
    let mut first_error = None;
    for lock in held.into_iter().rev() {
        if let Err(e) = lock.release().await {
            tracing::error!(error = %e, "Failed to release collection lock");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
