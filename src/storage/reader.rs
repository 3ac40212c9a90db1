//! Read-side queries over the persisted collections.
//!
//! Reads take the gate in read mode, so they run concurrently with each
//! other and wait only for an active write section.

use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::gate::{ConnectionGate, Intent};
use super::models::{JobRecord, StateRecord};
use super::schema::Tables;
use crate::error::{parse_job_id, Result};

/// Read access to counters, sets, lists, hashes and jobs.
#[derive(Clone)]
pub struct Reader {
    gate: ConnectionGate,
    tables: Arc<Tables>,
}

impl Reader {
    pub(crate) fn new(gate: ConnectionGate, tables: Arc<Tables>) -> Self {
        Self { gate, tables }
    }

    /// Sum of all deltas recorded for a counter. Missing counters are zero.
    pub async fn counter(&self, key: &str) -> Result<i64> {
        let sql = format!(
            "SELECT COALESCE(SUM(Value), 0) FROM {} WHERE Key = ?1",
            self.tables.counter
        );
        let key = key.to_string();
        self.gate
            .with_connection(Intent::Read, move |conn| {
                Ok(conn.query_row(&sql, params![key], |row| row.get(0))?)
            })
            .await
    }

    /// Members of a set with their scores, lowest score first.
    pub async fn set_members(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let sql = format!(
            "SELECT Value, Score FROM {} WHERE Key = ?1 ORDER BY Score ASC, Id ASC",
            self.tables.set
        );
        let key = key.to_string();
        self.gate
            .with_connection(Intent::Read, move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// List values between two inclusive indexes; index 0 is the newest entry.
    pub async fn list_range(&self, key: &str, start: usize, end: usize) -> Result<Vec<String>> {
        if end < start {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT Value FROM {} WHERE Key = ?1 ORDER BY Id DESC LIMIT ?2 OFFSET ?3",
            self.tables.list
        );
        let key = key.to_string();
        let limit = i64::try_from((end - start).saturating_add(1)).unwrap_or(i64::MAX);
        let offset = i64::try_from(start).unwrap_or(i64::MAX);
        self.gate
            .with_connection(Intent::Read, move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![key, limit, offset], |row| {
                        Ok(row.get::<_, Option<String>>(0)?.unwrap_or_default())
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// All fields of a hash.
    pub async fn hash(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let sql = format!("SELECT Field, Value FROM {} WHERE Key = ?1", self.tables.hash);
        let key = key.to_string();
        self.gate
            .with_connection(Intent::Read, move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![key], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        ))
                    })?
                    .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
                Ok(rows)
            })
            .await
    }

    /// A job row, if it still exists.
    pub async fn job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let id = parse_job_id(job_id)?;
        let sql = format!(
            "SELECT Id, InvocationData, StateId, StateName, CreatedAt, ExpireAt FROM {} WHERE Id = ?1",
            self.tables.job
        );
        self.gate
            .with_connection(Intent::Read, move |conn| {
                let job = conn
                    .query_row(&sql, params![id], |row| {
                        Ok(JobRecord {
                            id: row.get::<_, i64>(0)?.to_string(),
                            invocation_data: row.get(1)?,
                            state_id: row.get(2)?,
                            state_name: row.get(3)?,
                            created_at: row.get(4)?,
                            expire_at: row.get(5)?,
                        })
                    })
                    .optional()?;
                Ok(job)
            })
            .await
    }

    /// State history of a job, oldest first.
    pub async fn job_states(&self, job_id: &str) -> Result<Vec<StateRecord>> {
        let id = parse_job_id(job_id)?;
        let sql = format!(
            "SELECT Id, JobId, Name, Reason, CreatedAt, Data FROM {} WHERE JobId = ?1 ORDER BY Id ASC",
            self.tables.state
        );
        self.gate
            .with_connection(Intent::Read, move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let raw = stmt
                    .query_map(params![id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, Option<String>>(5)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                raw.into_iter()
                    .map(|(id, job_id, name, reason, created_at, data)| {
                        let data = match data {
                            Some(json) => serde_json::from_str(&json)?,
                            None => BTreeMap::new(),
                        };
                        Ok(StateRecord {
                            id,
                            job_id: job_id.to_string(),
                            name,
                            reason,
                            created_at,
                            data,
                        })
                    })
                    .collect()
            })
            .await
    }
}
