//! Row types exchanged with the host framework.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A state transition to record for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub name: String,
    pub reason: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl JobState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: None,
            data: BTreeMap::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub invocation_data: String,
    pub state_id: Option<i64>,
    pub state_name: Option<String>,
    pub created_at: i64,
    pub expire_at: Option<i64>,
}

/// One entry of a job's state history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateRecord {
    pub id: i64,
    pub job_id: String,
    pub name: String,
    pub reason: Option<String>,
    pub created_at: i64,
    pub data: BTreeMap<String, String>,
}
