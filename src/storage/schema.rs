//! Table naming, schema preparation and connection pragmas.
//!
//! Every table lives under a configurable prefix: with the default prefix the
//! job table is `"stockpile.Job"`. The prefix ends up inside SQL text, so it is
//! restricted to ASCII alphanumerics and underscores.

use rusqlite::Connection;
use std::time::Duration;

use crate::error::{Result, StorageError};

/// Quoted, prefixed names of the eight tables.
#[derive(Debug, Clone)]
pub struct Tables {
    prefix: String,
    pub job: String,
    pub state: String,
    pub job_queue: String,
    pub lock: String,
    pub counter: String,
    pub set: String,
    pub list: String,
    pub hash: String,
}

impl Tables {
    /// Build table names for the given prefix.
    pub fn new(prefix: &str) -> Result<Self> {
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StorageError::InvalidArgument(format!(
                "schema name '{prefix}' must be non-empty and contain only [A-Za-z0-9_]"
            )));
        }

        let name = |table: &str| format!("\"{prefix}.{table}\"");
        Ok(Self {
            prefix: prefix.to_string(),
            job: name("Job"),
            state: name("State"),
            job_queue: name("JobQueue"),
            lock: name("Lock"),
            counter: name("Counter"),
            set: name("Set"),
            list: name("List"),
            hash: name("Hash"),
        })
    }

    /// The bare prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Tables carrying an `ExpireAt` column, in sweep order.
    pub fn expirable(&self) -> [&str; 5] {
        [&self.counter, &self.job, &self.list, &self.set, &self.hash]
    }
}

/// Apply pragmas every connection needs.
pub fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    // Busy timeout first: switching to WAL needs a lock other connections may hold.
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        "#,
    )
}

/// Create any missing tables and indexes.
///
/// Idempotent. There is no versioning: an existing table is left as it is.
pub fn install(conn: &Connection, tables: &Tables) -> rusqlite::Result<()> {
    let p = tables.prefix();
    tracing::info!(schema = p, "Preparing storage schema");

    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {job} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            StateId INTEGER NULL,
            StateName TEXT NULL,
            InvocationData TEXT NOT NULL,
            CreatedAt INTEGER NOT NULL,
            ExpireAt INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS "IX_{p}_Job_ExpireAt" ON {job} (ExpireAt);

        CREATE TABLE IF NOT EXISTS {state} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            JobId INTEGER NOT NULL REFERENCES {job} (Id) ON DELETE CASCADE,
            Name TEXT NOT NULL,
            Reason TEXT NULL,
            CreatedAt INTEGER NOT NULL,
            Data TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS "IX_{p}_State_JobId" ON {state} (JobId);

        CREATE TABLE IF NOT EXISTS {job_queue} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            JobId INTEGER NOT NULL,
            Queue TEXT NOT NULL,
            FetchedAt INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS "IX_{p}_JobQueue_Queue_FetchedAt" ON {job_queue} (Queue, FetchedAt);

        CREATE TABLE IF NOT EXISTS {lock} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            Resource TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS {counter} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            Key TEXT NOT NULL,
            Value INTEGER NOT NULL,
            ExpireAt INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS "IX_{p}_Counter_Key" ON {counter} (Key);

        CREATE TABLE IF NOT EXISTS {set} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            Key TEXT NOT NULL,
            Score REAL NOT NULL,
            Value TEXT NOT NULL,
            ExpireAt INTEGER NULL,
            UNIQUE (Key, Value)
        );

        CREATE TABLE IF NOT EXISTS {list} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            Key TEXT NOT NULL,
            Value TEXT NULL,
            ExpireAt INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS "IX_{p}_List_Key" ON {list} (Key);

        CREATE TABLE IF NOT EXISTS {hash} (
            Id INTEGER PRIMARY KEY AUTOINCREMENT,
            Key TEXT NOT NULL,
            Field TEXT NOT NULL,
            Value TEXT NULL,
            ExpireAt INTEGER NULL,
            UNIQUE (Key, Field)
        );
        "#,
        job = tables.job,
        state = tables.state,
        job_queue = tables.job_queue,
        lock = tables.lock,
        counter = tables.counter,
        set = tables.set,
        list = tables.list,
        hash = tables.hash,
    ))
}
