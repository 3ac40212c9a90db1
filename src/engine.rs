//! The storage engine: one database target plus the components built on it.

use rusqlite::{params, Connection};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StorageOptions;
use crate::error::Result;
use crate::expiration::ExpirationManager;
use crate::lock::DistributedLock;
use crate::now_millis;
use crate::queue::JobQueue;
use crate::storage::batch::WriteOnlyTransaction;
use crate::storage::gate::{ConnectionGate, Intent, WriterLockRegistry};
use crate::storage::reader::Reader;
use crate::storage::schema::{self, Tables};
use crate::to_millis;

/// Handle to a SQLite job store.
///
/// Cheap to clone; clones share the connection pool, writer lock and
/// queue-name cache.
#[derive(Clone)]
pub struct Storage {
    gate: ConnectionGate,
    tables: Arc<Tables>,
    options: Arc<StorageOptions>,
    queue: JobQueue,
}

impl Storage {
    /// Open a database file with its own writer-lock registry.
    pub async fn open<P: AsRef<Path>>(db_path: P, options: StorageOptions) -> Result<Self> {
        Self::open_with_registry(db_path, options, &WriterLockRegistry::new()).await
    }

    /// Open a database file, sharing writer locks through `registry`.
    ///
    /// Storage instances in one process that point at the same file must
    /// share a registry, otherwise their writers are not serialized.
    pub async fn open_with_registry<P: AsRef<Path>>(
        db_path: P,
        options: StorageOptions,
        registry: &WriterLockRegistry,
    ) -> Result<Self> {
        let tables = Tables::new(&options.schema_name)?;
        let gate = ConnectionGate::open(
            db_path,
            registry,
            options.pool_size,
            options.transaction_timeout,
            options.write_lock_timeout,
        )?;
        Self::initialize(gate, tables, options).await
    }

    /// Use a connection supplied by the caller.
    pub async fn from_connection(conn: Connection, options: StorageOptions) -> Result<Self> {
        let tables = Tables::new(&options.schema_name)?;
        let gate = ConnectionGate::existing(
            conn,
            options.transaction_timeout,
            options.write_lock_timeout,
        )?;
        Self::initialize(gate, tables, options).await
    }

    async fn initialize(gate: ConnectionGate, tables: Tables, options: StorageOptions) -> Result<Self> {
        let tables = Arc::new(tables);
        let options = Arc::new(options);

        if options.prepare_schema_if_necessary {
            let install_tables = tables.clone();
            gate.with_connection(Intent::Write, move |conn| {
                schema::install(conn, &install_tables)?;
                Ok(())
            })
            .await?;
        }

        let queue = JobQueue::new(gate.clone(), tables.clone(), options.clone());
        tracing::debug!(target_db = gate.target(), schema = tables.prefix(), "Storage opened");

        Ok(Self {
            gate,
            tables,
            options,
            queue,
        })
    }

    pub fn gate(&self) -> &ConnectionGate {
        &self.gate
    }

    pub fn tables(&self) -> &Arc<Tables> {
        &self.tables
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// The persistent job queue.
    pub fn job_queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Read-side queries.
    pub fn reader(&self) -> Reader {
        Reader::new(self.gate.clone(), self.tables.clone())
    }

    /// Start a new write-only transaction batch.
    pub fn transaction(&self) -> WriteOnlyTransaction {
        WriteOnlyTransaction::new(self.clone())
    }

    /// Background component that removes expired rows.
    pub fn expiration_manager(&self) -> ExpirationManager {
        ExpirationManager::new(self.clone(), self.options.job_expiration_check_interval)
    }

    /// Acquire a distributed lock on `resource`.
    pub async fn acquire_lock(&self, resource: &str, timeout: Duration) -> Result<DistributedLock> {
        DistributedLock::acquire(self, resource, timeout).await
    }

    /// Insert a job that expires after `expire_in` unless persisted.
    ///
    /// Returns the new job id.
    pub async fn create_expired_job(
        &self,
        invocation_data: &str,
        expire_in: Duration,
    ) -> Result<String> {
        let sql = format!(
            "INSERT INTO {} (InvocationData, CreatedAt, ExpireAt) VALUES (?1, ?2, ?3)",
            self.tables.job
        );
        let invocation_data = invocation_data.to_string();
        let behavior = self.options.isolation_level.behavior();

        let id = self
            .gate
            .with_transaction(behavior, move |tx| {
                let now = now_millis();
                tx.execute(
                    &sql,
                    params![invocation_data, now, now.saturating_add(to_millis(expire_in))],
                )?;
                Ok(tx.last_insert_rowid())
            })
            .await?;

        tracing::debug!(job_id = id, "Job created");
        Ok(id.to_string())
    }
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SQLite: {}", self.gate.target())
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("target", &self.gate.target())
            .field("schema", &self.tables.prefix())
            .finish_non_exhaustive()
    }
}
