//! Connection gatekeeper.
//!
//! SQLite allows a single writer at a time. Rather than letting concurrent
//! writers collide on `SQLITE_BUSY`, every write section in the process first
//! takes a writer lock keyed by the database target. Reads share the same
//! lock in read mode, so they run concurrently with each other.
//!
//! All blocking SQLite work runs on tokio's blocking pool.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::schema::apply_pragmas;
use crate::error::{Result, StorageError};

/// Whether a connection section intends to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

/// Registry of writer locks, one per database target.
///
/// Every [`ConnectionGate`] built from the same registry and pointing at the
/// same file shares one lock. Clone the registry to share it between storage
/// instances in one process.
#[derive(Debug, Clone, Default)]
pub struct WriterLockRegistry {
    locks: Arc<std::sync::Mutex<HashMap<String, Arc<RwLock<()>>>>>,
}

impl WriterLockRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the lock for a target, creating it on first use.
    pub fn lock_for(&self, target: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Number of distinct targets seen so far.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
enum ConnectionSource {
    Pool {
        pool: Pool<SqliteConnectionManager>,
        writer_lock: Arc<RwLock<()>>,
    },
    /// Supplied by the caller; never closed here.
    Existing(Arc<Mutex<Connection>>),
}

enum PoolGuard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Everything a section needs on the blocking thread.
enum Section {
    Pooled {
        pool: Pool<SqliteConnectionManager>,
        _guard: PoolGuard,
    },
    Exclusive(OwnedMutexGuard<Connection>),
}

/// Opens connections and serializes write sections.
#[derive(Clone)]
pub struct ConnectionGate {
    source: ConnectionSource,
    target: Arc<str>,
    write_lock_timeout: Duration,
}

impl ConnectionGate {
    /// Create a gate over a pooled database file.
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to the SQLite database file
    /// * `registry` - Registry holding the writer lock for this file
    /// * `pool_size` - Maximum number of pooled connections
    /// * `busy_timeout` - SQLite busy timeout for each connection
    /// * `write_lock_timeout` - Maximum wait for the writer lock
    pub fn open<P: AsRef<Path>>(
        db_path: P,
        registry: &WriterLockRegistry,
        pool_size: u32,
        busy_timeout: Duration,
        write_lock_timeout: Duration,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        let target: Arc<str> = canonical_target(db_path).into();

        let manager = SqliteConnectionManager::file(db_path).with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        );

        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(PragmaCustomizer { busy_timeout }))
            .build(manager)
            .map_err(|e| StorageError::ConnectionUnavailable {
                target: target.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            source: ConnectionSource::Pool {
                pool,
                writer_lock: registry.lock_for(&target),
            },
            target,
            write_lock_timeout,
        })
    }

    /// Create a gate over a connection supplied by the caller.
    ///
    /// Every section, read or write, holds the connection exclusively and
    /// waits at most `write_lock_timeout` for it. The connection is left
    /// open when the gate is dropped.
    pub fn existing(
        conn: Connection,
        busy_timeout: Duration,
        write_lock_timeout: Duration,
    ) -> Result<Self> {
        apply_pragmas(&conn, busy_timeout)?;
        let target: Arc<str> = conn
            .path()
            .filter(|p| !p.is_empty())
            .unwrap_or(":memory:")
            .into();

        Ok(Self {
            source: ConnectionSource::Existing(Arc::new(Mutex::new(conn))),
            target,
            write_lock_timeout,
        })
    }

    /// Identity of the database this gate points at.
    ///
    /// For files this is the canonical path, so different spellings of one
    /// file share a writer lock.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the connection was supplied by the caller.
    pub fn is_existing_connection(&self) -> bool {
        matches!(self.source, ConnectionSource::Existing(_))
    }

    /// Run `f` with a connection.
    ///
    /// With [`Intent::Write`] the writer lock for this target is held for the
    /// whole call. The lock and the connection are released on every exit
    /// path, including errors and panics inside `f`.
    pub async fn with_connection<T, F>(&self, intent: Intent, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let section = self.enter(intent).await?;
        let target = self.target.clone();

        tokio::task::spawn_blocking(move || match section {
            Section::Pooled { pool, _guard } => {
                let mut conn = pool
                    .get()
                    .map_err(|e| StorageError::ConnectionUnavailable {
                        target: target.to_string(),
                        reason: e.to_string(),
                    })?;
                f(&mut conn)
            }
            Section::Exclusive(mut conn) => f(&mut conn),
        })
        .await?
    }

    /// Run `f` inside a write transaction.
    ///
    /// Commits only if `f` returns `Ok`. Any error leaves the transaction
    /// uncommitted (rolled back on drop) and is returned unchanged.
    pub async fn with_transaction<T, F>(&self, behavior: TransactionBehavior, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_connection(Intent::Write, move |conn| {
            let tx = conn.transaction_with_behavior(behavior)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    async fn enter(&self, intent: Intent) -> Result<Section> {
        let wait = self.write_lock_timeout;
        let section = match (&self.source, intent) {
            (ConnectionSource::Existing(conn), _) => {
                tokio::time::timeout(wait, conn.clone().lock_owned())
                    .await
                    .map(Section::Exclusive)
            }
            (ConnectionSource::Pool { pool, writer_lock }, Intent::Read) => {
                tokio::time::timeout(wait, writer_lock.clone().read_owned())
                    .await
                    .map(|guard| Section::Pooled {
                        pool: pool.clone(),
                        _guard: PoolGuard::Read(guard),
                    })
            }
            (ConnectionSource::Pool { pool, writer_lock }, Intent::Write) => {
                tokio::time::timeout(wait, writer_lock.clone().write_owned())
                    .await
                    .map(|guard| Section::Pooled {
                        pool: pool.clone(),
                        _guard: PoolGuard::Write(guard),
                    })
            }
        };

        section.map_err(|_| {
            tracing::error!(
                target_db = %self.target,
                timeout = ?wait,
                ?intent,
                "Timed out waiting for the writer lock"
            );
            StorageError::ConnectionUnavailable {
                target: self.target.to_string(),
                reason: format!("writer lock not acquired within {wait:?}"),
            }
        })
    }
}

/// Canonical registry key for a database file.
///
/// The file itself may not exist yet, so the parent directory is resolved
/// and the file name joined back on. Falls back to the path as given when
/// the directory cannot be resolved.
fn canonical_target(db_path: &Path) -> String {
    let parent = match db_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    match (std::fs::canonicalize(parent), db_path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name).to_string_lossy().into_owned(),
        _ => db_path.to_string_lossy().into_owned(),
    }
}

impl std::fmt::Debug for ConnectionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGate")
            .field("target", &self.target)
            .field("existing", &self.is_existing_connection())
            .finish_non_exhaustive()
    }
}

/// Connection customizer that applies pragmas and the busy timeout.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout: Duration,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        apply_pragmas(conn, self.busy_timeout)
    }
}
