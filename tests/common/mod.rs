//! Test utilities for Stockpile integration tests.
//!
//! Provides:
//! - Temporary database fixtures
//! - Raw SQL helpers for inspecting and seeding tables
//! - Polling for conditions reached by background tasks

#![allow(dead_code)]

use rusqlite::params;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use stockpile::observability::tracing::init_test_tracing;
use stockpile::storage::gate::Intent;
use stockpile::{Storage, StorageOptions, WriterLockRegistry};
use tempfile::TempDir;

/// Test fixture that manages a temporary database directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for test database
    pub temp_dir: TempDir,
    /// Path to the database file
    pub db_path: PathBuf,
    /// Writer locks shared by every storage opened through this fixture
    pub registry: WriterLockRegistry,
}

impl TestFixture {
    /// Create a new test fixture with a temporary database directory.
    ///
    /// Also installs a quiet tracing subscriber so failures log errors.
    pub fn new() -> Self {
        init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");
        Self {
            temp_dir,
            db_path,
            registry: WriterLockRegistry::new(),
        }
    }

    /// Open storage with short test intervals.
    pub async fn storage(&self) -> Storage {
        self.storage_with(StorageOptions::test_options()).await
    }

    /// Open storage with the given options.
    pub async fn storage_with(&self, options: StorageOptions) -> Storage {
        Storage::open_with_registry(&self.db_path, options, &self.registry)
            .await
            .expect("failed to open storage")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Count rows in `table` matching an optional WHERE clause.
pub async fn count_rows(storage: &Storage, table: &str, filter: &str) -> i64 {
    let sql = if filter.is_empty() {
        format!("SELECT COUNT(*) FROM {table}")
    } else {
        format!("SELECT COUNT(*) FROM {table} WHERE {filter}")
    };
    storage
        .gate()
        .with_connection(Intent::Read, move |conn| {
            Ok(conn.query_row(&sql, [], |row| row.get(0))?)
        })
        .await
        .expect("count query failed")
}

/// Insert `count` counter rows for `key` with a fixed `ExpireAt`.
pub async fn seed_counters(storage: &Storage, key: &str, count: usize, expire_at: Option<i64>) {
    let sql = format!(
        "INSERT INTO {} (Key, Value, ExpireAt) VALUES (?1, 1, ?2)",
        storage.tables().counter
    );
    let key = key.to_string();
    storage
        .gate()
        .with_connection(Intent::Write, move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                for _ in 0..count {
                    stmt.execute(params![key, expire_at])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .expect("seeding counters failed");
}

/// Poll an async condition every 20ms until it holds or `timeout` passes.
///
/// Returns `true` if the condition was met.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_creates_temp_dir() {
        let fixture = TestFixture::new();
        assert!(fixture.temp_dir.path().exists());
        assert!(fixture.db_path.ends_with("test.db"));
    }
}
