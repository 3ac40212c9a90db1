//! Configuration for the storage engine and the `stockpile` daemon.
//!
//! Supports:
//! - [`StorageOptions`] for embedding the engine as a library
//! - CLI arguments and environment overrides via clap ([`Config`])
//! - Sensible defaults for quick start

use clap::{Parser, ValueEnum};
use rusqlite::TransactionBehavior;
use std::path::PathBuf;
use std::time::Duration;

/// How write transactions take SQLite's database lock.
///
/// SQLite has no isolation levels in the usual sense. What can be chosen is
/// when the write lock is taken: lazily on first write, immediately, or
/// exclusively against readers too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IsolationLevel {
    Deferred,
    Immediate,
    Exclusive,
}

impl IsolationLevel {
    pub(crate) fn behavior(self) -> TransactionBehavior {
        match self {
            Self::Deferred => TransactionBehavior::Deferred,
            Self::Immediate => TransactionBehavior::Immediate,
            Self::Exclusive => TransactionBehavior::Exclusive,
        }
    }
}

/// Options consumed by [`Storage`](crate::Storage) and its components.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Prefix for every table name (`"<prefix>.Job"` and so on).
    pub schema_name: String,

    /// How long a fetched queue item stays hidden before it is reclaimed.
    ///
    /// Default: 30 minutes
    pub invisibility_timeout: Duration,

    /// Delay between dequeue attempts when every candidate queue is empty.
    ///
    /// Default: 15 seconds
    pub queue_poll_interval: Duration,

    /// Delay between expiration sweeps.
    ///
    /// Default: 1 hour
    pub job_expiration_check_interval: Duration,

    /// Lock behavior for write transactions.
    pub isolation_level: IsolationLevel,

    /// Busy timeout applied to every connection.
    ///
    /// Default: 1 minute
    pub transaction_timeout: Duration,

    /// Maximum wait for the in-process writer lock.
    ///
    /// Default: 30 seconds
    pub write_lock_timeout: Duration,

    /// Maximum number of pooled connections.
    pub pool_size: u32,

    /// Create missing tables when the storage is opened.
    pub prepare_schema_if_necessary: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            schema_name: "stockpile".into(),
            invisibility_timeout: Duration::from_secs(30 * 60),
            queue_poll_interval: Duration::from_secs(15),
            job_expiration_check_interval: Duration::from_secs(60 * 60),
            isolation_level: IsolationLevel::Immediate,
            transaction_timeout: Duration::from_secs(60),
            write_lock_timeout: Duration::from_secs(30),
            pool_size: 10,
            prepare_schema_if_necessary: true,
        }
    }
}

impl StorageOptions {
    /// Options with short intervals for tests.
    pub fn test_options() -> Self {
        Self {
            invisibility_timeout: Duration::from_secs(5),
            queue_poll_interval: Duration::from_millis(20),
            job_expiration_check_interval: Duration::from_millis(50),
            write_lock_timeout: Duration::from_secs(5),
            pool_size: 4,
            ..Self::default()
        }
    }
}

/// Stockpile: a SQLite-backed job storage engine.
#[derive(Parser, Debug, Clone)]
#[command(name = "stockpile")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Path to the SQLite database file
    #[arg(short, long, env = "STOCKPILE_DATABASE", default_value = "./data/stockpile.db")]
    pub database: PathBuf,

    /// Table name prefix
    #[arg(long, env = "STOCKPILE_SCHEMA", default_value = "stockpile")]
    pub schema: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "STOCKPILE_LOG_JSON")]
    pub log_json: bool,

    /// Seconds a fetched job stays invisible before it is reclaimed
    #[arg(long, env = "STOCKPILE_INVISIBILITY_TIMEOUT_SECS", default_value_t = 1800)]
    pub invisibility_timeout_secs: u64,

    /// Seconds between queue polls when no job is available
    #[arg(long, env = "STOCKPILE_QUEUE_POLL_INTERVAL_SECS", default_value_t = 15)]
    pub queue_poll_interval_secs: u64,

    /// Seconds between expiration sweeps
    #[arg(long, env = "STOCKPILE_EXPIRATION_CHECK_INTERVAL_SECS", default_value_t = 3600)]
    pub expiration_check_interval_secs: u64,

    /// Write transaction lock behavior
    #[arg(long, env = "STOCKPILE_ISOLATION_LEVEL", value_enum, default_value_t = IsolationLevel::Immediate)]
    pub isolation_level: IsolationLevel,

    /// Busy timeout for each connection, in seconds
    #[arg(long, env = "STOCKPILE_TRANSACTION_TIMEOUT_SECS", default_value_t = 60)]
    pub transaction_timeout_secs: u64,

    /// Maximum wait for the in-process writer lock, in seconds
    #[arg(long, env = "STOCKPILE_WRITE_LOCK_TIMEOUT_SECS", default_value_t = 30)]
    pub write_lock_timeout_secs: u64,

    /// Size of the connection pool
    #[arg(long, env = "STOCKPILE_POOL_SIZE", default_value_t = 10)]
    pub pool_size: u32,

    /// Do not create missing tables on startup
    #[arg(long, env = "STOCKPILE_SKIP_SCHEMA")]
    pub skip_schema: bool,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Storage options described by this configuration.
    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            schema_name: self.schema.clone(),
            invisibility_timeout: Duration::from_secs(self.invisibility_timeout_secs),
            queue_poll_interval: Duration::from_secs(self.queue_poll_interval_secs),
            job_expiration_check_interval: Duration::from_secs(
                self.expiration_check_interval_secs,
            ),
            isolation_level: self.isolation_level,
            transaction_timeout: Duration::from_secs(self.transaction_timeout_secs),
            write_lock_timeout: Duration::from_secs(self.write_lock_timeout_secs),
            pool_size: self.pool_size,
            prepare_schema_if_necessary: !self.skip_schema,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = StorageOptions::default();
        assert_eq!(options.schema_name, "stockpile");
        assert_eq!(options.write_lock_timeout, Duration::from_secs(30));
        assert_eq!(options.isolation_level, IsolationLevel::Immediate);
        assert!(options.prepare_schema_if_necessary);
    }

    #[test]
    fn test_config_maps_to_options() {
        let config = Config::parse_from([
            "stockpile",
            "--database",
            "/tmp/jobs.db",
            "--schema",
            "jobs",
            "--queue-poll-interval-secs",
            "2",
            "--isolation-level",
            "exclusive",
            "--skip-schema",
        ]);

        let options = config.storage_options();
        assert_eq!(options.schema_name, "jobs");
        assert_eq!(options.queue_poll_interval, Duration::from_secs(2));
        assert_eq!(options.isolation_level, IsolationLevel::Exclusive);
        assert!(!options.prepare_schema_if_necessary);
        assert_eq!(options.invisibility_timeout, Duration::from_secs(1800));
    }
}
