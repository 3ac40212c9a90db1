//! SQLite storage layer.
//!
//! Provides:
//! - Table naming and schema installation
//! - Connection gatekeeping with a per-database writer lock
//! - Write-only transaction batches with atomic commit
//! - Read-side queries for counters, sets, lists, hashes and jobs

pub mod batch;
pub mod gate;
pub mod models;
pub mod reader;
pub mod schema;
