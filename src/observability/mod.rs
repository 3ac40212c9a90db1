//! Observability infrastructure.
//!
//! Provides:
//! - Structured tracing via `tracing-subscriber`
//! - Quiet subscriber setup for tests

pub mod tracing;
