//! Subcommand implementations.

pub mod counter;
pub mod lock;
pub mod queue;
pub mod sweep;
