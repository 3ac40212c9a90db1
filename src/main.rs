//! Stockpile daemon: keeps a job database tidy.
//!
//! # Usage
//!
//! ```bash
//! stockpile --database ./data/stockpile.db --expiration-check-interval-secs 600
//! ```
//!
//! Environment variables can also be used:
//! - `STOCKPILE_DATABASE`: Path to the SQLite database
//! - `STOCKPILE_SCHEMA`: Table name prefix
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use anyhow::Context;
use stockpile::config::Config;
use stockpile::daemon::run_daemon;
use stockpile::observability::tracing::init_tracing;
use stockpile::CancellationToken;
use std::fs;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
  Stockpile v{} - SQLite Job Storage

  Configuration:
    Database:   {}
    Schema:     {}
    Sweep:      every {}s
    Log Level:  {}

  Press Ctrl+C to shutdown gracefully.
"#,
        version,
        config.database.display(),
        config.schema,
        config.expiration_check_interval_secs,
        config.log_level
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    // Initialize tracing/logging
    init_tracing(&config.log_level, config.log_json);

    // Ensure the database directory exists
    if let Some(parent) = config.database.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    print_banner(&config);

    let shutdown = CancellationToken::new();

    // Spawn signal handler task
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating shutdown...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.expect("failed to listen for ctrl+c");
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }

        signal_token.cancel();
    });

    run_daemon(config, shutdown).await?;

    tracing::info!("Stockpile shutdown complete");
    Ok(())
}
