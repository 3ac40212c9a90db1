//! Standalone daemon lifecycle.
//!
//! Opens the storage (installing the schema if asked to) and runs the
//! expiration sweeper until the shutdown token fires.

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::Storage;

/// Run the stockpile daemon.
///
/// # Arguments
///
/// * `config` - Daemon configuration
/// * `shutdown` - Cancelled when the process should stop
///
/// # Returns
///
/// Returns once the sweeper has stopped.
pub async fn run_daemon(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let storage = Storage::open(&config.database, config.storage_options()).await?;
    tracing::info!(storage = %storage, "Storage opened");

    let manager = storage.expiration_manager();
    let sweeper = tokio::spawn(manager.run(shutdown.clone()));

    shutdown.cancelled().await;
    tracing::info!("Shutdown signal received, stopping sweeper");

    sweeper.await?;

    tracing::info!("Daemon stopped");
    Ok(())
}
