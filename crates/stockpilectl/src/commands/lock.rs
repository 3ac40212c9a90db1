//! Lock command implementation.

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::{Duration, Instant};
use stockpile::Storage;

use crate::OutputFormat;

#[derive(Serialize)]
struct LockOutput {
    resource: String,
    waited_ms: u128,
    held_ms: u128,
}

pub async fn run(
    storage: &Storage,
    resource: &str,
    timeout_secs: u64,
    hold_secs: u64,
    format: OutputFormat,
) -> Result<()> {
    let started = Instant::now();
    let lock = storage
        .acquire_lock(resource, Duration::from_secs(timeout_secs))
        .await
        .with_context(|| format!("failed to acquire '{}'", resource))?;
    let waited = started.elapsed();

    if format == OutputFormat::Text {
        println!("Acquired '{}' after {} ms", resource, waited.as_millis());
    }

    let held_since = Instant::now();
    if hold_secs > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(hold_secs)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    lock.release()
        .await
        .with_context(|| format!("failed to release '{}'", resource))?;

    let output = LockOutput {
        resource: resource.to_string(),
        waited_ms: waited.as_millis(),
        held_ms: held_since.elapsed().as_millis(),
    };

    match format {
        OutputFormat::Text => {
            println!("Released '{}' after {} ms", output.resource, output.held_ms);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
