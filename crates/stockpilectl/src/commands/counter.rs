//! Counter command implementation.

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use stockpile::{Operation, Storage};

use crate::OutputFormat;

#[derive(Serialize)]
struct CounterOutput {
    key: String,
    value: i64,
}

pub async fn run(
    storage: &Storage,
    key: &str,
    add: Option<i64>,
    expire_in_secs: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    if let Some(delta) = add.filter(|d| *d != 0) {
        let mut tx = storage.transaction();
        tx.push(Operation::Counter {
            key: key.to_string(),
            delta,
            expire_in: expire_in_secs.map(Duration::from_secs),
        });
        tx.commit().await.context("failed to update counter")?;
    }

    let output = CounterOutput {
        key: key.to_string(),
        value: storage.reader().counter(key).await?,
    };

    match format {
        OutputFormat::Text => println!("{} = {}", output.key, output.value),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
    }

    Ok(())
}
