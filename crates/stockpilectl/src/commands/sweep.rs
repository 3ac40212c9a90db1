//! Sweep command implementation.

use anyhow::{Context, Result};
use serde::Serialize;
use stockpile::{CancellationToken, Storage};

use crate::OutputFormat;

#[derive(Serialize)]
struct TableOutput {
    table: String,
    passes: usize,
    removed: usize,
}

#[derive(Serialize)]
struct SweepOutput {
    tables: Vec<TableOutput>,
    removed: usize,
}

pub async fn run(storage: &Storage, batch_size: usize, format: OutputFormat) -> Result<()> {
    let report = storage
        .expiration_manager()
        .with_batch_size(batch_size)
        .execute(&CancellationToken::new())
        .await
        .context("sweep failed")?;

    let output = SweepOutput {
        removed: report.removed(),
        tables: report
            .tables
            .iter()
            .map(|t| TableOutput {
                table: t.table.clone(),
                passes: t.passes.len(),
                removed: t.removed(),
            })
            .collect(),
    };

    match format {
        OutputFormat::Text => {
            println!("{:<30} {:>8} {:>10}", "TABLE", "PASSES", "REMOVED");
            println!("{}", "-".repeat(50));
            for table in &output.tables {
                println!("{:<30} {:>8} {:>10}", table.table, table.passes, table.removed);
            }
            println!();
            println!("Total: {} row(s) removed", output.removed);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
