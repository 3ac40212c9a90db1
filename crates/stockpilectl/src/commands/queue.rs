//! Queue command implementations.

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use stockpile::{CancellationToken, FetchedJob, JobState, Storage, StorageError};

use crate::OutputFormat;

/// Lifetime of a freshly created job until it is persisted below.
const CREATE_EXPIRE_IN: Duration = Duration::from_secs(24 * 60 * 60);

/// What to do with a fetched job before exiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Finish {
    Ack,
    Requeue,
    Leave,
}

#[derive(Serialize)]
struct EnqueueOutput {
    job_id: String,
    queue: String,
}

#[derive(Serialize)]
struct DequeueOutput {
    job_id: String,
    queue: String,
    queue_row: i64,
    finish: Finish,
}

#[derive(Serialize)]
struct QueuesOutput {
    queues: Vec<String>,
    total: usize,
}

pub async fn enqueue(storage: &Storage, queue: &str, payload: &str, format: OutputFormat) -> Result<()> {
    let job_id = storage
        .create_expired_job(payload, CREATE_EXPIRE_IN)
        .await
        .context("failed to create job")?;

    let mut tx = storage.transaction();
    tx.set_job_state(&job_id, JobState::new("Enqueued").with_data("Queue", queue))
        .add_to_queue(queue, &job_id)
        .persist_job(&job_id);
    tx.commit().await.context("failed to enqueue job")?;

    let output = EnqueueOutput {
        job_id,
        queue: queue.to_string(),
    };

    match format {
        OutputFormat::Text => {
            println!("Enqueued job {} on '{}'", output.job_id, output.queue);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

pub async fn dequeue(
    storage: &Storage,
    queues: &[String],
    wait_secs: u64,
    finish: Finish,
    format: OutputFormat,
) -> Result<()> {
    let fetched = if wait_secs == 0 {
        storage.job_queue().try_dequeue(queues).await?
    } else {
        let cancel = CancellationToken::new();
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;
            deadline.cancel();
        });

        match storage.job_queue().dequeue(queues, &cancel).await {
            Ok(job) => Some(job),
            Err(StorageError::Cancelled) => None,
            Err(e) => return Err(e.into()),
        }
    };

    let Some(job) = fetched else {
        match format {
            OutputFormat::Text => println!("No job available."),
            OutputFormat::Json => println!("null"),
        }
        return Ok(());
    };

    let output = DequeueOutput {
        job_id: job.job_id().to_string(),
        queue: job.queue().to_string(),
        queue_row: job.id(),
        finish,
    };
    complete(job, finish).await?;

    match format {
        OutputFormat::Text => {
            println!("Fetched job {} from '{}'", output.job_id, output.queue);
            match finish {
                Finish::Ack => println!("  Removed from queue"),
                Finish::Requeue => println!("  Requeued"),
                Finish::Leave => println!("  Leased until the invisibility timeout passes"),
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn complete(job: FetchedJob, finish: Finish) -> Result<()> {
    match finish {
        Finish::Ack => job.remove_from_queue().await?,
        Finish::Requeue => job.requeue().await?,
        Finish::Leave => {}
    }
    Ok(())
}

pub async fn list(storage: &Storage, format: OutputFormat) -> Result<()> {
    let queues = storage.job_queue().queues().await?;
    let output = QueuesOutput {
        total: queues.len(),
        queues,
    };

    match format {
        OutputFormat::Text => {
            if output.queues.is_empty() {
                println!("No queues found.");
            } else {
                println!("QUEUE");
                println!("{}", "-".repeat(40));
                for queue in &output.queues {
                    println!("{}", queue);
                }
                println!();
                println!("Total: {} queue(s)", output.total);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
