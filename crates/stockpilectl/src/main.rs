//! stockpilectl: Command-line interface for Stockpile job storage.
//!
//! Opens a database file directly and provides commands for enqueuing and
//! fetching jobs, inspecting queues and counters, holding locks and running
//! an expiration sweep from the terminal.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stockpile::{Storage, StorageOptions};

/// Command-line interface for Stockpile job storage.
#[derive(Parser)]
#[command(name = "stockpilectl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the SQLite database file
    #[arg(short, long, env = "STOCKPILE_DATABASE", default_value = "./data/stockpile.db")]
    database: PathBuf,

    /// Table name prefix
    #[arg(long, env = "STOCKPILE_SCHEMA", default_value = "stockpile")]
    schema: String,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a job and put it on a queue
    Enqueue {
        /// Queue name
        queue: String,
        /// Invocation payload stored with the job
        #[arg(short, long, default_value = "{}")]
        payload: String,
    },
    /// Fetch the next job from one or more queues
    Dequeue {
        /// Queue names, in no particular priority
        #[arg(required = true)]
        queues: Vec<String>,
        /// Seconds to wait for a job (0 = single attempt)
        #[arg(short, long, default_value = "0")]
        wait: u64,
        /// Remove the job from the queue after fetching
        #[arg(long, conflicts_with = "requeue")]
        ack: bool,
        /// Put the job straight back on the queue after fetching
        #[arg(long)]
        requeue: bool,
    },
    /// List queue names
    Queues,
    /// Acquire a distributed lock, hold it, then release it
    Lock {
        /// Resource name
        resource: String,
        /// Seconds to wait for the lock
        #[arg(short, long, default_value = "30")]
        timeout: u64,
        /// Seconds to hold the lock
        #[arg(long, default_value = "0")]
        hold: u64,
    },
    /// Delete expired rows once
    Sweep {
        /// Maximum rows deleted per pass
        #[arg(long, default_value = "1000")]
        batch_size: usize,
    },
    /// Show or change a counter
    Counter {
        /// Counter key
        key: String,
        /// Amount to add (negative to subtract)
        #[arg(long, allow_hyphen_values = true)]
        add: Option<i64>,
        /// Expire the added entries after this many seconds
        #[arg(long, requires = "add")]
        expire_in: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let options = StorageOptions {
        schema_name: cli.schema,
        ..StorageOptions::default()
    };
    let storage = Storage::open(&cli.database, options)
        .await
        .with_context(|| format!("failed to open {}", cli.database.display()))?;

    match cli.command {
        Commands::Enqueue { queue, payload } => {
            commands::queue::enqueue(&storage, &queue, &payload, cli.output).await?;
        }
        Commands::Dequeue {
            queues,
            wait,
            ack,
            requeue,
        } => {
            let finish = if ack {
                commands::queue::Finish::Ack
            } else if requeue {
                commands::queue::Finish::Requeue
            } else {
                commands::queue::Finish::Leave
            };
            commands::queue::dequeue(&storage, &queues, wait, finish, cli.output).await?;
        }
        Commands::Queues => commands::queue::list(&storage, cli.output).await?,
        Commands::Lock {
            resource,
            timeout,
            hold,
        } => {
            commands::lock::run(&storage, &resource, timeout, hold, cli.output).await?;
        }
        Commands::Sweep { batch_size } => {
            commands::sweep::run(&storage, batch_size, cli.output).await?;
        }
        Commands::Counter {
            key,
            add,
            expire_in,
        } => {
            commands::counter::run(&storage, &key, add, expire_in, cli.output).await?;
        }
    }

    Ok(())
}
