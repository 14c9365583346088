use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use shuttle_core::domain::TaskState;

mod commands;

#[derive(Parser)]
#[command(name = "shuttle")]
#[command(about = "Task dispatch and worker activation", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store directory (overrides `store.root`)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a pending task for a worker
    Create {
        worker: String,
        /// Payload text
        payload: String,
    },
    /// Show one task
    Get { task_id: String },
    /// List tasks, oldest first
    List {
        #[arg(long)]
        worker: Option<String>,
        /// pending, processing, completed, failed or dead_lettered
        #[arg(long)]
        state: Option<TaskState>,
    },
    /// List dead-letter entries
    DeadLetters,
    /// Counts, heartbeats and dead letters
    Status,
    /// Run one orphan sweep against the persisted heartbeat snapshot
    Sweep,
    /// Move a failed task back to pending
    Retry { task_id: String },
    /// Delete a completed or dead-lettered task
    Purge { task_id: String },
    /// Run an in-process runtime with a sample worker
    Demo {
        #[arg(long, default_value_t = 5)]
        tasks: usize,
        /// Failures the sample handler reports before succeeding
        #[arg(long, default_value_t = 1)]
        failures: u32,
        /// Take the push transport down for the whole run
        #[arg(long)]
        no_push: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref(), cli.root)?;

    match cli.command {
        Commands::Create { worker, payload } => commands::create(config, &worker, payload).await?,
        Commands::Get { task_id } => commands::get(config, &task_id).await?,
        Commands::List { worker, state } => {
            commands::list(config, worker.as_deref(), state).await?
        }
        Commands::DeadLetters => commands::dead_letters(config).await?,
        Commands::Status => commands::status(config).await?,
        Commands::Sweep => commands::sweep(config).await?,
        Commands::Retry { task_id } => commands::retry(config, &task_id).await?,
        Commands::Purge { task_id } => commands::purge(config, &task_id).await?,
        Commands::Demo {
            tasks,
            failures,
            no_push,
        } => commands::demo(config, tasks, failures, no_push).await?,
    }

    Ok(())
}
