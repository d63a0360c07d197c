//! CLI command definitions for jobforge.
//!
//! The `worker` command runs an autoscaling worker pool against a queue;
//! `health` and `stats` are operator inspection commands.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::pool::{WorkerPool, WorkerPoolConfig};
use crate::queue::JobQueue;
use crate::worker::JobEvent;

/// Distributed priority job queue with autoscaling workers.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Distributed priority job queue with autoscaling workers")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run an autoscaling worker pool until interrupted.
    Worker(WorkerArgs),

    /// Print the queue health report.
    Health(ConnectionArgs),

    /// Print current queue metrics and snapshot history.
    Stats(ConnectionArgs),
}

/// Connection options shared by all commands.
#[derive(Parser, Debug)]
pub struct ConnectionArgs {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Queue name, used as the Redis key prefix.
    #[arg(long, env = "QUEUE_NAME", default_value = "jobs")]
    pub queue: String,
}

/// Arguments for `jobforge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Minimum number of workers to keep running.
    #[arg(long, default_value = "1")]
    pub min_workers: usize,

    /// Maximum number of workers the pool may scale to.
    #[arg(long, default_value = "10")]
    pub max_workers: usize,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed CLI command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_pool(args).await,
        Commands::Health(args) => {
            let queue = JobQueue::connect(&args.redis_url, &args.queue).await?;
            let report = queue.check_health().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Stats(args) => {
            let queue = JobQueue::connect(&args.redis_url, &args.queue).await?;
            let metrics = queue.get_metrics().await?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(())
        }
    }
}

async fn run_worker_pool(args: WorkerArgs) -> anyhow::Result<()> {
    let queue =
        Arc::new(JobQueue::connect(&args.connection.redis_url, &args.connection.queue).await?);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                JobEvent::WorkerStarted { worker_id } => {
                    info!(worker_id = %worker_id, "worker started")
                }
                JobEvent::WorkerStopped { worker_id } => {
                    info!(worker_id = %worker_id, "worker stopped")
                }
                JobEvent::Started { worker_id, job_id } => {
                    info!(worker_id = %worker_id, job_id = %job_id, "job started")
                }
                JobEvent::Completed { worker_id, job_id } => {
                    info!(worker_id = %worker_id, job_id = %job_id, "job completed")
                }
                JobEvent::Failed {
                    worker_id,
                    job_id,
                    error,
                } => {
                    warn!(worker_id = %worker_id, job_id = %job_id, error = %error, "job failed")
                }
            }
        }
    });

    let config = WorkerPoolConfig::new(args.min_workers, args.max_workers);
    let mut pool = WorkerPool::new(config, Arc::clone(&queue), events_tx);
    pool.start().await?;

    info!(
        queue = %queue.name(),
        min_workers = args.min_workers,
        max_workers = args.max_workers,
        "worker pool running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    if let Err(e) = pool.shutdown().await {
        error!(error = %e, "worker pool shutdown was not clean");
    }
    Ok(())
}
