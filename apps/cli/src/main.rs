//! Crucible CLI - run and inspect GPU training jobs.
//!
//! The `crucible` binary hosts the orchestrator worker and the orphan
//! sweeper, and gives operators a way to submit, inspect and requeue jobs
//! in the shared job database.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use commands::{estimate, jobs, sweeper, worker};

/// Crucible - prepaid fine-tuning on rented GPUs
#[derive(Parser, Debug)]
#[command(
    name = "crucible",
    author,
    version,
    about = "Crucible - training-job orchestration on rented GPUs",
    long_about = "Crucible claims queued fine-tuning jobs, charges them up front, rents a GPU,\n\
                  drives the training run to completion and always tears the instance down."
)]
struct Args {
    /// Config file (defaults to ./crucible.toml, then ~/.crucible/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Fmt, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Fmt,
    /// One JSON object per event, for log shipping
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator loop for the configured environment
    ///
    /// Processes one job at a time until SIGINT or SIGTERM. An in-flight job
    /// gets `shutdown_max_wait_secs` to finish before it is abandoned.
    Worker {
        /// Also run the orphan sweeper in this process
        #[arg(long)]
        with_sweeper: bool,
    },

    /// Audit the job store against the GPU provider
    ///
    /// Terminates instances still running for finished jobs and fails jobs
    /// whose heartbeat went stale.
    Sweeper {
        /// Run a single cycle, print its report and exit
        #[arg(long)]
        once: bool,
    },

    /// Estimate, check the balance and enqueue a new job
    Submit {
        /// Owning user
        #[arg(long)]
        user: String,

        /// Model family (e.g. flux-lora)
        #[arg(long)]
        family: String,

        /// Total optimizer steps
        #[arg(long)]
        steps: u64,

        /// Object-store URI of the dataset archive
        #[arg(long)]
        dataset_uri: String,

        /// Number of items in the dataset
        #[arg(long, default_value_t = 0)]
        dataset_size: u64,

        /// Target environment (defaults to the configured one)
        #[arg(long)]
        environment: Option<String>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the prepaid charge a job would take
    Estimate {
        /// Model family (e.g. flux-lora)
        #[arg(long)]
        family: String,

        /// Total optimizer steps
        #[arg(long)]
        steps: u64,

        /// Number of items in the dataset
        #[arg(long, default_value_t = 0)]
        dataset_size: u64,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one job
    Status {
        job_id: String,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// List jobs, newest first
    List {
        /// Only jobs in this status (queued, training, failed, ...)
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of jobs to show
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Enqueue a fresh copy of a failed job
    Requeue { job_id: String },
}

fn init_tracing(level: Option<&str>, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("crucible={}", level.unwrap_or("info")))
    });
    let registry = tracing_subscriber::registry().with(filter);
    // Logs go to stderr so JSON command output stays parseable.
    match format {
        LogFormat::Fmt => registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref(), args.log_format);

    let config = commands::load_config(args.config.as_deref())?;

    match args.command {
        Command::Worker { with_sweeper } => {
            worker::execute(config, with_sweeper).await?;
        }
        Command::Sweeper { once } => {
            sweeper::execute(&config, once).await?;
        }
        Command::Submit { user, family, steps, dataset_uri, dataset_size, environment, json } => {
            let request = crucible_training::JobRequest {
                user_id: user,
                environment: environment.unwrap_or_else(|| config.orchestrator.environment.clone()),
                model_family: family,
                total_steps: steps,
                dataset_uri,
                dataset_size,
            };
            jobs::submit(&config, request, json).await?;
        }
        Command::Estimate { family, steps, dataset_size, json } => {
            estimate::execute(&config, &family, steps, dataset_size, json)?;
        }
        Command::Status { job_id, json } => {
            jobs::status(&config, &job_id, json)?;
        }
        Command::List { status, limit, json } => {
            jobs::list(&config, status.as_deref(), limit, json)?;
        }
        Command::Requeue { job_id } => {
            jobs::requeue(&config, &job_id)?;
        }
    }

    Ok(())
}
