use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use cronlite::config::{JobManifest, SchedulerConfig, WorkerPool};
use cronlite::node::Node;
use cronlite::scheduler::cron::{self, NextRun};
use cronlite::shutdown::install_shutdown_handler;
use cronlite::worker::ProcessExecutor;

#[derive(Parser, Debug)]
#[command(name = "cronlite")]
#[command(version)]
#[command(about = "A cron-driven job dispatcher with capability-matched workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler
    Server(ServerArgs),

    /// Inspect cron expressions
    Cron {
        /// Output format
        #[arg(long, short = 'o', default_value = "table", global = true)]
        output: OutputFormat,

        #[command(subcommand)]
        command: CronCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Scheduler settings (TOML); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker pool definition (TOML, [[worker]] tables). Defaults to the built-in pool
    #[arg(long)]
    workers: Option<PathBuf>,

    /// Jobs to create at startup (TOML, [[job]] tables)
    #[arg(long)]
    jobs: Option<PathBuf>,

    /// Seconds between dispatch ticks
    #[arg(long)]
    dispatch_interval_secs: Option<u64>,

    /// Seconds between worker health sweeps
    #[arg(long)]
    health_interval_secs: Option<u64>,

    /// Seconds without a ping before an idle worker goes offline
    #[arg(long)]
    worker_timeout_secs: Option<u64>,
}

#[derive(clap::Subcommand, Debug)]
enum CronCommands {
    /// Compute the next run of an expression
    Next {
        /// Five-field cron expression, e.g. "0 3 * * *"
        expr: String,

        /// Reference time (RFC 3339); defaults to now
        #[arg(long)]
        from: Option<DateTime<Utc>>,
    },
    /// Describe an expression in words
    Describe { expr: String },
    /// Check that an expression is well formed
    Validate { expr: String },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct NextRunOutput {
    expr: String,
    next_run: DateTime<Utc>,
    fallback: bool,
}

#[derive(Serialize)]
struct DescribeOutput {
    expr: String,
    description: String,
    valid: bool,
}

// =============================================================================
// Server Implementation
// =============================================================================

fn load_config(args: &ServerArgs) -> Result<SchedulerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => SchedulerConfig::default(),
    };
    if let Some(secs) = args.dispatch_interval_secs {
        config.dispatch_interval_ms = secs.saturating_mul(1000);
    }
    if let Some(secs) = args.health_interval_secs {
        config.health_interval_ms = secs.saturating_mul(1000);
    }
    if let Some(secs) = args.worker_timeout_secs {
        config.worker_timeout_ms = secs.saturating_mul(1000);
    }
    config.validate()?;
    Ok(config)
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(&args)?;
    let pool = match &args.workers {
        Some(path) => WorkerPool::load(path)?,
        None => WorkerPool::default(),
    };

    tracing::info!(
        workers = pool.workers.len(),
        dispatch_interval_ms = config.dispatch_interval_ms,
        health_interval_ms = config.health_interval_ms,
        worker_timeout_ms = config.worker_timeout_ms,
        "Starting cronlite"
    );

    let node = Node::new(config, pool, Arc::new(ProcessExecutor::new()))?;

    if let Some(path) = &args.jobs {
        let manifest = JobManifest::load(path)?;
        let created = node.service.load_manifest(manifest, Utc::now()).await?;
        tracing::info!(jobs = created.len(), path = %path.display(), "Loaded job manifest");
    }

    let shutdown = install_shutdown_handler();
    node.run(shutdown).await;
    Ok(())
}

// =============================================================================
// Cron Command Handlers
// =============================================================================

fn handle_cron(
    command: CronCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        CronCommands::Next { expr, from } => {
            if !cron::is_valid(&expr) {
                eprintln!("Error: invalid cron expression: {expr}");
                std::process::exit(1);
            }
            let next = cron::next_run(&expr, from.unwrap_or_else(Utc::now));
            match output {
                OutputFormat::Json => {
                    let out = NextRunOutput {
                        expr,
                        next_run: next.at(),
                        fallback: next.is_fallback(),
                    };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => {
                    println!("{:<12} {}", "NEXT RUN", next.at().to_rfc3339());
                    if let NextRun::Fallback(_) = next {
                        println!("Note: pattern not recognized, defaulting to one minute from now");
                    }
                }
            }
        }
        CronCommands::Describe { expr } | CronCommands::Validate { expr } => {
            let valid = cron::is_valid(&expr);
            let description = cron::describe(&expr);
            match output {
                OutputFormat::Json => {
                    let out = DescribeOutput {
                        expr,
                        description,
                        valid,
                    };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => {
                    println!("{:<12} {}", "VALID", valid);
                    println!("{:<12} {}", "DESCRIPTION", description);
                }
            }
            if !valid {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Cron { output, command } => handle_cron(command, &output),
    }
}
