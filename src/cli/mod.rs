//! Command-line interface for the taskswarm manager.
//!
//! This module provides the top-level CLI structure and subcommands for
//! running a standalone manager over a task-list file and for querying a
//! running manager's status endpoints.
//!
//! # Architecture
//!
//! The CLI is built using `clap` and follows a subcommand pattern:
//! - `run` - serve a manager: accept workers and dispatch a list of tasks
//! - `status` - fetch a status endpoint from a running manager
//!
//! # Examples
//!
//! ```bash
//! # Run every command in tasks.txt across connected workers
//! taskswarm run --port 9123 --tasks tasks.txt
//!
//! # Inspect a running manager
//! taskswarm status --address localhost:9123 --endpoint queue_status
//! ```
use crate::config::ManagerConfig;
use crate::core::manager::Manager;
use crate::core::task::Task;
use crate::error::SwarmError;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Main CLI application structure defining the top-level interface.
#[derive(Parser, Debug)]
#[command(name = "taskswarm")]
#[command(about = "Resource-aware distributed task queue manager")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a manager over a file of task commands
    Run(RunArgs),

    /// Query a running manager's status endpoints
    Status(StatusArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// File with one shell command per line; each becomes a task
    #[arg(long)]
    pub tasks: PathBuf,

    /// Configuration file (defaults to ~/.config/taskswarm/manager.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listening port (0 picks an ephemeral port)
    #[arg(long)]
    pub port: Option<u16>,

    /// Project name advertised to the catalog
    #[arg(long)]
    pub name: Option<String>,

    /// Scheduling policy: fcfs, files, time, worst-fit, random
    #[arg(long)]
    pub policy: Option<String>,

    /// File holding the shared worker password
    #[arg(long)]
    pub password_file: Option<PathBuf>,

    /// Append performance snapshots to this file
    #[arg(long)]
    pub stats_log: Option<PathBuf>,

    /// Append per-transition records to this file
    #[arg(long)]
    pub transaction_log: Option<PathBuf>,

    /// Category assigned to every submitted task
    #[arg(long, default_value = "default")]
    pub category: String,

    /// Retries per task before giving up (0 is unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_retries: u32,
}

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Manager address as host:port
    #[arg(long)]
    pub address: String,

    /// Endpoint to fetch: queue_status, task_status, worker_status,
    /// resources_status, wable_status
    #[arg(long, default_value = "queue_status")]
    pub endpoint: String,
}

/// Executes the taskswarm CLI with parsed arguments.
///
/// Routes parsed command-line arguments to their respective command
/// handlers and propagates errors up to `main` for exit-code handling.
pub async fn run() -> crate::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_manager(args).await,
        Commands::Status(args) => show_status(args).await,
    }
}

/// Serve a manager until every task from the list file has completed.
async fn run_manager(args: RunArgs) -> crate::Result<()> {
    let mut config = crate::config::load_config_from(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.manager.port = port;
    }
    if let Some(name) = &args.name {
        config.manager.name = Some(name.clone());
    }
    if let Some(policy) = &args.policy {
        config.scheduler.policy = policy.clone();
    }
    if args.password_file.is_some() {
        config.manager.password_file = args.password_file.clone();
    }
    if args.stats_log.is_some() {
        config.logs.stats_log = args.stats_log.clone();
    }
    if args.transaction_log.is_some() {
        config.logs.transaction_log = args.transaction_log.clone();
    }
    crate::config::validation::validate_config(&config).map_err(SwarmError::config)?;

    let commands = std::fs::read_to_string(&args.tasks)?;
    let mut manager = Manager::bind(config).await?;
    println!("taskswarm manager listening on port {}", manager.port());

    let mut submitted = 0usize;
    for line in commands.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let task = Task::new(line)
            .with_category(args.category.clone())
            .with_max_retries(args.max_retries);
        let id = manager.submit(task)?;
        log::info!("submitted task {}: {}", id, line);
        submitted += 1;
    }
    println!("submitted {} tasks; waiting for workers", submitted);

    let mut failed = 0usize;
    while !manager.empty() {
        if let Some(done) = manager.wait(Some(Duration::from_secs(5))).await {
            if done.succeeded() {
                println!("task {} done: {}", done.id, done.stdout().trim_end());
            } else {
                failed += 1;
                eprintln!(
                    "task {} failed ({}, exit {})",
                    done.id,
                    done.result.as_str(),
                    done.exit_code
                );
            }
        }
    }

    println!("{} tasks complete, {} failed", submitted, failed);
    if failed > 0 {
        return Err(SwarmError::manager(format!("{} tasks failed", failed)));
    }
    Ok(())
}

/// Fetch one status endpoint from a running manager and print it.
async fn show_status(args: StatusArgs) -> crate::Result<()> {
    let url = format!("http://{}/{}", args.address, args.endpoint);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let body: serde_json::Value = client.get(&url).send().await?.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args_parse() {
        let cli = Cli::parse_from([
            "taskswarm",
            "run",
            "--tasks",
            "tasks.txt",
            "--port",
            "9123",
            "--policy",
            "files",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.tasks, PathBuf::from("tasks.txt"));
                assert_eq!(args.port, Some(9123));
                assert_eq!(args.policy.as_deref(), Some("files"));
                assert_eq!(args.category, "default");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_status_args_default_endpoint() {
        let cli = Cli::parse_from(["taskswarm", "status", "--address", "localhost:9123"]);
        match cli.command {
            Commands::Status(args) => {
                assert_eq!(args.endpoint, "queue_status");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
