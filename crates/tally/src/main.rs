//! # Tally - captcha provider engine
//!
//! Runs the provider's recurring work against the commitment store:
//! exporting unstored commitments to an external sink and resolving
//! unsolved dataset captchas by majority vote.
//!
//! ## Architecture
//! ```text
//! dataset file → Ingestor → Redis (dataset, commitments, task history)
//!                               ↓                 ↓
//!                     RecalculateSolutions   StoreCommitmentsExternal → sink
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tally_common::TaskName;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod consensus;
mod dataset;
mod routes;
mod scheduler;
mod sink;
mod state;
mod store;
mod tasks;
#[cfg(test)]
mod testing;

use config::AppConfig;
use state::AppState;

/// Tally - scheduled commitment export and captcha solution consensus
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/tally.toml")]
    config: String,

    /// Redis URL (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// External sink URI (overrides config)
    #[arg(long, env = "EXTERNAL_SINK_URI")]
    external_sink_uri: Option<String>,

    /// Use the in-memory store instead of Redis
    #[arg(long, default_value = "false")]
    memory_store: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the task scheduler and ops endpoints (default)
    Serve,

    /// Run one task now and print its result
    Run {
        /// export | recalculate | full task name
        #[arg(value_parser = parse_task)]
        task: TaskName,

        /// Current ledger height for the consensus recency window
        /// (recalculate only)
        #[arg(long)]
        block: Option<u64>,
    },

    /// Provider dataset management
    Dataset {
        #[command(subcommand)]
        action: DatasetCommand,
    },

    /// Print recent runs of a task
    History {
        #[arg(value_parser = parse_task)]
        task: TaskName,

        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum DatasetCommand {
    /// Validate a JSON dataset file and make it the provider dataset
    Load { path: PathBuf },
}

fn parse_task(s: &str) -> Result<TaskName, String> {
    match s {
        "export" => Ok(TaskName::StoreCommitmentsExternal),
        "recalculate" => Ok(TaskName::RecalculateSolutions),
        other => other.parse().map_err(|e: tally_common::TallyError| e.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🧮 Starting Tally v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    info!("📋 Configuration loaded from {}", args.config);

    let state = AppState::new(config).await?;
    match &state.export {
        Some(export) => info!("📦 External sink: {}", export.destination()),
        None => info!("📦 External sink not configured, export disabled"),
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state).await,
        Command::Run { task, block } => run_once(&state, task, block).await,
        Command::Dataset {
            action: DatasetCommand::Load { path },
        } => {
            let dataset = state
                .datasets
                .set_dataset_from_file(&path)
                .await
                .with_context(|| format!("Failed to load dataset from {}", path.display()))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "datasetId": dataset.dataset_id,
                    "datasetContentId": dataset.dataset_content_id,
                    "captchas": dataset.captchas.len(),
                }))?
            );
            Ok(())
        }
        Command::History { task, limit } => {
            for record in state.coordinator.history(task, limit).await? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
    }
}

async fn run_once(state: &AppState, task: TaskName, block: Option<u64>) -> Result<()> {
    let result = match (task, block) {
        (TaskName::RecalculateSolutions, Some(block)) => {
            serde_json::to_value(state.solutions.run(Some(block)).await?)?
        }
        (_, Some(_)) => {
            anyhow::bail!("--block only applies to {}", TaskName::RecalculateSolutions)
        }
        (_, None) => tasks::run_task(state, task).await?,
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn serve(state: AppState) -> Result<()> {
    // Create shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Spawn one worker per scheduled task
    let workers = scheduler::spawn_all(&state, &shutdown_tx);

    let listen_addr = state.config.listen_addr.clone();
    let app = routes::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {listen_addr}"))?;
    info!("🚀 Tally listening on {}", listen_addr);

    // Handle graceful shutdown
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("🛑 Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    // Let in-flight runs record their outcome
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Task worker panicked");
        }
    }

    info!("👋 Tally shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
