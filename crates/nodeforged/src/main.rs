//! nodeforged: the NodeForge daemon.
//!
//! `serve` opens the state store, resumes a deployment monitor for every
//! node that has not settled and runs the orphan sweeper until Ctrl-C.
//! The other subcommands read the store offline and must not run while
//! a daemon holds it.
//!
//! # Usage
//!
//! ```text
//! nodeforged --config /etc/nodeforge/nodeforge.toml serve
//! nodeforged --config /etc/nodeforge/nodeforge.toml history node-1
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use nodeforge::{ForgeConfig, Orchestrator, OrphanSweeper, StateStore};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nodeforged", about = "NodeForge bare-metal provisioning daemon")]
struct Cli {
    /// Configuration file. The built-in sample is used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitors and the orphan sweeper until interrupted.
    Serve,
    /// Print the deployment summary as JSON.
    Summary,
    /// Print the event history of a node as JSON.
    History { node: String },
    /// Print a bash script deleting what a node still has tracked.
    CleanupScript { node: String },
    /// Form a failed cluster again with its waiting members.
    RetryCluster { cluster: String },
    /// Print the sample configuration as TOML.
    SampleConfig,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nodeforge=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ForgeConfig> {
    match path {
        Some(path) => ForgeConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            warn!("no --config given, using the built-in sample configuration");
            Ok(ForgeConfig::sample())
        }
    }
}

fn open_orchestrator(config: ForgeConfig) -> anyhow::Result<Orchestrator> {
    std::fs::create_dir_all(&config.service.data_dir)
        .with_context(|| format!("creating {}", config.service.data_dir.display()))?;
    let db_path = config.service.data_dir.join("nodeforge.redb");
    let store = StateStore::open(&db_path)
        .with_context(|| format!("opening state store {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");
    Ok(Orchestrator::builder(store, config).build()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Command::SampleConfig = cli.command {
        print!("{}", ForgeConfig::sample().to_toml_string()?);
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let orchestrator = open_orchestrator(config)?;

    match cli.command {
        Command::Serve => serve(orchestrator).await,
        Command::Summary => {
            let summary = orchestrator.deployment_summary().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::History { node } => {
            let events = orchestrator.node_history(&node)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
        Command::CleanupScript { node } => {
            print!("{}", orchestrator.cleanup_script(&node)?);
            Ok(())
        }
        Command::RetryCluster { cluster } => {
            let cluster = orchestrator.retry_cluster(&cluster).await?;
            println!("{}", serde_json::to_string_pretty(&cluster)?);
            Ok(())
        }
        Command::SampleConfig => Ok(()),
    }
}

async fn serve(orchestrator: Orchestrator) -> anyhow::Result<()> {
    info!("NodeForge daemon starting");

    let resumed = orchestrator.resume().await?;
    info!(resumed, "deployment monitors running");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = OrphanSweeper::new(orchestrator.clone());
    let sweeper_handle = tokio::spawn(async move {
        sweeper.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = sweeper_handle.await;
    orchestrator.shutdown().await;

    info!("NodeForge daemon stopped");
    Ok(())
}
