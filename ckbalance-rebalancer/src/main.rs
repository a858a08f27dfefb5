//! ckbalance
//!
//! Performs one rebalance pass over a single table and exits. Setup and
//! collection failures exit non-zero; failed moves are logged and reported.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ckbalance_rebalancer::{ClusterClient, Orchestrator, RebalancerConfig};

#[derive(Parser)]
#[command(name = "ckbalance")]
#[command(about = "Balance a table's partitions across ClickHouse nodes")]
struct Cli {
    /// Configuration file
    #[arg(long, env = "CKBALANCE_CONFIG", default_value = "ckbalance.toml")]
    config: PathBuf,

    /// Plan only, don't move any partition
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Write the JSON run report to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = RebalancerConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let dry_run = cli.dry_run || config.dry_run;

    info!(
        hosts = ?config.hosts,
        database = %config.database,
        table = %config.table,
        dry_run = dry_run,
        "Starting ckbalance"
    );

    let cluster = Arc::new(ClusterClient::connect(&config).await?);
    let report = Orchestrator::new(cluster).rebalance(dry_run).await?;

    for node in report.failed_nodes() {
        if let Some(e) = &node.error {
            warn!(host = %node.host, error = %e, "Node finished with errors");
        }
    }

    if let Some(path) = &cli.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("Rebalance aborted: {:#}", e);
        return Err(e);
    }

    Ok(())
}
