use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use fuel_sync::config;
use fuel_sync::service;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Deliver all pending fuel records to LubeLogger and exit when the queue is empty"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Give up after this many drain rounds that leave records queued
    #[arg(long, default_value = "5")]
    max_rounds: u32,

    /// Seconds to wait between rounds
    #[arg(long, default_value = "10")]
    retry_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let service = service::build(&cfg).await?;
    if !service.resume_session().await? {
        bail!("not logged in; run `fuel-sync login` first");
    }

    let remaining = service.pending_count().await?;
    info!(remaining, "starting pending sync");
    if remaining == 0 {
        info!("No pending records, exiting");
        return Ok(());
    }

    let mut delivered_total = 0;
    for round in 1..=args.max_rounds {
        let report = service.sync_now().await?;
        delivered_total += report.delivered;
        let remaining = service.pending_count().await?;
        info!(
            round,
            delivered = report.delivered,
            failed = report.failed,
            remaining,
            "Sync progress"
        );
        if remaining == 0 {
            info!(total_delivered = delivered_total, "All pending records synced");
            return Ok(());
        }
        if round < args.max_rounds {
            tokio::time::sleep(Duration::from_secs(args.retry_secs)).await;
        }
    }

    let remaining = service.pending_count().await?;
    warn!(
        remaining,
        rounds = args.max_rounds,
        "Records still pending after the last round; they stay queued for the next run"
    );
    bail!("{} records could not be delivered", remaining)
}
