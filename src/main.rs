use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use fuel_sync::config;
use fuel_sync::connectivity::ConnectivityState;
use fuel_sync::interceptor::InterceptedRequest;
use fuel_sync::model::{FuelType, GasRecord};
use fuel_sync::service::{self, FuelLogService, VehicleList};
use fuel_sync::sync::SubmitOutcome;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate credentials against LubeLogger and remember them
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Forget stored credentials
    Logout,
    /// Record a fill-up; queued locally if it cannot be delivered
    Submit {
        #[arg(long)]
        vehicle_id: i64,
        /// ISO date, defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        odometer: f64,
        #[arg(long)]
        fuel_consumed: f64,
        #[arg(long)]
        cost: f64,
        #[arg(long, default_value = "SP95")]
        fuel_type: FuelType,
        /// Partial fill rather than fill-to-full
        #[arg(long)]
        partial: bool,
        #[arg(long)]
        missed_fuel_up: bool,
        #[arg(long)]
        notes: Option<String>,
        /// Treat the network as unreachable and queue directly
        #[arg(long)]
        offline: bool,
    },
    /// List records waiting to be synced
    Pending,
    /// Drain the pending queue once
    Sync,
    /// List vehicles, falling back to the cached snapshot
    Vehicles,
    /// Run a session: auto-sync plus host signals read from stdin
    /// (`online`, `offline`, `sync <tag>`, `drain`, `status`)
    Run,
    /// Request interceptor maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Debug, Subcommand)]
enum CacheAction {
    /// Precache the static manifest
    Install,
    /// Delete caches from previous versions
    Activate,
    /// Send one GET through the interceptor
    Fetch {
        url: String,
        #[arg(long)]
        navigate: bool,
    },
    /// Replay captured writes as if a background-sync signal fired
    Replay,
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

    match args.command {
        Command::Login { username, password } => {
            if service.login(&username, &password).await? {
                println!("Logged in as {}", username);
            } else {
                bail!("LubeLogger rejected the credentials");
            }
        }
        Command::Logout => {
            service.logout().await?;
            println!("Logged out");
        }
        Command::Submit {
            vehicle_id,
            date,
            odometer,
            fuel_consumed,
            cost,
            fuel_type,
            partial,
            missed_fuel_up,
            notes,
            offline,
        } => {
            if offline {
                service.on_connectivity_change(ConnectivityState::Offline);
            } else if !service.resume_session().await? {
                warn!("no stored credentials; delivery will likely fail");
            }
            let record = GasRecord {
                date: date.unwrap_or_else(|| Local::now().date_naive()),
                odometer,
                fuel_consumed,
                cost,
                is_fill_to_full: !partial,
                missed_fuel_up,
                fuel_type,
                notes,
            };
            match service.submit(vehicle_id, record).await? {
                SubmitOutcome::Delivered => println!("Delivered"),
                SubmitOutcome::QueuedOffline { id } => {
                    println!("Log saved offline (#{}). Will sync when connection is restored.", id)
                }
            }
        }
        Command::Pending => {
            let pending = service.pending().await?;
            println!("{} pending", pending.len());
            for rec in pending {
                println!(
                    "  #{} vehicle={} date={} odometer={} fuel={} cost={} type={} queued_at={}",
                    rec.id,
                    rec.payload.vehicle_id,
                    rec.payload.record.date,
                    rec.payload.record.odometer,
                    rec.payload.record.fuel_consumed,
                    rec.payload.record.cost,
                    rec.payload.record.fuel_type,
                    rec.enqueued_at.to_rfc3339()
                );
            }
        }
        Command::Sync => {
            if !service.resume_session().await? {
                bail!("not logged in");
            }
            let report = service.sync_now().await?;
            let remaining = service.pending_count().await?;
            println!(
                "Synced {} of {} ({} failed), {} still pending",
                report.delivered, report.attempted, report.failed, remaining
            );
        }
        Command::Vehicles => {
            service.resume_session().await?;
            let list = service.load_vehicles().await?;
            if let VehicleList::Cached(snapshot) = &list {
                println!("(offline: cached at {})", snapshot.timestamp.to_rfc3339());
            }
            for v in list.vehicles() {
                println!("  {:>4}  {}", v.id, v.display_name());
            }
        }
        Command::Run => run_session(&service).await?,
        Command::Cache { action } => {
            let interceptor = service
                .interceptor()
                .context("no request interceptor configured")?;
            match action {
                CacheAction::Install => {
                    let n = interceptor.install().await?;
                    println!("Precached {} assets", n);
                }
                CacheAction::Activate => {
                    let deleted = interceptor.activate().await?;
                    println!("Deleted {} stale caches", deleted.len());
                }
                CacheAction::Fetch { url, navigate } => {
                    let url = Url::parse(&url).context("invalid url")?;
                    let request = if navigate {
                        InterceptedRequest::navigate(url)
                    } else {
                        InterceptedRequest::get(url)
                    };
                    match interceptor.handle(&request).await? {
                        Some(res) => {
                            println!("{} ({} bytes)", res.status, res.body.len());
                            println!("{}", String::from_utf8_lossy(&res.body));
                        }
                        None => println!("no response"),
                    }
                }
                CacheAction::Replay => {
                    let tag = interceptor.rules().sync_tag.clone();
                    let report = service.on_background_sync_signal(&tag).await?;
                    println!(
                        "Replayed {} of {} captured writes",
                        report.replayed, report.attempted
                    );
                }
            }
        }
    }

    Ok(())
}

async fn run_session(service: &FuelLogService) -> Result<()> {
    if !service.restore_session().await? {
        bail!("not logged in, or stored credentials were rejected");
    }
    service.on_session_start();
    info!("session started; reading host signals from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Err(err) = handle_signal(service, line.trim()).await {
                    error!(?err, "failed to handle host signal");
                }
            }
        }
    }

    service.on_session_end();
    info!("session ended");
    Ok(())
}

async fn handle_signal(service: &FuelLogService, line: &str) -> Result<()> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("online"), _) => service.on_connectivity_change(ConnectivityState::Online),
        (Some("offline"), _) => service.on_connectivity_change(ConnectivityState::Offline),
        (Some("sync"), Some(tag)) => {
            let report = service.on_background_sync_signal(tag).await?;
            println!("replayed {} of {}", report.replayed, report.attempted);
        }
        (Some("drain"), _) => {
            let report = service.sync_now().await?;
            println!("synced {} of {}", report.delivered, report.attempted);
        }
        (Some("status"), _) => {
            println!(
                "{}, {} pending",
                service.connectivity().state(),
                service.pending_count().await?
            );
        }
        (None, _) => {}
        (Some(other), _) => warn!(signal = other, "unknown host signal"),
    }
    Ok(())
}
