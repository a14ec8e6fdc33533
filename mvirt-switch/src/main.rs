use anyhow::Context;
use clap::{Parser, Subcommand};
use mvirt_switch::config::{SwitchConfig, Topology};
use mvirt_switch::control::Switch;
use mvirt_switch::traffic::{self, Traffic};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mvirt-switch", about = "Software Ethernet switch demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a topology and push traffic through it
    Run {
        /// Switch config (JSON); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Topology file (JSON); two ports on sw0 when omitted
        #[arg(long)]
        topology: Option<PathBuf>,

        /// Stop after this many seconds instead of waiting for a signal
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Validate a switch config file
    CheckConfig { path: PathBuf },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run {
            config,
            topology,
            duration,
        } => run(config, topology, duration).await,
        Command::CheckConfig { path } => check_config(path),
    };

    if let Err(e) = result {
        error!(error = %format!("{e:#}"), "Fatal");
        std::process::exit(1);
    }
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = SwitchConfig::load(&path)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    info!(
        path = %path.display(),
        max_bridges = config.max_bridges,
        max_ports = config.max_ports,
        batch_limit = config.batch_limit,
        "Config OK"
    );
    Ok(())
}

async fn run(
    config: Option<PathBuf>,
    topology: Option<PathBuf>,
    duration: Option<u64>,
) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => SwitchConfig::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SwitchConfig::default(),
    };
    let topology = match topology {
        Some(path) => Topology::load(&path)
            .with_context(|| format!("Failed to load topology {}", path.display()))?,
        None => Topology::default(),
    };

    let switch = Arc::new(Switch::new(config).context("Failed to create switch")?);
    let stations = traffic::build(&switch, &topology).context("Failed to build topology")?;
    info!(
        stations = stations.len(),
        bridges = switch.bridge_count(),
        "Topology ready"
    );

    let generators = Traffic::start(&stations, &topology).context("Failed to start traffic")?;

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut stats_tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = &mut deadline => {
                info!("Duration elapsed, shutting down...");
                break;
            }
            _ = stats_tick.tick() => log_stats(&switch),
        }
    }

    let counters = generators.counters();
    let (sent, received) = (
        counters.sent.load(Ordering::Relaxed),
        counters.received.load(Ordering::Relaxed),
    );
    generators.stop();
    log_stats(&switch);
    info!(sent, received, "Traffic stopped");
    Ok(())
}

fn log_stats(switch: &Switch) {
    for entry in switch.list_all() {
        info!(
            bridge = %entry.bridge,
            port = %entry.port,
            kind = entry.kind.as_str(),
            tx = entry.stats.tx_frames,
            rx = entry.stats.rx_frames,
            dropped = entry.stats.dropped,
            mismatch_drops = entry.stats.mismatch_drops,
            "Port stats"
        );
    }
}
