//! restwatch - activity accounting daemon
//!
//! Watches the user's input idleness, accumulates active time across several
//! tracking periods, and answers `status` queries on a local Unix socket.

mod config;
mod driver;
mod idle;
mod server;
mod status;
mod tracker;

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::driver::Daemon;
use crate::idle::IdleDetector;
use crate::server::{QueryServer, SocketEndpoint};
use crate::tracker::Tracker;

/// Application version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    // Parse command line arguments
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    // Load configuration
    let config = Config::load(config_path.as_deref())?;
    config.validate()?;

    // Initialize tracing
    init_tracing(&config.logging.level)?;

    info!("Starting restwatch v{}", VERSION);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(config))?;

    info!("restwatch shutdown complete");
    Ok(())
}

/// Run the driver loop until SIGINT or SIGTERM.
async fn run(config: Config) -> Result<()> {
    info!(
        "Configuration loaded: {} periods, tick={}ms, idle timeout={}ms",
        config.periods.len(),
        config.server.tick_ms,
        config.idle.timeout_ms
    );

    let mut idle_detector = IdleDetector::new(config.idle.timeout(), config.idle.check_interval())?;
    let mut activity_rx = idle_detector.subscribe()?;

    let endpoint = SocketEndpoint::bind(
        &config.server.socket_dir(),
        &config.server.socket_name,
        config.server.backlog,
    )?;
    let server = QueryServer::new(endpoint, config.server.max_clients, config.server.max_buffer);
    let mut daemon = Daemon::new(Tracker::new(config.periods.clone()), server);

    idle_detector.start()?;

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let mut interval = tokio::time::interval(config.server.tick());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Entering main loop");

    let mut monitor_lost = false;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                daemon.tick(Instant::now());
            }
            event = activity_rx.recv() => {
                match event {
                    Ok(event) => daemon.observe(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} activity transitions", missed);
                    }
                    Err(RecvError::Closed) => {
                        error!("Idle detector stopped reporting");
                        monitor_lost = true;
                        break;
                    }
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                break;
            }
        }
    }

    // Cleanup
    info!("Shutting down...");
    idle_detector.stop();
    daemon.shutdown();

    if monitor_lost {
        bail!("Idle detection failed, no activity can be accounted");
    }
    Ok(())
}

/// Initialize tracing subscriber with the given log level.
fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}
