//! Auto-bootstrap agent binary.
//!
//! Runs as a platform extension on every node. Worker nodes exit
//! immediately; control plane nodes discover their subnet peers, elect a
//! bootstrap leader deterministically and issue the cluster bootstrap RPC
//! exactly once across the cluster.
//!
//! Configuration comes from `TALOS_AUTO_BOOTSTRAP_*` environment variables;
//! there are no command-line arguments. The process exits 0 on every
//! terminal state (worker node, already bootstrapped, raced by a peer,
//! bootstrap succeeded, shutdown signal) and non-zero on fatal credential or
//! configuration failures.

use std::io::IsTerminal;
use std::path::Path;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use talos_auto_bootstrap_agent::config::{Config, ConfigError};
use talos_auto_bootstrap_agent::coordinator::{self, Coordinator, CoordinatorError};
use talos_auto_bootstrap_agent::credentials::{self, CredentialsError};
use talos_auto_bootstrap_agent::discovery::Scanner;
use talos_auto_bootstrap_agent::machined;
use talos_auto_bootstrap_agent::shutdown;

/// Top-level error type for the agent binary.
#[derive(Debug)]
enum AgentError {
    Config(ConfigError),
    Credentials(CredentialsError),
    Coordinator(CoordinatorError),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Config(e) => write!(f, "config error: {}", e),
            AgentError::Credentials(e) => write!(f, "credentials error: {}", e),
            AgentError::Coordinator(e) => write!(f, "coordination error: {}", e),
        }
    }
}

impl std::error::Error for AgentError {}

#[tokio::main]
async fn main() -> Result<(), AgentError> {
    init_logging();

    info!(version = env!("CARGO_PKG_VERSION"), "starting talos-auto-bootstrap");

    let config = Config::load().map_err(AgentError::Config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    match run(config, shutdown_rx).await {
        Ok(()) => {
            info!("bootstrap service completed successfully");
            Ok(())
        },
        // A signal is a clean exit, not a failure
        Err(AgentError::Coordinator(CoordinatorError::Cancelled)) => {
            info!("shutdown requested, exiting");
            Ok(())
        },
        Err(e) => {
            tracing::error!(error = %e, "bootstrap service failed");
            Err(e)
        },
    }
}

async fn run(config: Config, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
    // Role gate: the etcd secrets directory only exists on control plane
    // nodes, so workers bail out before any peer traffic.
    if !coordinator::is_control_plane(Path::new(coordinator::ETCD_SECRETS_PATH)) {
        info!("worker node detected (no etcd secrets), exiting");
        return Ok(());
    }

    info!("control plane node detected, starting bootstrap process");

    let machined =
        coordinator::wait_for_machined(Path::new(machined::MACHINE_SOCKET), &mut shutdown)
            .await
            .map_err(AgentError::Coordinator)?;

    if machined.is_cluster_bootstrapped().await {
        info!("cluster already bootstrapped, exiting");
        return Ok(());
    }

    // Credentials are minted only once it is clear there is work to do;
    // failure here is fatal because peer probes cannot be authenticated.
    let bundle = credentials::acquire().map_err(AgentError::Credentials)?;
    let scanner = Scanner::new(&bundle, config.scan_timeout, config.scan_concurrency);

    let mut coordinator = Coordinator::new(machined, scanner, config, shutdown);
    coordinator.run().await.map_err(AgentError::Coordinator)
}

/// Initializes logging: human-readable on a terminal, JSON otherwise.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::io::stdout().is_terminal() {
        tracing_subscriber::registry().with(env_filter).with(fmt::layer()).init();
    } else {
        // JSON format for the host log collector
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .init();
    }
}
