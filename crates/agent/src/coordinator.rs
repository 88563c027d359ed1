//! Bootstrap coordination.
//!
//! Drives the one-shot control loop: check whether the cluster already
//! exists, discover the local network and its peers, wait for quorum, run
//! the deterministic election and, on the leader, execute bootstrap behind a
//! grace delay and a final membership re-check. Every participant computes
//! the same leader from the same observation, so at-most-once execution
//! holds without any coordination channel.

use std::path::Path;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::discovery::{self, ScanError, Scanner};
use crate::election;
use crate::machined::MachinedClient;
use crate::shutdown;

/// Directory that the host OS populates only on control plane nodes.
///
/// Its presence is the role oracle: checking the filesystem avoids any peer
/// traffic from worker nodes.
pub const ETCD_SECRETS_PATH: &str = "/system/secrets/etcd";

/// Starting value for the retry backoff.
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Retry interval while waiting for the machined socket to appear.
const MACHINED_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// How often to poll for etcd members after issuing bootstrap.
const ETCD_READY_POLL: Duration = Duration::from_secs(5);

/// How long to wait for etcd to come up after bootstrap before the
/// iteration is considered failed.
const ETCD_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Coordination error.
#[derive(Debug)]
pub enum CoordinatorError {
    /// The process received a shutdown signal.
    Cancelled,
    /// The bootstrap RPC failed.
    Bootstrap(String),
    /// etcd did not report members within the post-bootstrap window.
    EtcdReadyTimeout,
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::Cancelled => write!(f, "cancelled by shutdown signal"),
            CoordinatorError::Bootstrap(msg) => write!(f, "bootstrap RPC failed: {}", msg),
            CoordinatorError::EtcdReadyTimeout => {
                write!(f, "etcd did not become ready after bootstrap")
            },
        }
    }
}

impl std::error::Error for CoordinatorError {}

/// Whether this node is a control plane node.
///
/// Filesystem-based check: the etcd secrets directory only exists on control
/// plane nodes.
pub fn is_control_plane(etcd_secrets: &Path) -> bool {
    etcd_secrets.is_dir()
}

/// Wait for the machined socket to become available, retrying every 5s.
pub async fn wait_for_machined(
    socket: &Path,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<MachinedClient, CoordinatorError> {
    loop {
        match MachinedClient::connect(socket).await {
            Ok(client) => {
                info!("connected to machined");
                return Ok(client);
            },
            Err(e) => {
                info!(socket = %socket.display(), error = %e, "waiting for machined socket");
            },
        }

        tokio::select! {
            _ = tokio::time::sleep(MACHINED_RETRY_INTERVAL) => {}
            _ = shutdown::cancelled(shutdown) => return Err(CoordinatorError::Cancelled),
        }
    }
}

/// The discovery/election/bootstrap control loop.
pub struct Coordinator {
    machined: MachinedClient,
    scanner: Scanner,
    config: Config,
    shutdown: watch::Receiver<bool>,
}

impl Coordinator {
    /// Build a coordinator over a connected machined client.
    pub fn new(
        machined: MachinedClient,
        scanner: Scanner,
        config: Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { machined, scanner, config, shutdown }
    }

    /// Run the loop until the cluster is bootstrapped or shutdown.
    ///
    /// Returns `Ok(())` on every terminal success: this node bootstrapped,
    /// another node did, or the cluster turned out to be bootstrapped
    /// already. Transient failures are absorbed with exponential backoff.
    pub async fn run(&mut self) -> Result<(), CoordinatorError> {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if *self.shutdown.borrow() {
                return Err(CoordinatorError::Cancelled);
            }

            if self.machined.is_cluster_bootstrapped().await {
                info!("cluster already bootstrapped");
                return Ok(());
            }

            let net = match discovery::network_info() {
                Ok(net) => net,
                Err(e) => {
                    warn!(error = %e, "failed to discover network, retrying");
                    self.sleep(backoff).await?;
                    backoff = next_backoff(backoff, self.config.max_backoff);
                    continue;
                },
            };

            info!(
                local_ip = %net.local_ip,
                cidr = %net.cidr,
                gateway = ?net.gateway,
                link = %net.link_name,
                "network discovered"
            );

            let peers = match self
                .scanner
                .scan(net.cidr, net.local_ip, self.shutdown.clone())
                .await
            {
                Ok(peers) => peers,
                Err(ScanError::Cancelled) => return Err(CoordinatorError::Cancelled),
            };

            info!(peers_found = peers.len(), "peer discovery complete");
            for peer in &peers {
                debug!(
                    ip = %peer.ip,
                    hostname = %peer.hostname,
                    controlplane = peer.is_control_plane,
                    "discovered peer"
                );
            }

            let local = discovery::local_node_info(&self.machined, net.local_ip).await;

            let mut nodes = peers.clone();
            nodes.push(local.clone());

            if !election::quorum_reached(&nodes, self.config.quorum_nodes) {
                info!(
                    found = nodes.iter().filter(|n| n.is_control_plane).count(),
                    required = self.config.quorum_nodes,
                    decision = "wait_for_quorum",
                    "quorum not reached, waiting"
                );
                backoff = INITIAL_BACKOFF;
                self.sleep(self.config.scan_interval).await?;
                continue;
            }

            let result = election::elect_leader(&local, &peers);
            info!(
                leader = %result.leader.ip,
                leader_hostname = %result.leader.hostname,
                is_leader = result.is_leader,
                candidates = result.candidates.len(),
                "leader election complete"
            );

            if !result.is_leader {
                info!(decision = "follower_wait", "not elected as leader, waiting for bootstrap");
                backoff = INITIAL_BACKOFF;
                self.sleep(self.config.follower_check_interval).await?;
                continue;
            }

            info!(decision = "lead", "elected as leader, initiating bootstrap");
            match self.safe_bootstrap().await {
                Ok(()) => {
                    info!("bootstrap successful");
                    return Ok(());
                },
                Err(CoordinatorError::Cancelled) => return Err(CoordinatorError::Cancelled),
                Err(e) => {
                    error!(error = %e, "bootstrap failed, retrying");
                    self.sleep(backoff).await?;
                    backoff = next_backoff(backoff, self.config.max_backoff);
                },
            }
        }
    }

    /// Execute bootstrap with the race-closing safety sequence.
    ///
    /// Waits out the pre-bootstrap delay so peers that observed a different
    /// snapshot can finish their own election, then re-checks membership one
    /// final time before issuing the RPC. Returns `Ok(())` when another node
    /// won the race.
    pub async fn safe_bootstrap(&mut self) -> Result<(), CoordinatorError> {
        info!(delay = ?self.config.pre_bootstrap_delay, "waiting before bootstrap");
        self.sleep(self.config.pre_bootstrap_delay).await?;

        if self.machined.is_cluster_bootstrapped().await {
            info!(decision = "raced", "cluster was bootstrapped by another node");
            return Ok(());
        }

        info!("executing bootstrap");
        self.machined
            .bootstrap()
            .await
            .map_err(|e| CoordinatorError::Bootstrap(e.to_string()))?;

        info!("waiting for etcd to become ready");
        self.wait_for_etcd_ready().await
    }

    /// Poll membership until etcd reports at least one member.
    async fn wait_for_etcd_ready(&mut self) -> Result<(), CoordinatorError> {
        let deadline = Instant::now() + ETCD_READY_TIMEOUT;

        loop {
            if self.machined.is_cluster_bootstrapped().await {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(CoordinatorError::EtcdReadyTimeout);
            }

            self.sleep(ETCD_READY_POLL).await?;
        }
    }

    /// Cancellable sleep.
    async fn sleep(&mut self, duration: Duration) -> Result<(), CoordinatorError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = shutdown::cancelled(&mut self.shutdown) => Err(CoordinatorError::Cancelled),
        }
    }
}

/// Double the backoff, capped at the configured maximum.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
