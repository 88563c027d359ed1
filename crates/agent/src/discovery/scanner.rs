//! Subnet scanning for management API peers.
//!
//! Probes every host address in the local prefix concurrently, bounded by a
//! semaphore. A probe that fails in any way (closed port, timeout, TLS or
//! RPC error) simply means "no peer here" and is discarded; only cancellation
//! of the scan itself escapes as an error.

use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hyper_util::rt::TokioIo;
use ipnet::Ipv4Net;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::Service;
use tracing::debug;

use talos_auto_bootstrap_proto::proto::machine_service_client::MachineServiceClient;
use talos_auto_bootstrap_proto::proto::resource_service_client::ResourceServiceClient;
use talos_auto_bootstrap_proto::proto::{GetRequest, VersionRequest, VersionResponse};

use crate::credentials::CredentialBundle;
use crate::machined::MachinedClient;
use crate::shutdown;

use super::network::generate_hosts;

/// Default port of the peer management API.
pub const PEER_API_PORT: u16 = 50000;

/// Machine-type resource coordinates (namespace `config`).
const MACHINE_TYPE_NAMESPACE: &str = "config";
const MACHINE_TYPE_TYPE: &str = "MachineTypes.config.talos.dev";
const MACHINE_TYPE_ID: &str = "machine-type";

/// Machine-status resource coordinates (namespace `runtime`).
const MACHINE_STATUS_NAMESPACE: &str = "runtime";
const MACHINE_STATUS_TYPE: &str = "MachineStatuses.runtime.talos.dev";
const MACHINE_STATUS_ID: &str = "machine";

/// Machine type literal identifying consensus-layer participants.
const MACHINE_TYPE_CONTROLPLANE: &str = "controlplane";

/// A node discovered during network scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// The node's IPv4 address; identity within one election cycle.
    pub ip: Ipv4Addr,
    /// Whether this node participates in the consensus layer.
    pub is_control_plane: bool,
    /// Ordering key for leader election; oldest wins.
    pub creation_time: DateTime<Utc>,
    /// Advisory hostname, may be empty.
    pub hostname: String,
}

/// Scan error. Per-probe failures never surface; only cancellation does.
#[derive(Debug)]
pub enum ScanError {
    /// The scan was cancelled by process shutdown.
    Cancelled,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Cancelled => write!(f, "scan cancelled"),
        }
    }
}

impl std::error::Error for ScanError {}

/// Concurrent subnet scanner.
///
/// Borrows the process credential bundle at construction to build the probe
/// TLS configuration; the probe state is shared across tasks behind an Arc.
pub struct Scanner {
    prober: Arc<Prober>,
    concurrency: usize,
}

impl Scanner {
    /// Build a scanner from the process credentials.
    pub fn new(bundle: &CredentialBundle, timeout: Duration, concurrency: usize) -> Self {
        Self {
            prober: Arc::new(Prober {
                tls: Arc::new(probe_tls_config(bundle)),
                port: PEER_API_PORT,
                timeout,
            }),
            concurrency: concurrency.max(1),
        }
    }

    /// Override the peer API port. Intended for tests against loopback peers.
    pub fn with_port(mut self, port: u16) -> Self {
        let prober = Arc::make_mut(&mut self.prober);
        prober.port = port;
        self
    }

    /// Probe every host address in `cidr` except `local_ip`.
    ///
    /// At most `concurrency` probes are in flight at any instant and each
    /// probe's wall time is bounded by the scan timeout. Shutdown aborts all
    /// outstanding probes promptly.
    pub async fn scan(
        &self,
        cidr: Ipv4Net,
        local_ip: Ipv4Addr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<Node>, ScanError> {
        if *shutdown.borrow() {
            return Err(ScanError::Cancelled);
        }

        let targets: Vec<Ipv4Addr> =
            generate_hosts(cidr).into_iter().filter(|ip| *ip != local_ip).collect();
        debug!(cidr = %cidr, targets = targets.len(), "starting subnet scan");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let found = Arc::new(Mutex::new(Vec::new()));
        let mut probes = JoinSet::new();

        for ip in targets {
            let semaphore = semaphore.clone();
            let found = found.clone();
            let prober = self.prober.clone();

            probes.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if let Some(node) = prober.probe(ip).await {
                    debug!(
                        ip = %node.ip,
                        hostname = %node.hostname,
                        controlplane = node.is_control_plane,
                        "probe found peer"
                    );
                    found.lock().unwrap_or_else(|e| e.into_inner()).push(node);
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown::cancelled(&mut shutdown) => {
                    probes.abort_all();
                    return Err(ScanError::Cancelled);
                }
                joined = probes.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }

        let nodes = {
            let mut guard = found.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        Ok(nodes)
    }
}

/// Shared per-probe state: TLS configuration, target port and timeout.
#[derive(Clone)]
struct Prober {
    tls: Arc<rustls::ClientConfig>,
    port: u16,
    timeout: Duration,
}

impl Prober {
    /// Probe one candidate address. `None` means "no peer here".
    async fn probe(&self, ip: Ipv4Addr) -> Option<Node> {
        tokio::time::timeout(self.timeout, self.probe_inner(ip)).await.ok().flatten()
    }

    async fn probe_inner(&self, ip: Ipv4Addr) -> Option<Node> {
        let channel = self.connect(ip).await.ok()?;

        // A node that answers Version over our TLS client credential is a
        // management API peer; anything else is noise on the subnet.
        let mut machine = MachineServiceClient::new(channel.clone());
        let version = machine.version(VersionRequest {}).await.ok()?.into_inner();

        let mut resources = ResourceServiceClient::new(channel);
        let machine_type = resources
            .get(GetRequest {
                namespace: MACHINE_TYPE_NAMESPACE.to_string(),
                r#type: MACHINE_TYPE_TYPE.to_string(),
                id: MACHINE_TYPE_ID.to_string(),
            })
            .await
            .ok()?
            .into_inner();

        let is_control_plane = machine_type
            .messages
            .first()
            .is_some_and(|r| r.spec.trim() == MACHINE_TYPE_CONTROLPLANE);

        let hostname = version
            .messages
            .first()
            .and_then(|m| m.metadata.as_ref())
            .map(|m| m.hostname.clone())
            .unwrap_or_default();

        let creation_time = self.creation_time(&mut resources, &version).await;

        Some(Node { ip, is_control_plane, creation_time, hostname })
    }

    /// Derive the election ordering key for a peer.
    ///
    /// Preferred source: the machine-status resource confirming the peer has
    /// a known lifecycle stage, combined with the version build timestamp.
    /// Falls back to wall-clock time, which weakens tie determinism; the IP
    /// tie-break still applies.
    async fn creation_time(
        &self,
        resources: &mut ResourceServiceClient<Channel>,
        version: &VersionResponse,
    ) -> DateTime<Utc> {
        let status = resources
            .get(GetRequest {
                namespace: MACHINE_STATUS_NAMESPACE.to_string(),
                r#type: MACHINE_STATUS_TYPE.to_string(),
                id: MACHINE_STATUS_ID.to_string(),
            })
            .await;

        if let Ok(status) = status {
            let stage_known = status
                .into_inner()
                .messages
                .first()
                .is_some_and(|r| !r.spec.trim().is_empty() && r.spec.trim() != "unknown");

            if stage_known
                && let Some(built) = version.messages.first().and_then(|m| m.version.as_ref())
                && let Ok(parsed) = DateTime::parse_from_rfc3339(&built.built)
            {
                return parsed.with_timezone(&Utc);
            }
        }

        Utc::now()
    }

    async fn connect(&self, ip: Ipv4Addr) -> Result<Channel, tonic::transport::Error> {
        Endpoint::from_shared(format!("https://{}:{}", ip, self.port))?
            .connect_timeout(self.timeout)
            .connect_with_connector(ProbeConnector { tls: self.tls.clone() })
            .await
    }
}

/// Build the TLS client configuration used for probes.
///
/// Server certificate verification is deliberately skipped: the peer's
/// hostname is unknown during discovery and its server certificate is not in
/// any trust store yet. Authenticity is established by the RPCs succeeding
/// with our CA-signed client certificate.
#[allow(clippy::expect_used)]
fn probe_tls_config(bundle: &CredentialBundle) -> rustls::ClientConfig {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    // Safety: the ring provider supports the default protocol versions, and
    // the client credential was minted by this process moments ago. Neither
    // failure is reachable with a well-formed bundle.
    let mut config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .expect("ring provider supports default protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureServerVerifier { provider }))
        .with_client_auth_cert(vec![bundle.client_certificate().clone()], bundle.client_key())
        .expect("freshly minted client credential is consistent");

    config.alpn_protocols = vec![b"h2".to_vec()];
    config
}

/// Accepts any server certificate while still validating handshake
/// signatures. Only used for discovery probes.
#[derive(Debug)]
struct InsecureServerVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Connector dialing a TCP+TLS stream for the probe channel.
#[derive(Clone)]
struct ProbeConnector {
    tls: Arc<rustls::ClientConfig>,
}

impl Service<Uri> for ProbeConnector {
    type Response = TokioIo<tokio_rustls::client::TlsStream<TcpStream>>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls = self.tls.clone();

        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing host in URI"))?
                .to_string();
            let port = uri.port_u16().unwrap_or(PEER_API_PORT);

            let stream = TcpStream::connect((host.as_str(), port)).await?;

            let server_name = ServerName::try_from(host)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let tls_stream =
                tokio_rustls::TlsConnector::from(tls).connect(server_name, stream).await?;

            Ok(TokioIo::new(tls_stream))
        })
    }
}

/// Build the local node's election entry.
///
/// Hostname comes from the local management socket, falling back to
/// `/etc/hostname` and then the kernel hostname. The creation time is the
/// system boot time from `/proc/stat`. The control plane flag is set
/// unconditionally: only control plane nodes run the election at all.
pub async fn local_node_info(machined: &MachinedClient, local_ip: Ipv4Addr) -> Node {
    let hostname = match machined.hostname().await {
        Some(hostname) if !hostname.is_empty() => hostname,
        _ => local_hostname_fallback(),
    };

    Node { ip: local_ip, is_control_plane: true, creation_time: boot_time(), hostname }
}

fn local_hostname_fallback() -> String {
    if let Ok(contents) = std::fs::read_to_string("/etc/hostname")
        && !contents.trim().is_empty()
    {
        return contents.trim().to_string();
    }

    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

/// System boot time from `/proc/stat`, falling back to the current time.
fn boot_time() -> DateTime<Utc> {
    std::fs::read_to_string("/proc/stat")
        .ok()
        .and_then(|stat| parse_boot_time(&stat))
        .unwrap_or_else(Utc::now)
}

/// Extract the `btime` line (seconds since the Unix epoch) from `/proc/stat`.
fn parse_boot_time(stat: &str) -> Option<DateTime<Utc>> {
    for line in stat.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            let seconds: i64 = rest.trim().parse().ok()?;
            return DateTime::from_timestamp(seconds, 0);
        }
    }

    None
}
