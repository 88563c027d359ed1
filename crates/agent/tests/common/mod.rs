//! Test harness: fake machined and fake management API peers.
//!
//! The fake implements the same gRPC services the real host OS exposes and
//! can be served either over a Unix socket (standing in for machined) or
//! over TLS TCP on a loopback address (standing in for a subnet peer).

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(clippy::disallowed_methods)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

use talos_auto_bootstrap_proto::proto::machine_service_server::{
    MachineService, MachineServiceServer,
};
use talos_auto_bootstrap_proto::proto::resource_service_server::{
    ResourceService, ResourceServiceServer,
};
use talos_auto_bootstrap_proto::proto::{
    Bootstrap, BootstrapRequest, BootstrapResponse, EtcdMember, EtcdMemberListRequest,
    EtcdMemberListResponse, EtcdMembers, GetRequest, GetResponse, Metadata, Resource, Version,
    VersionInfo, VersionRequest, VersionResponse,
};

use talos_auto_bootstrap_agent::credentials::CredentialBundle;

/// Mutable state backing a fake machine.
#[derive(Debug)]
pub struct MachineState {
    /// Number of etcd members reported; zero means "etcd not running".
    pub member_count: usize,
    /// Machine type literal returned for the machine-type resource.
    pub machine_type: String,
    /// Hostname in Version response metadata.
    pub hostname: String,
    /// Build timestamp in the Version response (RFC 3339).
    pub built: String,
    /// Lifecycle stage returned for the machine-status resource.
    pub stage: String,
    /// Number of Bootstrap RPCs received.
    pub bootstrap_calls: usize,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            member_count: 0,
            machine_type: "controlplane".to_string(),
            hostname: "test-node".to_string(),
            built: "2024-06-01T10:00:00Z".to_string(),
            stage: "running".to_string(),
            bootstrap_calls: 0,
        }
    }
}

/// Fake management API node.
#[derive(Clone)]
pub struct FakeMachine {
    pub state: Arc<Mutex<MachineState>>,
    /// Gauge of concurrent Version handlers, shared across peers in
    /// concurrency tests.
    pub in_flight: Arc<AtomicUsize>,
    /// High-water mark of `in_flight`.
    pub max_in_flight: Arc<AtomicUsize>,
}

impl FakeMachine {
    pub fn new(state: MachineState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Share the concurrency gauges of another fake, so a group of peers
    /// measures overlap collectively.
    pub fn with_gauges_of(mut self, other: &FakeMachine) -> Self {
        self.in_flight = other.in_flight.clone();
        self.max_in_flight = other.max_in_flight.clone();
        self
    }

    pub fn bootstrap_calls(&self) -> usize {
        self.state.lock().unwrap().bootstrap_calls
    }

    pub fn set_member_count(&self, count: usize) {
        self.state.lock().unwrap().member_count = count;
    }
}

#[tonic::async_trait]
impl MachineService for FakeMachine {
    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        // Hold the handler open briefly so overlapping probes are observable
        tokio::time::sleep(Duration::from_millis(25)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let (hostname, built) = {
            let state = self.state.lock().unwrap();
            (state.hostname.clone(), state.built.clone())
        };

        Ok(Response::new(VersionResponse {
            messages: vec![Version {
                metadata: Some(Metadata { hostname }),
                version: Some(VersionInfo {
                    tag: "v1.8.0".to_string(),
                    sha: "deadbeef".to_string(),
                    built,
                }),
            }],
        }))
    }

    async fn bootstrap(
        &self,
        request: Request<BootstrapRequest>,
    ) -> Result<Response<BootstrapResponse>, Status> {
        assert!(!request.into_inner().recover_etcd, "agent must not request etcd recovery");

        let mut state = self.state.lock().unwrap();
        state.bootstrap_calls += 1;
        // Bootstrap seeds the consensus layer with this node
        state.member_count = 1;

        Ok(Response::new(BootstrapResponse {
            messages: vec![Bootstrap { metadata: None }],
        }))
    }

    async fn etcd_member_list(
        &self,
        _request: Request<EtcdMemberListRequest>,
    ) -> Result<Response<EtcdMemberListResponse>, Status> {
        let state = self.state.lock().unwrap();

        if state.member_count == 0 {
            return Err(Status::unavailable("etcd is not running"));
        }

        let members = (0..state.member_count)
            .map(|i| EtcdMember {
                id: i as u64 + 1,
                hostname: format!("cp-{}", i),
                peer_urls: vec![],
                client_urls: vec![],
            })
            .collect();

        Ok(Response::new(EtcdMemberListResponse {
            messages: vec![EtcdMembers { metadata: None, members }],
        }))
    }
}

#[tonic::async_trait]
impl ResourceService for FakeMachine {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let request = request.into_inner();
        let state = self.state.lock().unwrap();

        let spec = match request.id.as_str() {
            "machine-type" => state.machine_type.clone(),
            "machine" => state.stage.clone(),
            other => return Err(Status::not_found(format!("resource {} not found", other))),
        };

        Ok(Response::new(GetResponse {
            messages: vec![Resource { metadata: None, spec }],
        }))
    }
}

/// Serve a fake machined over a Unix socket.
pub fn spawn_machined(fake: FakeMachine, socket: &Path) -> tokio::task::JoinHandle<()> {
    let listener = tokio::net::UnixListener::bind(socket).expect("bind unix socket");

    let incoming = async_stream::stream! {
        loop {
            yield listener.accept().await.map(|(stream, _addr)| stream);
        }
    };

    tokio::spawn(async move {
        Server::builder()
            .add_service(MachineServiceServer::new(fake.clone()))
            .add_service(ResourceServiceServer::new(fake))
            .serve_with_incoming(incoming)
            .await
            .expect("machined fake exited");
    })
}

/// Serve a fake peer over TLS on a loopback address.
///
/// The server presents a self-signed certificate; probes skip verification,
/// so no trust relationship is needed.
pub fn spawn_peer(fake: FakeMachine, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    let key = rcgen::KeyPair::generate().expect("generate server key");
    let mut params =
        rcgen::CertificateParams::new(vec![addr.ip().to_string()]).expect("server cert params");
    params.distinguished_name.push(rcgen::DnType::CommonName, addr.ip().to_string());
    let cert = params.self_signed(&key).expect("self-sign server cert");

    let identity = Identity::from_pem(cert.pem(), key.serialize_pem());
    let tls = ServerTlsConfig::new().identity(identity);

    tokio::spawn(async move {
        Server::builder()
            .tls_config(tls)
            .expect("server tls config")
            .add_service(MachineServiceServer::new(fake.clone()))
            .add_service(ResourceServiceServer::new(fake))
            .serve(addr)
            .await
            .expect("peer fake exited");
    })
}

/// Mint a credential bundle from a throwaway CA.
pub fn test_bundle() -> CredentialBundle {
    let ca_key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519).expect("generate CA key");
    let mut params = rcgen::CertificateParams::new(Vec::new()).expect("CA params");
    params.distinguished_name.push(rcgen::DnType::OrganizationName, "talos");
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_cert = params.self_signed(&ca_key).expect("self-sign CA");

    CredentialBundle::generate(
        &BASE64.encode(ca_cert.pem()),
        &BASE64.encode(ca_key.serialize_pem()),
    )
    .expect("generate bundle")
}
