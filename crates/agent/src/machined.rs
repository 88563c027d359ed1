//! Client for the local OS management socket.
//!
//! machined listens on a Unix domain socket with plaintext gRPC; the
//! channel is built with a connector that dials the socket path and ignores
//! the placeholder URI authority.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::Service;

use talos_auto_bootstrap_proto::proto::machine_service_client::MachineServiceClient;
use talos_auto_bootstrap_proto::proto::{BootstrapRequest, EtcdMemberListRequest, VersionRequest};

/// Path of the machined Unix socket.
pub const MACHINE_SOCKET: &str = "/system/run/machined/machine.sock";

/// Timeout for membership queries. Short so that a not-yet-running etcd does
/// not stall the control loop.
const MEMBER_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected client for the local management socket.
#[derive(Clone)]
pub struct MachinedClient {
    channel: Channel,
}

impl MachinedClient {
    /// Connect to machined at the given socket path.
    pub async fn connect(socket: impl AsRef<Path>) -> Result<Self, tonic::transport::Error> {
        let path = Arc::new(socket.as_ref().to_path_buf());

        // The URI is a placeholder; the connector dials the socket path.
        let channel = Endpoint::from_static("http://machined")
            .connect_with_connector(UdsConnector { path })
            .await?;

        Ok(Self { channel })
    }

    fn machine(&self) -> MachineServiceClient<Channel> {
        MachineServiceClient::new(self.channel.clone())
    }

    /// Whether the cluster consensus layer already has members.
    ///
    /// Any RPC failure means etcd is not running, which callers treat as
    /// "not bootstrapped".
    pub async fn is_cluster_bootstrapped(&self) -> bool {
        let response = tokio::time::timeout(
            MEMBER_LIST_TIMEOUT,
            self.machine().etcd_member_list(EtcdMemberListRequest {}),
        )
        .await;

        match response {
            Ok(Ok(members)) => members
                .into_inner()
                .messages
                .first()
                .is_some_and(|m| !m.members.is_empty()),
            _ => false,
        }
    }

    /// Issue the one-time cluster bootstrap RPC.
    pub async fn bootstrap(&self) -> Result<(), tonic::Status> {
        self.machine()
            .bootstrap(BootstrapRequest { recover_etcd: false, recover_skip_hash_check: false })
            .await
            .map(|_| ())
    }

    /// The local hostname as reported by machined, if available.
    pub async fn hostname(&self) -> Option<String> {
        let response = self.machine().version(VersionRequest {}).await.ok()?;

        response
            .into_inner()
            .messages
            .first()
            .and_then(|m| m.metadata.as_ref())
            .map(|m| m.hostname.clone())
    }
}

/// Connector dialing the machined Unix socket.
#[derive(Clone)]
struct UdsConnector {
    path: Arc<PathBuf>,
}

impl Service<Uri> for UdsConnector {
    type Response = TokioIo<UnixStream>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let path = self.path.clone();

        Box::pin(async move {
            let stream = UnixStream::connect(path.as_path()).await?;
            Ok(TokioIo::new(stream))
        })
    }
}
