//! Network and peer discovery.
//!
//! Two layers: [`network`] snapshots the local host networking (primary
//! interface, prefix, default gateway), and [`scanner`] probes every host
//! address in that prefix for management API peers.

pub mod network;
pub mod scanner;

pub use network::{NetworkError, NetworkInfo, add_offset, generate_hosts, network_info};
pub use scanner::{Node, ScanError, Scanner, local_node_info};
