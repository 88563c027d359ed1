//! Local network discovery.
//!
//! Snapshots the node's primary IPv4 interface and prefix via `getifaddrs`
//! and reads the default gateway from the kernel routing table. Also provides
//! the host enumeration primitives used by the scanner.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use nix::net::if_::InterfaceFlags;

/// Path to the kernel IPv4 routing table.
const PROC_NET_ROUTE: &str = "/proc/net/route";

/// Snapshot of the local host networking.
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    /// This node's IPv4 address.
    pub local_ip: Ipv4Addr,
    /// The network prefix covering `local_ip`, masked to the network address.
    pub cidr: Ipv4Net,
    /// Default gateway, when the routing table has a default route.
    pub gateway: Option<Ipv4Addr>,
    /// Name of the interface carrying `local_ip`.
    pub link_name: String,
}

/// Network discovery error.
#[derive(Debug)]
pub enum NetworkError {
    /// No up, non-loopback interface carries a usable IPv4 address.
    NoRoutableInterface,
    /// Interface enumeration failed.
    Interfaces(String),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::NoRoutableInterface => {
                write!(f, "no suitable network interface found")
            },
            NetworkError::Interfaces(msg) => {
                write!(f, "failed to enumerate interfaces: {}", msg)
            },
        }
    }
}

impl std::error::Error for NetworkError {}

/// Discover the primary network interface and its prefix.
///
/// Selects the first interface that is up, non-loopback and carries a
/// non-loopback, non-link-local IPv4 address. The enumeration order is
/// whatever the kernel reports, which is stable within one process.
/// A missing default gateway is not an error.
pub fn network_info() -> Result<NetworkInfo, NetworkError> {
    let addrs =
        nix::ifaddrs::getifaddrs().map_err(|e| NetworkError::Interfaces(e.to_string()))?;

    for ifaddr in addrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
            || ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }

        let Some(local_ip) =
            ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()).map(|s| s.ip())
        else {
            continue;
        };

        if local_ip.is_loopback() || local_ip.is_link_local() {
            continue;
        }

        let Some(netmask) = ifaddr.netmask.as_ref().and_then(|m| m.as_sockaddr_in()).map(|s| s.ip())
        else {
            continue;
        };

        let prefix_len = u32::from(netmask).count_ones() as u8;
        let Ok(net) = Ipv4Net::new(local_ip, prefix_len) else {
            continue;
        };

        return Ok(NetworkInfo {
            local_ip,
            cidr: net.trunc(),
            gateway: default_gateway(),
            link_name: ifaddr.interface_name,
        });
    }

    Err(NetworkError::NoRoutableInterface)
}

/// Read the default gateway from the kernel routing table.
fn default_gateway() -> Option<Ipv4Addr> {
    let table = std::fs::read_to_string(PROC_NET_ROUTE).ok()?;
    parse_default_gateway(&table)
}

/// Extract the default gateway from `/proc/net/route` contents.
///
/// The table is whitespace-separated with a header row; a row whose
/// destination (field 1) is `00000000` is a default route and its gateway
/// (field 2) is a little-endian hex IPv4 address.
fn parse_default_gateway(table: &str) -> Option<Ipv4Addr> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            continue;
        }

        if let Ok(gateway) = u32::from_str_radix(fields[2], 16) {
            return Some(Ipv4Addr::from(gateway.to_le_bytes()));
        }
    }

    None
}

/// Enumerate all host addresses in a prefix.
///
/// Excludes the network address (offset 0) and the broadcast address
/// (offset `2^hostbits - 1`). A prefix with fewer than two host bits yields
/// no addresses.
pub fn generate_hosts(cidr: Ipv4Net) -> Vec<Ipv4Addr> {
    let host_bits = 32 - u32::from(cidr.prefix_len());
    if host_bits < 2 {
        return Vec::new();
    }

    let num_hosts = 1u32 << host_bits;
    let network = cidr.network();

    (1..num_hosts - 1)
        .map(|offset| add_offset(network, offset))
        .filter(|ip| cidr.contains(ip))
        .collect()
}

/// Add an offset to an IPv4 address, carrying across octets.
pub fn add_offset(ip: Ipv4Addr, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(offset))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_hosts_class_c() {
        let cidr: Ipv4Net = "192.168.1.0/24".parse().unwrap();
        let hosts = generate_hosts(cidr);

        // 256 addresses minus network (0) and broadcast (255)
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn test_generate_hosts_slash_28() {
        let cidr: Ipv4Net = "10.0.0.0/28".parse().unwrap();
        let hosts = generate_hosts(cidr);

        assert_eq!(hosts.len(), 14);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(hosts[13], Ipv4Addr::new(10, 0, 0, 14));
    }

    #[test]
    fn test_generate_hosts_slash_30() {
        // Point-to-point link: exactly two usable hosts
        let cidr: Ipv4Net = "172.16.0.0/30".parse().unwrap();
        let hosts = generate_hosts(cidr);

        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0], Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(hosts[1], Ipv4Addr::new(172, 16, 0, 2));
    }

    #[test]
    fn test_generate_hosts_too_small() {
        let cidr: Ipv4Net = "172.16.0.0/31".parse().unwrap();
        assert!(generate_hosts(cidr).is_empty());

        let cidr: Ipv4Net = "172.16.0.1/32".parse().unwrap();
        assert!(generate_hosts(cidr).is_empty());
    }

    #[test]
    fn test_generate_hosts_all_contained() {
        let cidr: Ipv4Net = "10.1.2.0/26".parse().unwrap();
        let hosts = generate_hosts(cidr);

        assert_eq!(hosts.len(), 62);
        assert!(hosts.iter().all(|ip| cidr.contains(ip)));
        assert!(!hosts.contains(&cidr.network()));
        assert!(!hosts.contains(&cidr.broadcast()));
    }

    #[test]
    fn test_add_offset() {
        let cases = [
            ("192.168.1.0", 1, "192.168.1.1"),
            ("192.168.1.0", 254, "192.168.1.254"),
            // Carry into the next octet
            ("192.168.1.255", 1, "192.168.2.0"),
            ("10.0.0.5", 0, "10.0.0.5"),
        ];

        for (ip, offset, expected) in cases {
            let ip: Ipv4Addr = ip.parse().unwrap();
            let expected: Ipv4Addr = expected.parse().unwrap();
            assert_eq!(add_offset(ip, offset), expected, "{} + {}", ip, offset);
        }
    }

    const ROUTE_HEADER: &str =
        "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n";

    #[test]
    fn test_parse_default_gateway() {
        // 0x0101A8C0 little-endian is 192.168.1.1
        let table = format!(
            "{}eth0\t00000000\t0101A8C0\t0003\t0\t0\t0\t00000000\t0\t0\t0\n\
             eth0\t0001A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0\n",
            ROUTE_HEADER
        );

        let gateway = parse_default_gateway(&table);
        assert_eq!(gateway, Some(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_parse_default_gateway_no_default_route() {
        let table =
            format!("{}eth0\t0001A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0\n", ROUTE_HEADER);

        assert_eq!(parse_default_gateway(&table), None);
    }

    #[test]
    fn test_parse_default_gateway_empty_table() {
        assert_eq!(parse_default_gateway(""), None);
        assert_eq!(parse_default_gateway("Iface\tDestination\tGateway\n"), None);
    }

    #[test]
    fn test_network_info_consistency() {
        // Host-dependent: either there is a routable interface and the
        // invariants hold, or there is none at all.
        match network_info() {
            Ok(info) => {
                assert!(info.cidr.contains(&info.local_ip));
                assert!(!info.local_ip.is_loopback());
                assert!(!info.link_name.is_empty());
                assert_eq!(info.cidr.network(), info.cidr.addr());
            },
            Err(NetworkError::NoRoutableInterface) => {},
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
