//! Physical Host Locality
//!
//! Two logical nodes can live on one physical machine: `localhost:11434`
//! and `127.0.0.1:11434` are the same Ollama instance, and a LAN address
//! of this machine is the same box again. Co-located inference tasks
//! contend for CPU cache and memory bandwidth, so naive parallelism across
//! them is slower than running sequentially. This module collapses aliases
//! to a canonical identity and gates parallel execution on genuine
//! multi-host batches.

use std::net::{IpAddr, ToSocketAddrs, UdpSocket};

// ============================================================================
// Physical Host Identity
// ============================================================================

/// Canonical identity of the physical machine behind an address
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PhysicalHostId {
    /// This machine (loopback or its own LAN address)
    Local,
    /// A remote machine, keyed by resolved IP
    Remote(IpAddr),
    /// Unresolvable name, kept verbatim as a last resort
    Named(String),
}

impl std::fmt::Display for PhysicalHostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote(ip) => write!(f, "{ip}"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

/// Resolves host strings to physical identities
///
/// Detects this machine's own LAN address once at construction so that
/// `192.168.x.y:11434` pointing back at ourselves collapses with
/// `localhost:11434`.
#[derive(Clone, Debug)]
pub struct HostResolver {
    local_ip: Option<IpAddr>,
}

impl HostResolver {
    /// Create a resolver, detecting the local LAN address best-effort
    #[must_use]
    pub fn new() -> Self {
        Self {
            local_ip: detect_local_ip(),
        }
    }

    /// Create a resolver with a known local address (for tests)
    #[must_use]
    pub fn with_local_ip(local_ip: IpAddr) -> Self {
        Self {
            local_ip: Some(local_ip),
        }
    }

    /// Resolve a host string (`"localhost"`, `"127.0.0.1"`, a DNS name, or
    /// an IP) to its canonical physical identity
    #[must_use]
    pub fn resolve(&self, host: &str) -> PhysicalHostId {
        let ip = host
            .parse::<IpAddr>()
            .ok()
            .or_else(|| resolve_name(host));

        match ip {
            Some(ip) if ip.is_loopback() => PhysicalHostId::Local,
            Some(ip) if Some(ip) == self.local_ip => PhysicalHostId::Local,
            Some(ip) => PhysicalHostId::Remote(ip),
            None => PhysicalHostId::Named(host.to_string()),
        }
    }
}

impl Default for HostResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_name(host: &str) -> Option<IpAddr> {
    let addrs = (host, 0u16).to_socket_addrs().ok()?;
    let mut first = None;
    for addr in addrs {
        // Prefer IPv4 for stable identities across dual-stack hosts.
        if addr.is_ipv4() {
            return Some(addr.ip());
        }
        first.get_or_insert(addr.ip());
    }
    first
}

/// Detect this machine's outward-facing IP by routing-table lookup
///
/// The connect never sends a packet; it only asks the kernel which local
/// address would be used.
fn detect_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}

/// Detect the local /24 network in CIDR notation, best effort
///
/// Most home/office networks are /24; discovery uses this when no range is
/// configured.
#[must_use]
pub fn detect_local_cidr() -> Option<String> {
    match detect_local_ip()? {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            Some(format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]))
        }
        IpAddr::V6(_) => None,
    }
}

/// Expand an IPv4 CIDR range into its host addresses
///
/// Ranges wider than /16 are refused; scanning more than 65k addresses is
/// a configuration mistake, not a discovery strategy.
#[must_use]
pub fn cidr_hosts(cidr: &str) -> Vec<std::net::Ipv4Addr> {
    let Some((base, prefix)) = cidr.split_once('/') else {
        return Vec::new();
    };
    let Ok(base) = base.parse::<std::net::Ipv4Addr>() else {
        return Vec::new();
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return Vec::new();
    };
    if !(16..=30).contains(&prefix) {
        return Vec::new();
    }

    let mask = u32::MAX << (32 - prefix);
    let network = u32::from(base) & mask;
    let broadcast = network | !mask;

    ((network + 1)..broadcast)
        .map(std::net::Ipv4Addr::from)
        .collect()
}

/// Extract the host portion of a node URL
///
/// Accepts `http://host:port`, `host:port`, or a bare host.
#[must_use]
pub fn host_of_url(url: &str) -> &str {
    let trimmed = url
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let trimmed = trimmed.split('/').next().unwrap_or(trimmed);
    trimmed.rsplit_once(':').map_or(trimmed, |(host, _)| host)
}

// ============================================================================
// Parallelism Gate
// ============================================================================

/// Recommendation for executing a batch of operations
#[derive(Clone, Debug)]
pub struct ParallelismPlan {
    /// Whether parallel execution is recommended
    pub use_parallel: bool,
    /// Distinct physical hosts in the batch
    pub unique_hosts: usize,
    /// Batch size examined
    pub batch_size: usize,
    /// Why the recommendation was made
    pub reason: String,
}

/// Decide whether a batch of node targets should run in parallel
///
/// Parallel execution is recommended only when the batch is larger than one
/// and spans at least two distinct physical hosts.
#[must_use]
pub fn plan_parallelism<'a, I>(resolver: &HostResolver, hosts: I) -> ParallelismPlan
where
    I: IntoIterator<Item = &'a str>,
{
    let mut unique = std::collections::HashSet::new();
    let mut batch_size = 0usize;
    for host in hosts {
        batch_size += 1;
        unique.insert(resolver.resolve(host));
    }
    let unique_hosts = unique.len();

    if batch_size <= 1 {
        return ParallelismPlan {
            use_parallel: false,
            unique_hosts,
            batch_size,
            reason: "single-item batch runs sequentially".to_string(),
        };
    }

    if unique_hosts < 2 {
        return ParallelismPlan {
            use_parallel: false,
            unique_hosts,
            batch_size,
            reason: format!(
                "{batch_size} tasks resolve to one physical host; co-located \
                 inference contends for CPU cache and memory bandwidth, so \
                 sequential execution is faster"
            ),
        };
    }

    ParallelismPlan {
        use_parallel: true,
        unique_hosts,
        batch_size,
        reason: format!("{batch_size} tasks span {unique_hosts} physical hosts"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_aliases_collapse() {
        let resolver = HostResolver::new();
        let a = resolver.resolve("localhost");
        let b = resolver.resolve("127.0.0.1");
        assert_eq!(a, PhysicalHostId::Local);
        assert_eq!(a, b);
    }

    #[test]
    fn test_own_lan_address_collapses_to_local() {
        let resolver = HostResolver::with_local_ip("192.168.1.50".parse().unwrap());
        assert_eq!(resolver.resolve("192.168.1.50"), PhysicalHostId::Local);
        assert_ne!(resolver.resolve("192.168.1.51"), PhysicalHostId::Local);
    }

    #[test]
    fn test_host_of_url() {
        assert_eq!(host_of_url("http://10.0.0.5:11434"), "10.0.0.5");
        assert_eq!(host_of_url("localhost:11434"), "localhost");
        assert_eq!(host_of_url("10.0.0.5"), "10.0.0.5");
        assert_eq!(host_of_url("http://node-1:11434/api"), "node-1");
    }

    #[test]
    fn test_cidr_hosts() {
        let hosts = cidr_hosts("192.168.1.0/24");
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], "192.168.1.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(
            *hosts.last().unwrap(),
            "192.168.1.254".parse::<std::net::Ipv4Addr>().unwrap()
        );

        // Non-aligned base addresses normalize to their network.
        let hosts = cidr_hosts("10.0.0.57/30");
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0], "10.0.0.57".parse::<std::net::Ipv4Addr>().unwrap());

        assert!(cidr_hosts("not-a-range").is_empty());
        assert!(cidr_hosts("10.0.0.0/8").is_empty());
    }

    #[test]
    fn test_single_host_batch_runs_sequentially() {
        let resolver = HostResolver::new();
        let plan = plan_parallelism(&resolver, ["localhost", "127.0.0.1"]);
        assert!(!plan.use_parallel);
        assert_eq!(plan.unique_hosts, 1);
        assert!(plan.reason.contains("one physical host"));
    }

    #[test]
    fn test_multi_host_batch_runs_parallel() {
        let resolver = HostResolver::with_local_ip("192.168.1.50".parse().unwrap());
        let plan = plan_parallelism(&resolver, ["localhost", "192.168.1.60"]);
        assert!(plan.use_parallel);
        assert_eq!(plan.unique_hosts, 2);
    }

    #[test]
    fn test_singleton_batch_never_parallel() {
        let resolver = HostResolver::new();
        let plan = plan_parallelism(&resolver, ["10.0.0.1"]);
        assert!(!plan.use_parallel);
        assert_eq!(plan.batch_size, 1);
    }
}
