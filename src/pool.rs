//! Node Pool
//!
//! Owns the set of task-distribution worker nodes and their cached health.
//! The pool is an explicit state object constructed with the orchestrator
//! and injected where needed, never a process-wide singleton, so tests
//! get isolated instances.
//!
//! Health probing runs on a background worker; request handling only reads
//! the cached status. Registration collapses logical duplicates: two URLs
//! that resolve to the same physical (host, port) are one node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use rand::Rng;

use crate::config::{DiscoveryConfig, HealthConfig, NodeEntry};
use crate::locality::{cidr_hosts, detect_local_cidr, host_of_url, HostResolver};
use crate::node::{NodeSnapshot, WorkerNode};

/// Registry of worker nodes with cached health
pub struct NodePool {
    nodes: DashMap<String, Arc<WorkerNode>>,
    resolver: HostResolver,
    health: HealthConfig,
    next_ordinal: AtomicU64,
}

impl NodePool {
    /// Create an empty pool
    #[must_use]
    pub fn new(health: HealthConfig) -> Self {
        Self {
            nodes: DashMap::new(),
            resolver: HostResolver::new(),
            health,
            next_ordinal: AtomicU64::new(0),
        }
    }

    /// Create a pool pre-populated from configuration entries
    #[must_use]
    pub fn from_entries(entries: &[NodeEntry], health: HealthConfig) -> Self {
        let pool = Self::new(health);
        for entry in entries {
            pool.add_node(entry.clone());
        }
        pool
    }

    /// Canonical registry key for a URL: physical identity plus port
    fn canonical_key(&self, url: &str) -> String {
        let host = host_of_url(url);
        let port = port_of_url(url);
        format!("{}:{}", self.resolver.resolve(host), port)
    }

    /// Register a node, collapsing physical duplicates
    ///
    /// `localhost:11434` after `127.0.0.1:11434` returns the already
    /// registered node instead of creating a second identity.
    pub fn add_node(&self, entry: NodeEntry) -> Arc<WorkerNode> {
        let key = self.canonical_key(&entry.url);
        if let Some(existing) = self.nodes.get(&key) {
            tracing::debug!(url = %entry.url, existing = %existing.url(), "node collapses to existing identity");
            return existing.clone();
        }

        let host = host_of_url(&entry.url).to_string();
        let physical = self.resolver.resolve(&host);
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(WorkerNode::new(
            entry.url.clone(),
            entry.name.clone(),
            entry.priority,
            ordinal,
            physical,
        ));

        // entry() re-checks under the shard lock in case of a concurrent add.
        let node = self.nodes.entry(key).or_insert(node).clone();
        tracing::info!(url = %entry.url, name = node.name(), "node registered");
        node
    }

    /// Remove a node by URL
    pub fn remove_node(&self, url: &str) -> bool {
        let key = self.canonical_key(url);
        self.nodes.remove(&key).is_some()
    }

    /// Look up a node by URL (through identity collapse)
    #[must_use]
    pub fn get(&self, url: &str) -> Option<Arc<WorkerNode>> {
        let key = self.canonical_key(url);
        self.nodes.get(&key).map(|n| n.clone())
    }

    /// All nodes in registration order
    #[must_use]
    pub fn all_nodes(&self) -> Vec<Arc<WorkerNode>> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by_key(|n| n.snapshot().ordinal);
        nodes
    }

    /// Nodes whose cached health is good, in registration order
    #[must_use]
    pub fn healthy_nodes(&self) -> Vec<Arc<WorkerNode>> {
        self.all_nodes()
            .into_iter()
            .filter(|n| n.is_healthy())
            .collect()
    }

    /// Snapshots of every node
    #[must_use]
    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.all_nodes().iter().map(|n| n.snapshot()).collect()
    }

    /// Number of registered nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the pool is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The host resolver used for identity collapse
    #[must_use]
    pub fn resolver(&self) -> &HostResolver {
        &self.resolver
    }

    /// Probe every node once and update the health cache
    pub async fn probe_all(&self) {
        let timeout = Duration::from_millis(self.health.probe_timeout_ms);
        let threshold = self.health.node_failure_threshold;

        let probes = self.all_nodes().into_iter().map(|node| async move {
            let report = node.client().probe(timeout).await;
            node.record_probe(report, threshold);
        });
        futures::future::join_all(probes).await;
    }

    /// Spawn the background health monitor
    ///
    /// Probes on the configured interval with a little jitter so a fleet of
    /// orchestrators doesn't probe in lockstep. Request handling never waits
    /// on this task.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let base = Duration::from_secs(pool.health.probe_interval_secs.max(1));
            loop {
                let jitter_ms = rand::thread_rng().gen_range(0..1_000);
                tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
                pool.probe_all().await;
            }
        })
    }

    /// Scan a subnet for worker nodes and register what answers
    ///
    /// Discovered nodes merge with explicit configuration; duplicates by
    /// physical identity collapse in [`NodePool::add_node`].
    pub async fn discover(&self, discovery: &DiscoveryConfig) -> Vec<Arc<WorkerNode>> {
        let cidr = if discovery.cidr.is_empty() {
            match detect_local_cidr() {
                Some(cidr) => cidr,
                None => {
                    tracing::warn!("could not detect local network; skipping node discovery");
                    return Vec::new();
                }
            }
        } else {
            discovery.cidr.clone()
        };

        let port = discovery.node_port;
        let timeout = Duration::from_millis(discovery.probe_timeout_ms);
        tracing::info!(%cidr, port, "scanning for worker nodes");

        let mut discovered = Vec::new();
        let probes = cidr_hosts(&cidr).into_iter().map(|ip| async move {
            let addr = std::net::SocketAddr::from((ip, port));
            let open = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            open.then_some(ip)
        });

        let results = futures::stream::iter(probes)
            .buffer_unordered(50)
            .collect::<Vec<_>>()
            .await;

        for ip in results.into_iter().flatten() {
            let url = format!("http://{ip}:{port}");
            let node = self.add_node(NodeEntry::new(&url));
            // Confirm it actually speaks the node API before trusting it.
            let report = node
                .client()
                .probe(Duration::from_millis(self.health.probe_timeout_ms))
                .await;
            if report.is_some() {
                node.record_probe(report, self.health.node_failure_threshold);
                discovered.push(node);
            } else {
                self.remove_node(&url);
            }
        }

        tracing::info!(count = discovered.len(), "node discovery finished");
        discovered
    }
}

fn port_of_url(url: &str) -> u16 {
    let trimmed = url
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let trimmed = trimmed.split('/').next().unwrap_or(trimmed);
    trimmed
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(11434)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_of_url() {
        assert_eq!(port_of_url("http://10.0.0.5:11434"), 11434);
        assert_eq!(port_of_url("http://10.0.0.5:8080/x"), 8080);
        assert_eq!(port_of_url("10.0.0.5"), 11434);
    }

    #[test]
    fn test_loopback_duplicate_collapses() {
        let pool = NodePool::new(HealthConfig::default());
        let a = pool.add_node(NodeEntry::new("http://localhost:11434"));
        let b = pool.add_node(NodeEntry::new("http://127.0.0.1:11434"));

        assert_eq!(pool.len(), 1);
        assert_eq!(a.url(), b.url());
    }

    #[test]
    fn test_different_ports_stay_distinct() {
        let pool = NodePool::new(HealthConfig::default());
        pool.add_node(NodeEntry::new("http://localhost:11434"));
        pool.add_node(NodeEntry::new("http://localhost:11435"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_healthy_nodes_in_registration_order() {
        let pool = NodePool::new(HealthConfig::default());
        pool.add_node(NodeEntry::new("http://10.0.0.1:11434"));
        pool.add_node(NodeEntry::new("http://10.0.0.2:11434"));
        pool.add_node(NodeEntry::new("http://10.0.0.3:11434"));

        let urls: Vec<_> = pool
            .healthy_nodes()
            .iter()
            .map(|n| n.url().to_string())
            .collect();
        assert_eq!(
            urls,
            vec![
                "http://10.0.0.1:11434",
                "http://10.0.0.2:11434",
                "http://10.0.0.3:11434"
            ]
        );
    }

    #[test]
    fn test_unhealthy_nodes_filtered() {
        let pool = NodePool::new(HealthConfig::default());
        let node = pool.add_node(NodeEntry::new("http://10.0.0.1:11434"));
        for _ in 0..3 {
            node.record_probe(None, 3);
        }
        assert!(pool.healthy_nodes().is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_remove_node_through_alias() {
        let pool = NodePool::new(HealthConfig::default());
        pool.add_node(NodeEntry::new("http://localhost:11434"));
        assert!(pool.remove_node("http://127.0.0.1:11434"));
        assert!(pool.is_empty());
    }
}
