//! Cluster Configuration
//!
//! Structured configuration for the orchestration core: task-distribution
//! node URLs with optional priorities, model-sharding backend host:port
//! pairs, the two path-enable booleans, and the tunables the routing engine
//! exposes instead of hard-coding (scoring weights, coordinator policy).
//!
//! Loaded from TOML; a config constructed in code works the same way:
//! registries are built from it and injected, never read from globals.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Top-Level Configuration
// ============================================================================

/// Complete cluster configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Task-distribution worker nodes
    pub nodes: Vec<NodeEntry>,

    /// Model-sharding RPC backends
    pub rpc_backends: Vec<BackendEntry>,

    /// Whether the task-distribution path is enabled
    pub task_distribution_enabled: bool,

    /// Whether the model-sharding path is enabled
    pub model_sharding_enabled: bool,

    /// Attempt the other path once when the chosen path fails
    pub auto_fallback: bool,

    /// Node scoring weights
    pub scoring: ScoringWeights,

    /// Coordinator lifecycle settings
    pub coordinator: CoordinatorConfig,

    /// Subnet discovery settings
    pub discovery: DiscoveryConfig,

    /// Health probing and queueing tunables
    pub health: HealthConfig,

    /// Metrics publication settings
    pub metrics: MetricsConfig,
}

/// A configured worker node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Node URL (e.g., "http://10.0.0.5:11434")
    pub url: String,
    /// Optional friendly name
    pub name: Option<String>,
    /// Priority (higher = preferred), default 0
    #[serde(default)]
    pub priority: i32,
}

impl NodeEntry {
    /// Create an entry with just a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            priority: 0,
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A configured RPC backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEntry {
    /// Backend host
    pub host: String,
    /// Backend RPC port
    #[serde(default = "default_rpc_port")]
    pub port: u16,
}

fn default_rpc_port() -> u16 {
    50052
}

impl BackendEntry {
    /// Create an entry
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

// ============================================================================
// Scoring Weights
// ============================================================================

/// Multipliers for the node-scoring factors
///
/// The exact numeric weights are tunable rather than fixed: these defaults
/// order the factors performance > load > resources > priority alignment >
/// specialization, with health as a hard gate before scoring starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Weight on recent latency (lower latency scores higher)
    pub latency: f64,
    /// Weight on rolling success rate
    pub success_rate: f64,
    /// Penalty per in-flight request
    pub current_load: f64,
    /// Weight on free GPU memory vs. estimated need
    pub resources: f64,
    /// Extra pull toward historically fast nodes for high-priority work
    pub priority_alignment: f64,
    /// Bonus for the node with the best history for this task type
    pub specialization: f64,
    /// Weight on the node's configured priority
    pub node_priority: f64,
    /// Multiplier applied when a node is degraded vs. its own baseline
    pub degradation_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            latency: 30.0,
            success_rate: 25.0,
            current_load: 8.0,
            resources: 15.0,
            priority_alignment: 10.0,
            specialization: 12.0,
            node_priority: 2.0,
            degradation_penalty: 0.5,
        }
    }
}

// ============================================================================
// Coordinator Settings
// ============================================================================

/// Coordinator subprocess settings and lifecycle policy
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Host to bind coordinators to
    pub bind_host: String,
    /// First port to allocate coordinators on; subsequent coordinators
    /// take the next free slot
    pub base_port: u16,
    /// Coordinator binary name/path
    pub binary: String,
    /// GPU layers to offload
    pub gpu_layers: u32,
    /// Context window size
    pub ctx_size: u32,
    /// Base startup timeout in seconds
    pub startup_timeout_secs: u64,
    /// Additional startup seconds per billion parameters
    pub startup_secs_per_bparam: u64,
    /// Keep coordinators warm for repeated use of the same model
    pub keep_warm: bool,
    /// Idle time before an ephemeral coordinator is stopped, in seconds
    pub idle_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            base_port: 18080,
            binary: "llama-server".to_string(),
            gpu_layers: 99,
            ctx_size: 8192,
            startup_timeout_secs: 120,
            startup_secs_per_bparam: 2,
            keep_warm: false,
            idle_timeout_secs: 300,
        }
    }
}

impl CoordinatorConfig {
    /// Startup timeout scaled to model size
    ///
    /// Large models take minutes to distribute across backends; the
    /// timeout grows with parameter count.
    #[must_use]
    pub fn startup_timeout(&self, parameters_b: u32) -> Duration {
        Duration::from_secs(
            self.startup_timeout_secs + self.startup_secs_per_bparam * u64::from(parameters_b),
        )
    }

    /// Idle timeout as a [`Duration`]
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// ============================================================================
// Discovery / Health / Metrics
// ============================================================================

/// Subnet discovery settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Enable scanning for nodes and backends
    pub enabled: bool,
    /// CIDR range to scan (e.g., "192.168.1.0/24"); empty = autodetect
    pub cidr: String,
    /// Well-known worker node port
    pub node_port: u16,
    /// Well-known RPC backend port
    pub rpc_port: u16,
    /// Per-address connect timeout in milliseconds
    pub probe_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cidr: String::new(),
            node_port: 11434,
            rpc_port: 50052,
            probe_timeout_ms: 1_000,
        }
    }
}

/// Health probing and queueing tunables
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between background health probes, in seconds
    pub probe_interval_secs: u64,
    /// Per-probe timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Consecutive failures before a node leaves the candidate set
    pub node_failure_threshold: u32,
    /// How long a busy backend keeps its last good status, in seconds
    pub backend_stale_ttl_secs: u64,
    /// Maximum in-flight requests per node before queueing
    pub max_inflight_per_node: usize,
    /// How long a queued request waits before giving up, in seconds
    pub queue_wait_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            probe_timeout_ms: 3_000,
            node_failure_threshold: 3,
            backend_stale_ttl_secs: 300,
            max_inflight_per_node: 4,
            queue_wait_timeout_secs: 60,
        }
    }
}

impl HealthConfig {
    /// Stale TTL as a [`Duration`]
    #[must_use]
    pub fn backend_stale_ttl(&self) -> Duration {
        Duration::from_secs(self.backend_stale_ttl_secs)
    }

    /// Queue wait timeout as a [`Duration`]
    #[must_use]
    pub fn queue_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_wait_timeout_secs)
    }
}

/// Metrics publication settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the background publisher
    pub enabled: bool,
    /// Publication interval in seconds
    pub publish_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            publish_interval_secs: 30,
        }
    }
}

// ============================================================================
// Loading / Saving
// ============================================================================

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("config I/O error at {path}: {source}")]
    Io {
        /// Path involved
        path: String,
        /// Underlying error
        source: std::io::Error,
    },
    /// File contents were not valid TOML for [`ClusterConfig`]
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Config could not be serialized
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ClusterConfig {
    /// Load configuration from a TOML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Ok(toml::from_str(&text)?)
    }

    /// Save configuration to a TOML file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self)?;
        tokio::fs::write(path, text)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    /// Whether at least one execution path is enabled
    #[must_use]
    pub fn any_path_enabled(&self) -> bool {
        self.task_distribution_enabled || self.model_sharding_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert!(!config.any_path_enabled());
        assert_eq!(config.health.backend_stale_ttl_secs, 300);
        assert!(!config.coordinator.keep_warm);
    }

    #[test]
    fn test_startup_timeout_scales_with_size() {
        let config = CoordinatorConfig::default();
        let small = config.startup_timeout(8);
        let large = config.startup_timeout(405);
        assert!(large > small);
        assert!(large >= Duration::from_secs(120 + 2 * 405));
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
            task_distribution_enabled = true
            model_sharding_enabled = true
            auto_fallback = true

            [[nodes]]
            url = "http://10.0.0.5:11434"
            priority = 5

            [[rpc_backends]]
            host = "10.0.0.6"

            [coordinator]
            keep_warm = true
        "#;

        let config: ClusterConfig = toml::from_str(text).unwrap();
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].priority, 5);
        assert_eq!(config.rpc_backends[0].port, 50052);
        assert!(config.coordinator.keep_warm);
        assert!(config.auto_fallback);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");

        let mut config = ClusterConfig::default();
        config.task_distribution_enabled = true;
        config.nodes.push(NodeEntry::new("http://localhost:11434").with_priority(10));

        config.save(&path).await.unwrap();
        let loaded = ClusterConfig::load(&path).await.unwrap();

        assert!(loaded.task_distribution_enabled);
        assert_eq!(loaded.nodes[0].url, "http://localhost:11434");
        assert_eq!(loaded.nodes[0].priority, 10);
    }
}
