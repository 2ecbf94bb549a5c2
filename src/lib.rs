//! Flotilla Core - Hybrid Cluster Orchestration for Local Inference
//!
//! This crate makes a heterogeneous, partially-healthy cluster of commodity
//! machines behave like one reliable inference endpoint. Per request it
//! decides between two structurally different execution strategies and
//! reconciles them under partial failure:
//!
//! - **Task distribution**: independent, complete-model requests spread
//!   across a pool of full-capacity worker nodes, chosen by a multi-factor
//!   adaptive load balancer.
//! - **Model sharding**: one large model's layers split across RPC
//!   backends, fronted by an ephemeral coordinator subprocess with a
//!   multi-minute cold start.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        HybridRouter                          |
//! |   path choice, single one-directional fallback, decisions    |
//! +------------------------+------------------+------------------+
//!                          |                  |
//!              +-----------v-----+   +--------v----------------+
//!              |  LoadBalancer   |   |  CoordinatorSupervisor  |
//!              |  score/select   |   |  spawn, coalesce, idle  |
//!              +--------+--------+   +--------+----------------+
//!                       |                     |
//!          +------------v---+      +----------v--------+
//!          |    NodePool    |      |  BackendRegistry  |
//!          |  health cache  |      |  3-state health   |
//!          +----------------+      +-------------------+
//!                       |                     |
//!                 worker nodes        coordinator subprocess
//!                 (HTTP API)          -> RPC backends (opaque)
//! ```
//!
//! # Key Types
//!
//! - [`HybridRouter`]: the single entry point; `route()` returns the
//!   response paired with a [`RoutingDecision`] for every request
//! - [`LoadBalancer`]: task-distribution node scoring and selection
//! - [`NodePool`]: worker registry with background health probing
//! - [`BackendRegistry`]: sharding backends with stale-tolerant health
//! - [`CoordinatorSupervisor`]: coordinator subprocess lifecycle
//! - [`PerformanceMemory`]: rolling history feeding adaptive estimates
//!
//! # Quick Start
//!
//! ```ignore
//! use flotilla_core::{ClusterConfig, HybridRouter, InferenceRequest, NodeEntry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = ClusterConfig::default();
//!     config.task_distribution_enabled = true;
//!     config.auto_fallback = true;
//!     config.nodes.push(NodeEntry::new("http://10.0.0.5:11434"));
//!
//!     let router = HybridRouter::new(&config);
//!     let request = InferenceRequest::prompt("llama3.2", "Hello!");
//!     let (result, decision) = router.route(&request, 5).await;
//!
//!     println!("routed via {} to {:?}", decision.path, decision.target);
//!     println!("{}", result.unwrap().content);
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`api`]: uniform request/response shapes shared by both paths
//! - [`analysis`]: pure request classification and model sizing
//! - [`locality`]: physical-host identity and the parallelism gate
//! - [`node`] / [`pool`]: worker nodes and their cached health
//! - [`memory`] / [`queue`] / [`balancer`]: the task-distribution path
//! - [`sharding`]: backend registry, weight resolution, coordinators
//! - [`router`]: the hybrid entry point
//! - [`metrics`]: counters/histograms and the background publisher
//! - [`config`] / [`error`]: configuration and typed errors
//! - [`logging`]: optional tracing-subscriber setup for hosts
//!
//! All registries are explicit state objects constructed with the router
//! and injected where needed; nothing lives in process-wide globals, so
//! tests get fully isolated instances.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod analysis;
pub mod api;
pub mod balancer;
pub mod config;
pub mod error;
pub mod locality;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod node;
pub mod pool;
pub mod queue;
pub mod router;
pub mod sharding;

// Re-exports for convenience
pub use analysis::{analyze_request, Complexity, ModelSpec, RequestProfile, TaskType};
pub use api::{ChatMessage, InferenceRequest, InferenceResponse, RoutePath};
pub use balancer::{LoadBalancer, NodeDecision, ScoreBreakdown};
pub use config::{
    BackendEntry, ClusterConfig, ConfigError, CoordinatorConfig, DiscoveryConfig, HealthConfig,
    MetricsConfig, NodeEntry, ScoringWeights,
};
pub use error::{PathAttempt, RouteError};
pub use locality::{plan_parallelism, HostResolver, ParallelismPlan, PhysicalHostId};
pub use memory::{PerformanceMemory, PerformanceRecord};
pub use metrics::{ClusterMetrics, MetricsSink, MetricsSnapshot, TracingSink};
pub use node::{NodeClient, NodeSnapshot, WorkerNode};
pub use pool::NodePool;
pub use queue::RequestQueue;
pub use router::{HybridRouter, RouterStats, RoutingDecision, ShardingEngine};
pub use sharding::{
    BackendHealth, BackendRegistry, Coordinator, CoordinatorLauncher, CoordinatorState,
    CoordinatorSupervisor, RpcBackend, WeightResolver,
};
