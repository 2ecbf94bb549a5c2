//! Hybrid Router
//!
//! The single entry point for inference requests. Per request it chooses
//! between two structurally different execution strategies:
//!
//! - **Task distribution**: the whole request goes to one full-model
//!   worker node, selected by the intelligent load balancer.
//! - **Model sharding**: the model's layers are split across RPC backends
//!   behind an ephemeral coordinator subprocess.
//!
//! Path choice follows configuration first (a disabled path is never
//! touched, even if its machinery exists in memory), then model-size
//! heuristics. On failure the other path is tried at most once, one
//! direction only, never a ping-pong. Every request emits a
//! [`RoutingDecision`], failed ones included.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::analysis::{analyze_request, Complexity, ModelSpec, TaskType};
use crate::api::{InferenceRequest, InferenceResponse, RoutePath};
use crate::balancer::LoadBalancer;
use crate::config::ClusterConfig;
use crate::error::{PathAttempt, RouteError};
use crate::memory::PerformanceMemory;
use crate::metrics::ClusterMetrics;
use crate::pool::NodePool;
use crate::sharding::{BackendRegistry, CoordinatorSupervisor, WeightResolver};

// ============================================================================
// Routing Decision
// ============================================================================

/// Immutable record of how one request was routed
///
/// Emitted for every request. Failed requests carry the partial decision
/// data gathered before the failure.
#[derive(Clone, Debug, Serialize)]
pub struct RoutingDecision {
    /// Unique request id
    pub request_id: Uuid,
    /// Path that handled (or last attempted) the request
    pub path: RoutePath,
    /// Selected target (node URL or coordinator address), if selection
    /// got that far
    pub target: Option<String>,
    /// Classified task type
    pub task_type: TaskType,
    /// Classified complexity
    pub complexity: Complexity,
    /// Request priority (1-10)
    pub priority: u8,
    /// Composite score of the winning node (task distribution only)
    pub decision_score: Option<f64>,
    /// Why this route was chosen
    pub reasoning: String,
    /// Predicted duration at routing time
    pub estimated_duration_ms: Option<f64>,
    /// Observed duration, present on completed requests
    pub actual_duration_ms: Option<u64>,
    /// Whether the fallback path was used
    pub fallback_used: bool,
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
}

/// Aggregate routing statistics
#[derive(Clone, Debug, Serialize)]
pub struct RouterStats {
    /// Requests handled on the task-distribution path
    pub task_distribution_requests: u64,
    /// Requests handled on the model-sharding path
    pub model_sharding_requests: u64,
    /// Requests that used the fallback path
    pub fallbacks: u64,
    /// Requests that failed on every configured path
    pub total_failures: u64,
    /// Registered worker nodes
    pub nodes_total: usize,
    /// Worker nodes whose cached health is good
    pub nodes_healthy: usize,
    /// Registered RPC backends
    pub backends_total: usize,
    /// Backends eligible for new coordinators
    pub backends_available: usize,
    /// Tracked coordinators
    pub coordinators: usize,
    /// Coordinators currently able to serve
    pub coordinators_ready: usize,
    /// Requests parked on the priority queue
    pub queue_depth: usize,
}

/// The model-sharding half of the router
#[derive(Clone)]
pub struct ShardingEngine {
    /// Backend registry with stale-tolerant health
    pub registry: Arc<BackendRegistry>,
    /// Coordinator lifecycle owner
    pub supervisor: Arc<CoordinatorSupervisor>,
}

// ============================================================================
// Hybrid Router
// ============================================================================

/// Routes requests across task distribution and model sharding
pub struct HybridRouter {
    balancer: Option<Arc<LoadBalancer>>,
    sharding: Option<ShardingEngine>,
    auto_fallback: bool,
    metrics: Arc<ClusterMetrics>,
}

impl HybridRouter {
    /// Build a router and its component registries from configuration
    ///
    /// Machinery for a disabled path is simply not constructed, so a
    /// disabled path cannot be touched by any request.
    #[must_use]
    pub fn new(config: &ClusterConfig) -> Self {
        let metrics = Arc::new(ClusterMetrics::new());

        let balancer = config.task_distribution_enabled.then(|| {
            let pool = Arc::new(NodePool::from_entries(&config.nodes, config.health.clone()));
            Arc::new(LoadBalancer::new(
                pool,
                Arc::new(PerformanceMemory::new()),
                metrics.clone(),
                config.scoring.clone(),
                config.health.clone(),
            ))
        });

        let sharding = config.model_sharding_enabled.then(|| {
            let registry = Arc::new(BackendRegistry::from_entries(
                &config.rpc_backends,
                &config.health,
            ));
            let supervisor = Arc::new(CoordinatorSupervisor::new(
                registry.clone(),
                Arc::new(WeightResolver::default_store()),
                config.coordinator.clone(),
            ));
            ShardingEngine {
                registry,
                supervisor,
            }
        });

        Self {
            balancer,
            sharding,
            auto_fallback: config.auto_fallback,
            metrics,
        }
    }

    /// Build a router from pre-constructed components
    ///
    /// The injection seam used by tests and by embedders that share pools
    /// or registries across routers.
    #[must_use]
    pub fn with_components(
        balancer: Option<Arc<LoadBalancer>>,
        sharding: Option<ShardingEngine>,
        auto_fallback: bool,
        metrics: Arc<ClusterMetrics>,
    ) -> Self {
        Self {
            balancer,
            sharding,
            auto_fallback,
            metrics,
        }
    }

    /// The load balancer, when task distribution is enabled
    #[must_use]
    pub fn balancer(&self) -> Option<&Arc<LoadBalancer>> {
        self.balancer.as_ref()
    }

    /// The sharding engine, when model sharding is enabled
    #[must_use]
    pub fn sharding(&self) -> Option<&ShardingEngine> {
        self.sharding.as_ref()
    }

    /// The metrics collector shared by both paths
    #[must_use]
    pub fn metrics(&self) -> &Arc<ClusterMetrics> {
        &self.metrics
    }

    /// Spawn the background workers for the configured paths
    ///
    /// Health monitors for the node pool and backend registry, plus the
    /// metrics publisher when enabled. Request handling never waits on any
    /// of these; they keep the caches the request path reads.
    pub fn start_background_workers(
        &self,
        config: &ClusterConfig,
        sink: Arc<dyn crate::metrics::MetricsSink>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(balancer) = &self.balancer {
            handles.push(balancer.pool().spawn_health_monitor());
        }
        if let Some(sharding) = &self.sharding {
            handles.push(sharding.registry.spawn_health_monitor());
        }
        if config.metrics.enabled {
            handles.push(crate::metrics::spawn_publisher(
                self.metrics.clone(),
                sink,
                std::time::Duration::from_secs(config.metrics.publish_interval_secs.max(1)),
            ));
        }
        handles
    }

    /// Route one request
    ///
    /// Returns the response (or the terminal error) together with the
    /// routing decision for the request; the decision is emitted whether
    /// or not the request succeeded.
    pub async fn route(
        &self,
        request: &InferenceRequest,
        priority: u8,
    ) -> (Result<InferenceResponse, RouteError>, RoutingDecision) {
        let profile = analyze_request(request);
        let mut decision = RoutingDecision {
            request_id: Uuid::new_v4(),
            path: RoutePath::TaskDistribution,
            target: None,
            task_type: profile.task_type,
            complexity: profile.complexity,
            priority,
            decision_score: None,
            reasoning: String::new(),
            estimated_duration_ms: None,
            actual_duration_ms: None,
            fallback_used: false,
            timestamp: Utc::now(),
        };

        let primary = match self.choose_primary(&request.model) {
            Ok(path) => path,
            Err(e) => {
                decision.reasoning = e.to_string();
                return (Err(e), decision);
            }
        };
        decision.path = primary;

        let mut attempts: Vec<PathAttempt> = Vec::new();

        match self.attempt(primary, request, priority, &mut decision).await {
            Ok(response) => {
                self.metrics.record_path(primary);
                decision.actual_duration_ms = Some(response.duration_ms);
                return (Ok(response), decision);
            }
            Err(e) => {
                tracing::warn!(path = %primary, error = %e, "primary path failed");
                attempts.push(PathAttempt {
                    path: primary,
                    target: decision.target.clone(),
                    detail: e.to_string(),
                });

                let secondary = primary.other();
                let can_fall_back = self.auto_fallback
                    && e.is_fallback_eligible()
                    && self.path_configured(secondary);
                if !can_fall_back {
                    self.metrics.total_failures.inc();
                    return (Err(e), decision);
                }
            }
        }

        // Exactly one fallback attempt, one direction only.
        let secondary = primary.other();
        decision.path = secondary;
        decision.fallback_used = true;
        self.metrics.fallbacks.inc();
        tracing::info!(from = %primary, to = %secondary, "falling back to secondary path");

        match self
            .attempt(secondary, request, priority, &mut decision)
            .await
        {
            Ok(response) => {
                self.metrics.record_path(secondary);
                decision.actual_duration_ms = Some(response.duration_ms);
                (Ok(response), decision)
            }
            Err(e) => {
                attempts.push(PathAttempt {
                    path: secondary,
                    target: decision.target.clone(),
                    detail: e.to_string(),
                });
                self.metrics.total_failures.inc();
                (Err(RouteError::AllPathsFailed { attempts }), decision)
            }
        }
    }

    /// Aggregate statistics over both paths
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            task_distribution_requests: self.metrics.task_distribution_requests.get(),
            model_sharding_requests: self.metrics.model_sharding_requests.get(),
            fallbacks: self.metrics.fallbacks.get(),
            total_failures: self.metrics.total_failures.get(),
            nodes_total: self
                .balancer
                .as_ref()
                .map_or(0, |b| b.pool().len()),
            nodes_healthy: self
                .balancer
                .as_ref()
                .map_or(0, |b| b.pool().healthy_nodes().len()),
            backends_total: self.sharding.as_ref().map_or(0, |s| s.registry.len()),
            backends_available: self
                .sharding
                .as_ref()
                .map_or(0, |s| s.registry.available_backends().len()),
            coordinators: self.sharding.as_ref().map_or(0, |s| s.supervisor.count()),
            coordinators_ready: self
                .sharding
                .as_ref()
                .map_or(0, |s| s.supervisor.ready_count()),
            queue_depth: self.balancer.as_ref().map_or(0, |b| b.queue_depth()),
        }
    }

    fn path_configured(&self, path: RoutePath) -> bool {
        match path {
            RoutePath::TaskDistribution => self.balancer.is_some(),
            RoutePath::ModelSharding => self.sharding.is_some(),
        }
    }

    /// Pick the primary path per configuration and model size
    fn choose_primary(&self, model: &str) -> Result<RoutePath, RouteError> {
        match (&self.balancer, &self.sharding) {
            (None, None) => Err(RouteError::Configuration(
                "neither task distribution nor model sharding is enabled".to_string(),
            )),
            (Some(_), None) => Ok(RoutePath::TaskDistribution),
            (None, Some(_)) => Ok(RoutePath::ModelSharding),
            (Some(_), Some(sharding)) => {
                let spec = ModelSpec::estimate(model);
                let backends_available = !sharding.registry.available_backends().is_empty();
                if spec.prefers_sharding() && backends_available {
                    tracing::debug!(
                        model,
                        parameters_b = spec.parameters_b,
                        "large model prefers sharding"
                    );
                    Ok(RoutePath::ModelSharding)
                } else {
                    Ok(RoutePath::TaskDistribution)
                }
            }
        }
    }

    async fn attempt(
        &self,
        path: RoutePath,
        request: &InferenceRequest,
        priority: u8,
        decision: &mut RoutingDecision,
    ) -> Result<InferenceResponse, RouteError> {
        match path {
            RoutePath::TaskDistribution => {
                let balancer = self.balancer.as_ref().ok_or_else(|| {
                    RouteError::Configuration("task distribution not enabled".to_string())
                })?;
                let (response, node_decision) = balancer.execute(request, priority).await?;
                decision.target = Some(node_decision.url.clone());
                decision.decision_score = Some(node_decision.score);
                decision.reasoning = node_decision.reasoning.clone();
                decision.estimated_duration_ms = Some(node_decision.estimated_duration_ms);
                Ok(response)
            }
            RoutePath::ModelSharding => {
                let sharding = self.sharding.as_ref().ok_or_else(|| {
                    RouteError::Configuration("model sharding not enabled".to_string())
                })?;
                let backends = sharding.registry.available_backends();
                let spec = ModelSpec::estimate(&request.model);

                let coordinator = sharding
                    .supervisor
                    .ensure_ready(&request.model, &backends)
                    .await?;
                decision.target = Some(coordinator.address().to_string());
                decision.reasoning = format!(
                    "model {} (~{}B params) sharded across {} backends via coordinator {}",
                    request.model,
                    spec.parameters_b,
                    coordinator.backend_addresses().len(),
                    coordinator.address()
                );

                let response = sharding.supervisor.forward(&coordinator, request).await?;
                self.metrics.record_completion(
                    coordinator.address(),
                    response.duration_ms as f64,
                    true,
                );
                Ok(response)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_paths_is_configuration_error() {
        let router = HybridRouter::with_components(
            None,
            None,
            true,
            Arc::new(ClusterMetrics::new()),
        );
        assert!(matches!(
            router.choose_primary("llama3.2"),
            Err(RouteError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_route_emits_decision_on_configuration_error() {
        let router = HybridRouter::with_components(
            None,
            None,
            true,
            Arc::new(ClusterMetrics::new()),
        );
        let request = InferenceRequest::prompt("llama3.2", "hi");
        let (result, decision) = router.route(&request, 5).await;

        assert!(matches!(result, Err(RouteError::Configuration(_))));
        assert!(decision.reasoning.contains("no viable execution path"));
        assert!(decision.target.is_none());
    }

    #[test]
    fn test_disabled_sharding_never_constructed() {
        let mut config = ClusterConfig::default();
        config.task_distribution_enabled = true;
        config.model_sharding_enabled = false;
        config
            .rpc_backends
            .push(crate::config::BackendEntry::new("10.0.0.9", 50052));

        let router = HybridRouter::new(&config);
        // Backends in config do not conjure a sharding engine when the
        // path is disabled.
        assert!(router.sharding().is_none());
        assert!(router.balancer().is_some());
    }

    #[test]
    fn test_single_path_is_forced() {
        let mut config = ClusterConfig::default();
        config.model_sharding_enabled = true;
        let router = HybridRouter::new(&config);

        assert_eq!(
            router.choose_primary("llama3.2:3b").unwrap(),
            RoutePath::ModelSharding,
            "tiny model still shards when it is the only path"
        );
    }

    #[test]
    fn test_large_model_prefers_sharding_when_backends_exist() {
        let mut config = ClusterConfig::default();
        config.task_distribution_enabled = true;
        config.model_sharding_enabled = true;
        config
            .rpc_backends
            .push(crate::config::BackendEntry::new("10.0.0.9", 50052));

        let router = HybridRouter::new(&config);
        assert_eq!(
            router.choose_primary("big-model:405b").unwrap(),
            RoutePath::ModelSharding
        );
        assert_eq!(
            router.choose_primary("llama3.2:3b").unwrap(),
            RoutePath::TaskDistribution
        );
    }

    #[test]
    fn test_large_model_without_backends_uses_task_distribution() {
        let mut config = ClusterConfig::default();
        config.task_distribution_enabled = true;
        config.model_sharding_enabled = true;
        // Sharding enabled but no backends registered.

        let router = HybridRouter::new(&config);
        assert_eq!(
            router.choose_primary("big-model:405b").unwrap(),
            RoutePath::TaskDistribution
        );
    }
}
