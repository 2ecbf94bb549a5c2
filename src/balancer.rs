//! Intelligent Load Balancer
//!
//! The task-distribution path. Every request is analyzed (pure, no I/O),
//! healthy nodes are scored on multiple weighted factors, and the best
//! node wins with a per-factor breakdown and a human-readable reason
//! attached. Outcomes feed back into the performance memory so future
//! estimates converge on observed behavior.
//!
//! # Selection Flow
//!
//! ```text
//! 1. Analyze request  -> (task type, complexity, token/GPU estimates)
//! 2. Gate on health   -> unhealthy nodes are excluded, not penalized
//! 3. Score candidates -> weighted factors, see ScoringWeights
//! 4. Pick the best    -> ties: lowest in-flight, then registration order
//! 5. Execute, record  -> adaptive learning + metrics
//! ```

use std::sync::Arc;
use std::time::Instant;

use crate::analysis::{analyze_request, RequestProfile};
use crate::api::{InferenceRequest, InferenceResponse};
use crate::config::{HealthConfig, ScoringWeights};
use crate::error::RouteError;
use crate::locality::ParallelismPlan;
use crate::memory::{PerformanceMemory, PerformanceRecord};
use crate::metrics::ClusterMetrics;
use crate::node::{NodeSnapshot, WorkerNode};
use crate::pool::NodePool;
use crate::queue::{RequestQueue, WaitOutcome};

// ============================================================================
// Decision Types
// ============================================================================

/// Per-factor contribution to a node's score
#[derive(Clone, Debug, Default)]
pub struct ScoreBreakdown {
    /// Latency factor contribution
    pub latency: f64,
    /// Success-rate factor contribution
    pub success_rate: f64,
    /// Load penalty (already negative)
    pub load: f64,
    /// Resource-adequacy contribution
    pub resources: f64,
    /// Priority-alignment contribution
    pub priority_alignment: f64,
    /// Task-specialization bonus
    pub specialization: f64,
    /// Configured node-priority contribution
    pub node_priority: f64,
    /// Degradation multiplier that was applied (1.0 = none)
    pub degradation: f64,
    /// Final composite score
    pub total: f64,
}

/// The balancer's choice for one request
#[derive(Clone, Debug)]
pub struct NodeDecision {
    /// Selected node URL
    pub url: String,
    /// Selected node name
    pub node_name: String,
    /// Analyzed request profile
    pub profile: RequestProfile,
    /// Request priority (1-10)
    pub priority: u8,
    /// Composite score of the winner
    pub score: f64,
    /// Per-factor breakdown
    pub breakdown: ScoreBreakdown,
    /// Natural-language reason for the choice
    pub reasoning: String,
    /// Predicted duration from the performance memory (or baseline)
    pub estimated_duration_ms: f64,
}

enum Reservation {
    Reserved(Arc<WorkerNode>, NodeDecision),
    Saturated,
}

// ============================================================================
// Load Balancer
// ============================================================================

/// Scores and selects task-distribution nodes; owns the priority queue
pub struct LoadBalancer {
    pool: Arc<NodePool>,
    memory: Arc<PerformanceMemory>,
    metrics: Arc<ClusterMetrics>,
    queue: Arc<RequestQueue>,
    weights: ScoringWeights,
    health: HealthConfig,
}

impl LoadBalancer {
    /// Create a balancer over a pool
    #[must_use]
    pub fn new(
        pool: Arc<NodePool>,
        memory: Arc<PerformanceMemory>,
        metrics: Arc<ClusterMetrics>,
        weights: ScoringWeights,
        health: HealthConfig,
    ) -> Self {
        Self {
            pool,
            memory,
            metrics,
            queue: Arc::new(RequestQueue::new()),
            weights,
            health,
        }
    }

    /// The node pool this balancer routes over
    #[must_use]
    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// The performance memory feeding adaptive scoring
    #[must_use]
    pub fn memory(&self) -> &Arc<PerformanceMemory> {
        &self.memory
    }

    /// Current queue depth
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Select the best node for a request without reserving capacity
    ///
    /// Health is a hard gate: unhealthy nodes are not candidates at all.
    /// Ties break by lowest in-flight count, then registration order, so
    /// selection is deterministic.
    pub fn select(
        &self,
        request: &InferenceRequest,
        priority: u8,
    ) -> Result<NodeDecision, RouteError> {
        let profile = analyze_request(request);
        let healthy = self.pool.healthy_nodes();
        if healthy.is_empty() {
            return Err(RouteError::NodeUnavailable(format!(
                "0 of {} registered nodes are healthy",
                self.pool.len()
            )));
        }

        let specialist = self.memory.best_target_for(profile.task_type);

        let mut best: Option<(NodeSnapshot, ScoreBreakdown)> = None;
        for node in &healthy {
            let snapshot = node.snapshot();
            let breakdown = self.score_node(&snapshot, &profile, priority, specialist.as_deref());

            let replace = match &best {
                None => true,
                Some((current, current_breakdown)) => {
                    match breakdown.total.total_cmp(&current_breakdown.total) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        std::cmp::Ordering::Equal => {
                            (snapshot.inflight, snapshot.ordinal)
                                < (current.inflight, current.ordinal)
                        }
                    }
                }
            };
            if replace {
                best = Some((snapshot, breakdown));
            }
        }

        let (winner, breakdown) = best.expect("candidates were non-empty");
        let estimated_duration_ms = self
            .memory
            .estimated_duration(&winner.url, profile.task_type)
            .unwrap_or(profile.baseline_duration_ms);

        let reasoning = build_reasoning(&winner, &profile, &breakdown, specialist.as_deref());
        tracing::debug!(
            node = %winner.url,
            score = breakdown.total,
            task_type = %profile.task_type,
            complexity = %profile.complexity,
            "selected node"
        );

        Ok(NodeDecision {
            url: winner.url.clone(),
            node_name: winner.name,
            profile,
            priority,
            score: breakdown.total,
            breakdown: breakdown.clone(),
            reasoning,
            estimated_duration_ms,
        })
    }

    /// Execute a request end to end: select, reserve, call, record
    ///
    /// When every healthy node is saturated the request parks on the
    /// priority queue until capacity frees up or the wait deadline passes.
    pub async fn execute(
        &self,
        request: &InferenceRequest,
        priority: u8,
    ) -> Result<(InferenceResponse, NodeDecision), RouteError> {
        let deadline = RequestQueue::deadline_after(self.health.queue_wait_timeout());

        let (node, decision) = loop {
            match self.try_reserve(request, priority)? {
                Reservation::Reserved(node, decision) => break (node, decision),
                Reservation::Saturated => {
                    let queued_at = Instant::now();
                    self.metrics.queue_depth.set(self.queue.depth() as u64 + 1);
                    let outcome = self.queue.wait_turn(priority, deadline).await;
                    self.metrics
                        .queue_wait
                        .record(queued_at.elapsed().as_millis() as f64);
                    self.metrics.queue_depth.set(self.queue.depth() as u64);
                    if outcome == WaitOutcome::TimedOut {
                        return Err(RouteError::NodeUnavailable(
                            "queue wait timed out before any node had capacity".to_string(),
                        ));
                    }
                }
            }
        };

        let start = Instant::now();
        let result = node.client().generate(request).await;
        let duration_ms = start.elapsed().as_millis() as f64;
        let success = result.is_ok();

        node.record_result(duration_ms, success);
        node.release_slot();
        self.queue.wake_next();

        self.memory.record(PerformanceRecord {
            target: decision.url.clone(),
            task_type: decision.profile.task_type,
            priority,
            predicted_ms: decision.estimated_duration_ms,
            actual_ms: duration_ms,
            success,
        });
        self.metrics
            .record_completion(&decision.url, duration_ms, success);

        match result {
            Ok(response) => Ok((response, decision)),
            Err(e) => Err(RouteError::NodeUnavailable(format!(
                "request failed on {}: {e}",
                decision.url
            ))),
        }
    }

    /// Record an externally executed request into the adaptive memory
    ///
    /// For callers that route with [`LoadBalancer::select`] but run the
    /// request themselves.
    pub fn record_performance(&self, decision: &NodeDecision, actual_ms: f64, success: bool) {
        if let Some(node) = self.pool.get(&decision.url) {
            node.record_result(actual_ms, success);
        }
        self.memory.record(PerformanceRecord {
            target: decision.url.clone(),
            task_type: decision.profile.task_type,
            priority: decision.priority,
            predicted_ms: decision.estimated_duration_ms,
            actual_ms,
            success,
        });
        self.metrics
            .record_completion(&decision.url, actual_ms, success);
    }

    /// Recommend parallel or sequential execution for a node batch
    ///
    /// Nodes carry their canonical physical identity from registration, so
    /// this is a pure set count: parallel only for >1 task on >=2 machines.
    #[must_use]
    pub fn plan_parallelism(&self, nodes: &[Arc<WorkerNode>]) -> ParallelismPlan {
        let unique: std::collections::HashSet<_> =
            nodes.iter().map(|n| n.physical_host().clone()).collect();
        let unique_hosts = unique.len();
        let batch_size = nodes.len();

        if batch_size > 1 && unique_hosts >= 2 {
            ParallelismPlan {
                use_parallel: true,
                unique_hosts,
                batch_size,
                reason: format!("{batch_size} tasks span {unique_hosts} physical hosts"),
            }
        } else if batch_size <= 1 {
            ParallelismPlan {
                use_parallel: false,
                unique_hosts,
                batch_size,
                reason: "single-item batch runs sequentially".to_string(),
            }
        } else {
            ParallelismPlan {
                use_parallel: false,
                unique_hosts,
                batch_size,
                reason: format!(
                    "{batch_size} tasks resolve to one physical host; co-located \
                     inference contends for CPU cache and memory bandwidth, so \
                     sequential execution is faster"
                ),
            }
        }
    }

    fn try_reserve(
        &self,
        request: &InferenceRequest,
        priority: u8,
    ) -> Result<Reservation, RouteError> {
        let decision = self.select(request, priority)?;
        let node = self
            .pool
            .get(&decision.url)
            .ok_or_else(|| RouteError::NodeUnavailable("selected node vanished".to_string()))?;

        if node.try_acquire_slot(self.health.max_inflight_per_node) {
            return Ok(Reservation::Reserved(node, decision));
        }

        // The winner is full; take any other healthy node with capacity
        // before queueing.
        for other in self.pool.healthy_nodes() {
            if other.url() != decision.url
                && other.try_acquire_slot(self.health.max_inflight_per_node)
            {
                let mut decision = decision.clone();
                decision.url = other.url().to_string();
                decision.node_name = other.name().to_string();
                decision.reasoning = format!(
                    "{} (first choice at capacity, rerouted to {})",
                    decision.reasoning,
                    other.url()
                );
                return Ok(Reservation::Reserved(other, decision));
            }
        }

        Ok(Reservation::Saturated)
    }

    fn score_node(
        &self,
        snapshot: &NodeSnapshot,
        profile: &RequestProfile,
        priority: u8,
        specialist: Option<&str>,
    ) -> ScoreBreakdown {
        let w = &self.weights;
        let mut breakdown = ScoreBreakdown {
            degradation: 1.0,
            ..ScoreBreakdown::default()
        };

        // Latency: prefer the node's learned duration for this task type,
        // falling back to its rolling request latency.
        let expected_ms = self
            .memory
            .estimated_duration(&snapshot.url, profile.task_type)
            .or(if snapshot.avg_latency_ms > 0.0 {
                Some(snapshot.avg_latency_ms)
            } else {
                None
            })
            .unwrap_or(profile.baseline_duration_ms);
        let latency_norm = 1.0 / (1.0 + expected_ms / 1_000.0);
        breakdown.latency = w.latency * latency_norm;

        breakdown.success_rate = w.success_rate * snapshot.success_rate;

        breakdown.load = -w.current_load * snapshot.inflight as f64;

        // Resource adequacy: free GPU memory against the model's estimated
        // need. A GPU-hungry request on a CPU-only node stays a candidate,
        // it just scores low on this factor.
        let resource_fit = if profile.requires_gpu {
            if !snapshot.capabilities.has_gpu {
                0.2
            } else if snapshot.capabilities.gpu_free_mb == 0
                || snapshot.capabilities.gpu_free_mb >= profile.estimated_vram_mb
            {
                // Unknown free memory counts as adequate; probing is best
                // effort.
                1.0
            } else {
                0.5
            }
        } else {
            0.6
        };
        breakdown.resources = w.resources * resource_fit;

        // High-priority requests weight toward historically fast nodes.
        breakdown.priority_alignment =
            w.priority_alignment * (f64::from(priority) / 10.0) * latency_norm;

        if specialist == Some(snapshot.url.as_str()) {
            breakdown.specialization = w.specialization;
        }

        breakdown.node_priority = w.node_priority * f64::from(snapshot.priority);

        let mut total = breakdown.latency
            + breakdown.success_rate
            + breakdown.load
            + breakdown.resources
            + breakdown.priority_alignment
            + breakdown.specialization
            + breakdown.node_priority;

        // A node running materially worse than its own baseline is
        // deprioritized, never excluded.
        let degradation = self
            .memory
            .degradation_factor(&snapshot.url, profile.task_type);
        if degradation < 1.0 {
            breakdown.degradation = degradation;
            total *= w.degradation_penalty.max(degradation);
        }

        breakdown.total = total;
        breakdown
    }
}

fn build_reasoning(
    winner: &NodeSnapshot,
    profile: &RequestProfile,
    breakdown: &ScoreBreakdown,
    specialist: Option<&str>,
) -> String {
    let mut parts = vec![format!(
        "{} task ({} complexity) routed to {}",
        profile.task_type, profile.complexity, winner.name
    )];

    if winner.avg_latency_ms > 0.0 {
        parts.push(format!("avg latency {:.0}ms", winner.avg_latency_ms));
    }
    parts.push(format!("success rate {:.0}%", winner.success_rate * 100.0));
    parts.push(format!("{} in-flight", winner.inflight));

    if profile.requires_gpu && winner.capabilities.has_gpu {
        parts.push("GPU available".to_string());
    }
    if specialist == Some(winner.url.as_str()) {
        parts.push(format!("best history for {}", profile.task_type));
    }
    if breakdown.degradation < 1.0 {
        parts.push("recently degraded, deprioritized".to_string());
    }

    format!("{} (score {:.1})", parts.join(", "), breakdown.total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeEntry;
    use crate::node::ProbeReport;

    fn balancer_with_nodes(urls: &[&str]) -> LoadBalancer {
        let pool = Arc::new(NodePool::new(HealthConfig::default()));
        for url in urls {
            pool.add_node(NodeEntry::new(*url));
        }
        LoadBalancer::new(
            pool,
            Arc::new(PerformanceMemory::new()),
            Arc::new(ClusterMetrics::new()),
            ScoringWeights::default(),
            HealthConfig::default(),
        )
    }

    fn gpu_report() -> ProbeReport {
        ProbeReport {
            models: vec!["llama3.2".to_string()],
            gpu_free_mb: 8_192,
        }
    }

    #[test]
    fn test_no_healthy_nodes_is_typed_error() {
        let balancer = balancer_with_nodes(&[]);
        let request = InferenceRequest::prompt("llama3.2", "hi");
        assert!(matches!(
            balancer.select(&request, 5),
            Err(RouteError::NodeUnavailable(_))
        ));
    }

    #[test]
    fn test_unhealthy_nodes_are_excluded_not_penalized() {
        let balancer = balancer_with_nodes(&["http://10.0.0.1:11434", "http://10.0.0.2:11434"]);
        let bad = balancer.pool.get("http://10.0.0.1:11434").unwrap();
        for _ in 0..3 {
            bad.record_probe(None, 3);
        }

        let request = InferenceRequest::prompt("llama3.2", "hi");
        let decision = balancer.select(&request, 5).unwrap();
        assert_eq!(decision.url, "http://10.0.0.2:11434");
    }

    #[test]
    fn test_fast_gpu_node_beats_slow_cpu_node() {
        // Node A: GPU, ~120ms, 99% success. Node B: CPU, ~2000ms, 95%.
        let balancer = balancer_with_nodes(&["http://node-a:11434", "http://node-b:11434"]);

        let a = balancer.pool.get("http://node-a:11434").unwrap();
        a.record_probe(Some(gpu_report()), 3);
        for _ in 0..99 {
            a.record_result(120.0, true);
        }
        a.record_result(120.0, false);

        let b = balancer.pool.get("http://node-b:11434").unwrap();
        b.record_probe(Some(ProbeReport::default()), 3);
        for _ in 0..95 {
            b.record_result(2_000.0, true);
        }
        for _ in 0..5 {
            b.record_result(2_000.0, false);
        }

        let request = InferenceRequest::prompt(
            "llama3.2",
            "Write a detailed design document for the new caching layer. \
             Cover invalidation, consistency, and operational concerns."
                .repeat(3),
        );
        let decision = balancer.select(&request, 7).unwrap();

        assert_eq!(decision.url, "http://node-a:11434");
        assert!(decision.breakdown.latency > 0.0);
        assert!(decision.reasoning.contains("node-a"));
    }

    #[test]
    fn test_ties_break_by_registration_order() {
        let balancer = balancer_with_nodes(&["http://10.0.0.1:11434", "http://10.0.0.2:11434"]);
        let request = InferenceRequest::prompt("llama3.2", "hi");

        // Identical fresh nodes: the first registered must win.
        let decision = balancer.select(&request, 5).unwrap();
        assert_eq!(decision.url, "http://10.0.0.1:11434");
    }

    #[test]
    fn test_specialization_bonus_applies() {
        let balancer = balancer_with_nodes(&["http://10.0.0.1:11434", "http://10.0.0.2:11434"]);

        // Node 2 has strong history for generation tasks.
        for _ in 0..5 {
            balancer.memory.record(PerformanceRecord {
                target: "http://10.0.0.2:11434".to_string(),
                task_type: crate::analysis::TaskType::Generation,
                priority: 5,
                predicted_ms: 500.0,
                actual_ms: 80.0,
                success: true,
            });
        }

        let request = InferenceRequest::prompt("llama3.2", "write something nice");
        let decision = balancer.select(&request, 5).unwrap();
        assert_eq!(decision.url, "http://10.0.0.2:11434");
        assert!(decision.breakdown.specialization > 0.0);
    }

    #[test]
    fn test_degraded_node_deprioritized_not_removed() {
        let balancer = balancer_with_nodes(&["http://10.0.0.1:11434", "http://10.0.0.2:11434"]);

        // Node 1 built good history, then started failing.
        for _ in 0..30 {
            balancer.memory.record(PerformanceRecord {
                target: "http://10.0.0.1:11434".to_string(),
                task_type: crate::analysis::TaskType::Generation,
                priority: 5,
                predicted_ms: 100.0,
                actual_ms: 100.0,
                success: true,
            });
        }
        for _ in 0..8 {
            balancer.memory.record(PerformanceRecord {
                target: "http://10.0.0.1:11434".to_string(),
                task_type: crate::analysis::TaskType::Generation,
                priority: 5,
                predicted_ms: 100.0,
                actual_ms: 100.0,
                success: false,
            });
        }

        let request = InferenceRequest::prompt("llama3.2", "hello there");
        let decision = balancer.select(&request, 5).unwrap();
        // Node 1 would otherwise win on latency history and the
        // specialization bonus; degradation flips the choice.
        assert_eq!(decision.url, "http://10.0.0.2:11434");

        // Still a candidate if it is the only node left.
        balancer.pool.remove_node("http://10.0.0.2:11434");
        let decision = balancer.select(&request, 5).unwrap();
        assert_eq!(decision.url, "http://10.0.0.1:11434");
    }

    #[test]
    fn test_estimated_duration_uses_memory() {
        let balancer = balancer_with_nodes(&["http://10.0.0.1:11434"]);
        for _ in 0..10 {
            balancer.memory.record(PerformanceRecord {
                target: "http://10.0.0.1:11434".to_string(),
                task_type: crate::analysis::TaskType::Generation,
                priority: 5,
                predicted_ms: 0.0,
                actual_ms: 333.0,
                success: true,
            });
        }

        let request = InferenceRequest::prompt("llama3.2", "hello");
        let decision = balancer.select(&request, 5).unwrap();
        assert!((decision.estimated_duration_ms - 333.0).abs() < 1.0);
    }

    #[test]
    fn test_parallelism_plan_from_node_identities() {
        let balancer = balancer_with_nodes(&["http://localhost:11434", "http://127.0.0.1:11434"]);
        // Aliases collapsed to one node; a single-node batch is sequential.
        let nodes = balancer.pool.all_nodes();
        assert_eq!(nodes.len(), 1);
        let plan = balancer.plan_parallelism(&nodes);
        assert!(!plan.use_parallel);
    }
}
