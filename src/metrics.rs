//! Cluster Metrics
//!
//! Observability for the routing core:
//! - Per-path request and fallback counts
//! - Per-target latency histograms and error rates
//! - Queue depth and wait times
//!
//! Metrics collection is lock-free on the hot path (atomics); publication
//! to an external sink runs on its own background interval and can never
//! surface an error to a request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use crate::api::RoutePath;

// ============================================================================
// Primitives
// ============================================================================

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a counter at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can move in both directions
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Create a gauge at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an absolute value
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Increment by one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by one, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Read the current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A latency histogram with fixed bucket boundaries
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    /// Default millisecond buckets spanning quick probes to multi-minute
    /// sharded generations
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 15_000.0, 60_000.0,
            300_000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        let idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value as u64, Ordering::Relaxed);
    }

    /// Snapshot the histogram
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        let total = self.total.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            mean: if total > 0 { sum as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Point-in-time histogram data
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds
    pub buckets: Vec<f64>,
    /// Count per bucket
    pub counts: Vec<u64>,
    /// Total samples
    pub total: u64,
    /// Mean of recorded values
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Bucket-resolution percentile
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let target = (self.total as f64 * p).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }
        *self.buckets.last().unwrap_or(&0.0)
    }
}

// ============================================================================
// Per-Target Metrics
// ============================================================================

/// Metrics for one routing target (node URL or coordinator address)
#[derive(Debug)]
pub struct TargetMetrics {
    /// Total requests routed here
    pub requests: Counter,
    /// Failed requests
    pub failures: Counter,
    /// End-to-end latency
    pub latency: Histogram,
    /// In-flight requests right now
    pub inflight: Gauge,
}

impl TargetMetrics {
    fn new() -> Self {
        Self {
            requests: Counter::new(),
            failures: Counter::new(),
            latency: Histogram::latency_default(),
            inflight: Gauge::new(),
        }
    }

    /// Error rate over the target's lifetime
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let total = self.requests.get();
        if total == 0 {
            return 0.0;
        }
        self.failures.get() as f64 / total as f64
    }
}

// ============================================================================
// Cluster Metrics
// ============================================================================

/// Centralized metrics for the orchestration core
pub struct ClusterMetrics {
    /// Requests handled on the task-distribution path
    pub task_distribution_requests: Counter,
    /// Requests handled on the model-sharding path
    pub model_sharding_requests: Counter,
    /// Requests that used the fallback path
    pub fallbacks: Counter,
    /// Requests that failed on every configured path
    pub total_failures: Counter,
    /// Current queue depth
    pub queue_depth: Gauge,
    /// Time requests spend queued
    pub queue_wait: Histogram,
    targets: DashMap<String, Arc<TargetMetrics>>,
    started_at: Instant,
}

impl ClusterMetrics {
    /// Create a fresh metrics collector
    #[must_use]
    pub fn new() -> Self {
        Self {
            task_distribution_requests: Counter::new(),
            model_sharding_requests: Counter::new(),
            fallbacks: Counter::new(),
            total_failures: Counter::new(),
            queue_depth: Gauge::new(),
            queue_wait: Histogram::latency_default(),
            targets: DashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Record that a request was routed down a path
    pub fn record_path(&self, path: RoutePath) {
        match path {
            RoutePath::TaskDistribution => self.task_distribution_requests.inc(),
            RoutePath::ModelSharding => self.model_sharding_requests.inc(),
        }
    }

    /// Per-target metrics, created on first use
    pub fn target(&self, id: &str) -> Arc<TargetMetrics> {
        self.targets
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(TargetMetrics::new()))
            .clone()
    }

    /// Record a completed request against a target
    pub fn record_completion(&self, target_id: &str, duration_ms: f64, success: bool) {
        let target = self.target(target_id);
        target.requests.inc();
        target.latency.record(duration_ms);
        if !success {
            target.failures.inc();
        }
    }

    /// Uptime of this collector
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Build a publishable snapshot
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let targets = self
            .targets
            .iter()
            .map(|entry| {
                let m = entry.value();
                let latency = m.latency.snapshot();
                TargetSummary {
                    id: entry.key().clone(),
                    requests: m.requests.get(),
                    failures: m.failures.get(),
                    error_rate: m.error_rate(),
                    latency_p50_ms: latency.percentile(0.5),
                    latency_p99_ms: latency.percentile(0.99),
                    latency_mean_ms: latency.mean,
                    inflight: m.inflight.get(),
                }
            })
            .collect();

        MetricsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            task_distribution_requests: self.task_distribution_requests.get(),
            model_sharding_requests: self.model_sharding_requests.get(),
            fallbacks: self.fallbacks.get(),
            total_failures: self.total_failures.get(),
            queue_depth: self.queue_depth.get(),
            queue_wait_p99_ms: self.queue_wait.snapshot().percentile(0.99),
            targets,
        }
    }
}

impl Default for ClusterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary for one target
#[derive(Clone, Debug, Serialize)]
pub struct TargetSummary {
    /// Target identifier
    pub id: String,
    /// Total requests
    pub requests: u64,
    /// Failed requests
    pub failures: u64,
    /// Lifetime error rate
    pub error_rate: f64,
    /// Median latency
    pub latency_p50_ms: f64,
    /// Tail latency
    pub latency_p99_ms: f64,
    /// Mean latency
    pub latency_mean_ms: f64,
    /// Current in-flight count
    pub inflight: u64,
}

/// A publishable point-in-time view of cluster metrics
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    /// Seconds since the collector started
    pub uptime_secs: u64,
    /// Task-distribution request count
    pub task_distribution_requests: u64,
    /// Model-sharding request count
    pub model_sharding_requests: u64,
    /// Fallback count
    pub fallbacks: u64,
    /// Requests failed on all paths
    pub total_failures: u64,
    /// Current queue depth
    pub queue_depth: u64,
    /// Queue wait tail latency
    pub queue_wait_p99_ms: f64,
    /// Per-target summaries
    pub targets: Vec<TargetSummary>,
}

// ============================================================================
// Publication
// ============================================================================

/// Destination for periodic metrics publication
///
/// Implementations talk to an external observability system. Failures are
/// logged and swallowed by the publisher; a sink can never fail a request.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Sink name for logs
    fn name(&self) -> &str;

    /// Publish one snapshot
    async fn publish(&self, snapshot: &MetricsSnapshot) -> anyhow::Result<()>;
}

/// Sink that emits snapshots as tracing events
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl MetricsSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn publish(&self, snapshot: &MetricsSnapshot) -> anyhow::Result<()> {
        tracing::debug!(
            task_distribution = snapshot.task_distribution_requests,
            model_sharding = snapshot.model_sharding_requests,
            fallbacks = snapshot.fallbacks,
            queue_depth = snapshot.queue_depth,
            targets = snapshot.targets.len(),
            "cluster metrics"
        );
        Ok(())
    }
}

/// Spawn the background metrics publisher
///
/// Runs on a fixed interval, independent of request handling. Sink errors
/// are logged at debug severity and swallowed.
pub fn spawn_publisher(
    metrics: Arc<ClusterMetrics>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let snapshot = metrics.snapshot();
            if let Err(e) = sink.publish(&snapshot).await {
                tracing::debug!(sink = sink.name(), error = %e, "metrics publish failed");
            }
        }
    })
}
