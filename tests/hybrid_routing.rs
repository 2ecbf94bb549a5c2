//! Hybrid routing integration tests
//!
//! End-to-end routing scenarios against a minimal in-process worker-node
//! server and a stub coordinator launcher. Covered:
//! - path exclusivity: a disabled path is never touched
//! - fallback: exactly one secondary attempt, one direction, opt-in
//! - the sharding scenario: big model + backends -> coordinator, no pool
//! - routing decisions emitted for successes and failures

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use flotilla_core::config::{CoordinatorConfig, HealthConfig, NodeEntry, ScoringWeights};
use flotilla_core::error::RouteError;
use flotilla_core::sharding::coordinator::{
    CoordinatorLauncher, CoordinatorProcess, LaunchSpec, ReadyError,
};
use flotilla_core::sharding::{BackendRegistry, CoordinatorSupervisor, RpcBackend, WeightResolver};
use flotilla_core::{
    ClusterMetrics, HybridRouter, InferenceRequest, LoadBalancer, NodePool, PerformanceMemory,
    RoutePath, ShardingEngine,
};

// =============================================================================
// Minimal worker-node server
// =============================================================================

/// Serve canned node-API responses on an ephemeral port
///
/// Answers every request with an `/api/generate`-shaped JSON body; that is
/// enough for both completion calls and liveness probes.
async fn spawn_fake_node(reply: &str) -> (String, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let body = serde_json::json!({
        "response": reply,
        "eval_count": 7,
        "done": true,
    })
    .to_string();

    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let counter = counter.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                let mut total = 0usize;
                loop {
                    let Ok(n) = stream.read(&mut buf[total..]).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    total += n;
                    let text = String::from_utf8_lossy(&buf[..total]).to_string();
                    if let Some(header_end) = text.find("\r\n\r\n") {
                        let content_length = text
                            .lines()
                            .find_map(|line| {
                                line.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .and_then(|v| v.trim().parse::<usize>().ok())
                            })
                            .unwrap_or(0);
                        if total >= header_end + 4 + content_length {
                            break;
                        }
                    }
                    if total == buf.len() {
                        break;
                    }
                }

                counter.fetch_add(1, Ordering::SeqCst);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), hits)
}

// =============================================================================
// Stub coordinator launcher
// =============================================================================

struct StubLauncher {
    launches: AtomicUsize,
    fail_launch: bool,
    killed: Arc<AtomicBool>,
}

impl StubLauncher {
    fn ready() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            fail_launch: false,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn failing() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            fail_launch: true,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

struct StubProcess {
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl CoordinatorProcess for StubProcess {
    async fn wait_ready(&mut self, _timeout: Duration) -> Result<(), ReadyError> {
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinatorLauncher for StubLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> anyhow::Result<Box<dyn CoordinatorProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_launch {
            anyhow::bail!("stub launcher configured to fail");
        }
        Ok(Box::new(StubProcess {
            killed: self.killed.clone(),
        }))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

async fn write_model_store(root: &Path, name: &str, tag: &str) {
    let manifest_dir = root
        .join("manifests")
        .join("registry.ollama.ai/library")
        .join(name);
    tokio::fs::create_dir_all(&manifest_dir).await.unwrap();
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "layers": [
            { "mediaType": "application/vnd.ollama.image.model", "digest": "sha256:feedface" }
        ]
    });
    tokio::fs::write(manifest_dir.join(tag), manifest.to_string())
        .await
        .unwrap();

    let blob_dir = root.join("blobs");
    tokio::fs::create_dir_all(&blob_dir).await.unwrap();
    tokio::fs::write(blob_dir.join("sha256-feedface"), b"weights")
        .await
        .unwrap();
}

fn balancer_over(urls: &[&str], metrics: &Arc<ClusterMetrics>) -> Arc<LoadBalancer> {
    let pool = Arc::new(NodePool::new(HealthConfig::default()));
    for url in urls {
        pool.add_node(NodeEntry::new(*url));
    }
    Arc::new(LoadBalancer::new(
        pool,
        Arc::new(PerformanceMemory::new()),
        metrics.clone(),
        ScoringWeights::default(),
        HealthConfig::default(),
    ))
}

fn sharding_over(
    store: &Path,
    launcher: Arc<StubLauncher>,
    backend_hosts: &[&str],
) -> ShardingEngine {
    let registry = Arc::new(BackendRegistry::new(&HealthConfig::default()));
    for host in backend_hosts {
        registry.register(RpcBackend::new(*host, 50052));
    }
    let supervisor = Arc::new(CoordinatorSupervisor::with_launcher(
        registry.clone(),
        Arc::new(WeightResolver::new(store)),
        CoordinatorConfig {
            startup_timeout_secs: 5,
            startup_secs_per_bparam: 0,
            idle_timeout_secs: 3600,
            ..CoordinatorConfig::default()
        },
        launcher,
    ));
    ShardingEngine {
        registry,
        supervisor,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_task_distribution_end_to_end() {
    let (url, hits) = spawn_fake_node("hello from the node").await;
    let metrics = Arc::new(ClusterMetrics::new());
    let router = HybridRouter::with_components(
        Some(balancer_over(&[&url], &metrics)),
        None,
        false,
        metrics,
    );

    let request = InferenceRequest::prompt("llama3.2", "say hello");
    let (result, decision) = router.route(&request, 5).await;

    let response = result.unwrap();
    assert_eq!(response.content, "hello from the node");
    assert_eq!(response.tokens_used, Some(7));
    assert_eq!(decision.path, RoutePath::TaskDistribution);
    assert_eq!(decision.target.as_deref(), Some(url.as_str()));
    assert!(decision.decision_score.is_some());
    assert!(decision.actual_duration_ms.is_some());
    assert!(!decision.fallback_used);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let stats = router.stats();
    assert_eq!(stats.task_distribution_requests, 1);
    assert_eq!(stats.fallbacks, 0);
}

#[tokio::test]
async fn test_sharding_only_router_never_touches_pool() {
    // A pool object exists in memory, but the router is configured with
    // task distribution disabled: no request may reach it.
    let (url, hits) = spawn_fake_node("never called").await;
    let _idle_balancer = balancer_over(&[&url], &Arc::new(ClusterMetrics::new()));

    let store = tempfile::tempdir().unwrap();
    write_model_store(store.path(), "big-model", "70b").await;
    let launcher = Arc::new(StubLauncher::ready());
    let sharding = sharding_over(store.path(), launcher.clone(), &["h1", "h2", "h3"]);

    let metrics = Arc::new(ClusterMetrics::new());
    let router = HybridRouter::with_components(None, Some(sharding), true, metrics);

    let request = InferenceRequest::prompt("big-model:70b", "summarize the corpus");
    let (result, decision) = router.route(&request, 5).await;

    // A coordinator was spawned for the sharding path...
    assert_eq!(launcher.launch_count(), 1);
    assert_eq!(decision.path, RoutePath::ModelSharding);
    assert!(decision.target.is_some());
    // ...the forward itself fails (nothing listens on the stub address),
    // and with no second path configured the error surfaces as-is.
    assert!(matches!(result, Err(RouteError::CoordinatorRequest(_))));
    assert!(!decision.fallback_used);

    // The pool object in memory was never touched.
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fallback_runs_exactly_once_and_succeeds() {
    // Primary: sharding for a big model, whose launcher fails.
    // Secondary: task distribution with a working node.
    let store = tempfile::tempdir().unwrap();
    write_model_store(store.path(), "big-model", "405b").await;
    let launcher = Arc::new(StubLauncher::failing());
    let sharding = sharding_over(store.path(), launcher.clone(), &["h1", "h2"]);

    let (url, hits) = spawn_fake_node("rescued by the pool").await;
    let metrics = Arc::new(ClusterMetrics::new());
    let router = HybridRouter::with_components(
        Some(balancer_over(&[&url], &metrics)),
        Some(sharding),
        true,
        metrics,
    );

    let request = InferenceRequest::prompt("big-model:405b", "explain the plan");
    let (result, decision) = router.route(&request, 5).await;

    let response = result.unwrap();
    assert_eq!(response.content, "rescued by the pool");
    assert_eq!(decision.path, RoutePath::TaskDistribution);
    assert!(decision.fallback_used);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one secondary attempt");

    let stats = router.stats();
    assert_eq!(stats.fallbacks, 1);
    assert_eq!(stats.task_distribution_requests, 1);
    assert_eq!(stats.model_sharding_requests, 0);
}

#[tokio::test]
async fn test_fallback_disabled_surfaces_primary_error() {
    let store = tempfile::tempdir().unwrap();
    write_model_store(store.path(), "big-model", "405b").await;
    let launcher = Arc::new(StubLauncher::failing());
    let sharding = sharding_over(store.path(), launcher.clone(), &["h1", "h2"]);

    let (url, hits) = spawn_fake_node("must stay idle").await;
    let metrics = Arc::new(ClusterMetrics::new());
    let router = HybridRouter::with_components(
        Some(balancer_over(&[&url], &metrics)),
        Some(sharding),
        false, // auto_fallback off
        metrics,
    );

    let request = InferenceRequest::prompt("big-model:405b", "explain the plan");
    let (result, decision) = router.route(&request, 5).await;

    assert!(matches!(result, Err(RouteError::CoordinatorRequest(_))));
    assert!(!decision.fallback_used);
    assert_eq!(hits.load(Ordering::SeqCst), 0, "zero secondary attempts");
    assert_eq!(router.stats().fallbacks, 0);
}

#[tokio::test]
async fn test_total_failure_enumerates_every_attempted_path() {
    // Sharding fails to launch; the pool has no nodes at all.
    let store = tempfile::tempdir().unwrap();
    write_model_store(store.path(), "big-model", "405b").await;
    let launcher = Arc::new(StubLauncher::failing());
    let sharding = sharding_over(store.path(), launcher.clone(), &["h1"]);

    let metrics = Arc::new(ClusterMetrics::new());
    let router = HybridRouter::with_components(
        Some(balancer_over(&[], &metrics)),
        Some(sharding),
        true,
        metrics,
    );

    let request = InferenceRequest::prompt("big-model:405b", "explain the plan");
    let (result, decision) = router.route(&request, 5).await;

    match result {
        Err(RouteError::AllPathsFailed { attempts }) => {
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[0].path, RoutePath::ModelSharding);
            assert_eq!(attempts[1].path, RoutePath::TaskDistribution);
        }
        other => panic!("expected AllPathsFailed, got {other:?}"),
    }
    assert!(decision.fallback_used);
    assert_eq!(router.stats().total_failures, 1);
}

#[tokio::test]
async fn test_small_model_stays_on_task_distribution() {
    let store = tempfile::tempdir().unwrap();
    let launcher = Arc::new(StubLauncher::ready());
    let sharding = sharding_over(store.path(), launcher.clone(), &["h1", "h2"]);

    let (url, _hits) = spawn_fake_node("small model reply").await;
    let metrics = Arc::new(ClusterMetrics::new());
    let router = HybridRouter::with_components(
        Some(balancer_over(&[&url], &metrics)),
        Some(sharding),
        true,
        metrics,
    );

    let request = InferenceRequest::prompt("llama3.2:3b", "quick one");
    let (result, decision) = router.route(&request, 5).await;

    assert!(result.is_ok());
    assert_eq!(decision.path, RoutePath::TaskDistribution);
    assert_eq!(launcher.launch_count(), 0, "no coordinator for small models");
}

#[tokio::test]
async fn test_decision_carries_classification_and_priority() {
    let (url, _hits) = spawn_fake_node("ok").await;
    let metrics = Arc::new(ClusterMetrics::new());
    let router = HybridRouter::with_components(
        Some(balancer_over(&[&url], &metrics)),
        None,
        false,
        metrics,
    );

    let request = InferenceRequest::prompt("llama3.2", "Classify the sentiment: lovely day");
    let (result, decision) = router.route(&request, 8).await;

    assert!(result.is_ok());
    assert_eq!(decision.priority, 8);
    assert_eq!(
        decision.task_type,
        flotilla_core::TaskType::Classification
    );
    assert!(decision.estimated_duration_ms.is_some());
    assert!(!decision.reasoning.is_empty());
}
