//! Coordinator Lifecycle
//!
//! A coordinator is an ephemeral subprocess that fronts a set of RPC
//! backends for exactly one model, distributing the model's layers across
//! them and exposing a plain HTTP completion API. Cold starts take minutes
//! for large models, so coordinators are keyed by (model, backend set) and
//! reused while ready; concurrent requests for the same key coalesce onto
//! a single spawn.
//!
//! # Lifecycle
//!
//! ```text
//! Unstarted -> ResolvingModel -> Starting -> Loading -> Ready -> Serving
//!                    |              |           |                   |
//!                    v              v           v                   v
//!                  Failed         Failed     Failed             Stopped
//! ```
//!
//! Each coordinator is owned by one supervision task that publishes state
//! transitions on a watch channel; request handlers only ever read that
//! channel, so there is no shared mutable lifecycle state to race on.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{watch, Notify};
use tokio_stream::wrappers::LinesStream;

use super::backend::RpcBackend;
use super::registry::BackendRegistry;
use super::resolver::WeightResolver;
use crate::analysis::ModelSpec;
use crate::api::{InferenceRequest, InferenceResponse};
use crate::config::CoordinatorConfig;
use crate::error::RouteError;

// ============================================================================
// States
// ============================================================================

/// Why a coordinator ended up `Failed`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// Weight resolution failed; the model is not in the local store
    ModelNotFound(String),
    /// The subprocess could not be launched
    Launch(String),
    /// The subprocess launched but never became ready in time
    StartupTimeout,
    /// The subprocess launched and then died before becoming ready
    Startup(String),
}

/// Lifecycle state of one coordinator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Created, supervision not yet begun
    Unstarted,
    /// Resolving the model's weight file
    ResolvingModel,
    /// Launching the subprocess
    Starting,
    /// Subprocess up, distributing layers and loading weights
    Loading,
    /// Serving-capable, no request yet
    Ready,
    /// Has served at least one request
    Serving,
    /// Terminated cleanly
    Stopped,
    /// Terminated with an error
    Failed(FailReason),
}

impl CoordinatorState {
    /// Whether requests can be forwarded in this state
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Ready | Self::Serving)
    }

    /// Whether this state is final
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }
}

// ============================================================================
// Launcher Seam
// ============================================================================

/// Everything needed to launch a coordinator subprocess
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    /// Resolved weight file
    pub model_path: PathBuf,
    /// Host to bind the HTTP API to
    pub bind_host: String,
    /// Port for the HTTP API
    pub port: u16,
    /// Backend addresses passed as the connection list
    pub rpc_backends: Vec<String>,
    /// GPU layers to offload
    pub gpu_layers: u32,
    /// Context window size
    pub ctx_size: u32,
}

/// Readiness failures reported by a process
#[derive(Debug, Error)]
pub enum ReadyError {
    /// The process did not answer health checks within the timeout
    #[error("not ready within timeout")]
    TimedOut,
    /// The process died or reported a fatal condition
    #[error("{0}")]
    Failed(String),
}

/// A launched coordinator process under supervision
#[async_trait]
pub trait CoordinatorProcess: Send + Sync {
    /// Block until the process is serving-capable or fails
    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), ReadyError>;

    /// Terminate the process; must not leave orphans behind
    async fn shutdown(&mut self);
}

/// Launches coordinator processes
///
/// A trait seam so supervision logic is testable without the real binary.
#[async_trait]
pub trait CoordinatorLauncher: Send + Sync {
    /// Launch a process for the given spec
    async fn launch(
        &self,
        spec: &LaunchSpec,
    ) -> anyhow::Result<Box<dyn CoordinatorProcess>>;
}

/// Real launcher: spawns the coordinator binary as a subprocess
pub struct ProcessLauncher {
    binary: String,
}

impl ProcessLauncher {
    /// Create a launcher for the configured binary
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl CoordinatorLauncher for ProcessLauncher {
    async fn launch(
        &self,
        spec: &LaunchSpec,
    ) -> anyhow::Result<Box<dyn CoordinatorProcess>> {
        let rpc_list = spec.rpc_backends.join(",");
        tracing::info!(
            binary = %self.binary,
            model = %spec.model_path.display(),
            port = spec.port,
            rpc = %rpc_list,
            "launching coordinator"
        );

        let mut child = tokio::process::Command::new(&self.binary)
            .arg("--model")
            .arg(&spec.model_path)
            .arg("--host")
            .arg(&spec.bind_host)
            .arg("--port")
            .arg(spec.port.to_string())
            .arg("--rpc")
            .arg(rpc_list)
            .arg("--gpu-layers")
            .arg(spec.gpu_layers.to_string())
            .arg("--ctx-size")
            .arg(spec.ctx_size.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Stream subprocess output for observability (layer-distribution
        // progress shows up here) without ever blocking callers.
        if let Some(stdout) = child.stdout.take() {
            let port = spec.port;
            tokio::spawn(async move {
                let mut lines = LinesStream::new(BufReader::new(stdout).lines());
                while let Some(Ok(line)) = futures::StreamExt::next(&mut lines).await {
                    tracing::debug!(coordinator = port, "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let port = spec.port;
            tokio::spawn(async move {
                let mut lines = LinesStream::new(BufReader::new(stderr).lines());
                while let Some(Ok(line)) = futures::StreamExt::next(&mut lines).await {
                    tracing::debug!(coordinator = port, "{line}");
                }
            });
        }

        Ok(Box::new(LaunchedProcess {
            child,
            base_url: format!("http://{}:{}", spec.bind_host, spec.port),
            http: reqwest::Client::new(),
        }))
    }
}

struct LaunchedProcess {
    child: tokio::process::Child,
    base_url: String,
    http: reqwest::Client,
}

#[async_trait]
impl CoordinatorProcess for LaunchedProcess {
    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), ReadyError> {
        let deadline = Instant::now() + timeout;
        let health_url = format!("{}/health", self.base_url);

        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(ReadyError::Failed(format!(
                    "coordinator exited during startup: {status}"
                )));
            }

            let healthy = self
                .http
                .get(&health_url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if healthy {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(ReadyError::TimedOut);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn shutdown(&mut self) {
        if self.child.start_kill().is_ok() {
            let _ = self.child.wait().await;
        }
    }
}

// ============================================================================
// Coordinator Handle
// ============================================================================

/// Handle to a live (or once-live) coordinator
#[derive(Debug)]
pub struct Coordinator {
    model: String,
    key: String,
    address: String,
    backend_addresses: Vec<String>,
    state_tx: Arc<watch::Sender<CoordinatorState>>,
    state_rx: watch::Receiver<CoordinatorState>,
    http: reqwest::Client,
    inflight: AtomicUsize,
    last_used: RwLock<Instant>,
}

impl Coordinator {
    /// Model this coordinator serves
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// `host:port` of the coordinator's HTTP API
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Addresses of the backends this coordinator shards across
    #[must_use]
    pub fn backend_addresses(&self) -> &[String] {
        &self.backend_addresses
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        self.state_rx.borrow().clone()
    }

    /// Whether requests can be forwarded right now
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state().is_available()
    }

    /// Requests in flight
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// How long since the last forwarded request finished
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        if self.inflight() > 0 {
            Duration::ZERO
        } else {
            self.last_used.read().elapsed()
        }
    }

    fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    /// Proxy a request to the coordinator's completion endpoint
    ///
    /// Chat payloads go to the OpenAI-compatible endpoint, prompt payloads
    /// to the native completion endpoint; both come back as the uniform
    /// [`InferenceResponse`].
    pub async fn forward(
        &self,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, RouteError> {
        if !self.is_available() {
            return Err(RouteError::CoordinatorRequest(format!(
                "coordinator for '{}' is {:?}",
                self.model,
                self.state()
            )));
        }

        self.inflight.fetch_add(1, Ordering::AcqRel);
        // First forwarded request moves Ready -> Serving.
        self.state_tx.send_if_modified(|state| {
            if *state == CoordinatorState::Ready {
                *state = CoordinatorState::Serving;
                true
            } else {
                false
            }
        });

        let result = self.forward_inner(request).await;

        *self.last_used.write() = Instant::now();
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        result
    }

    async fn forward_inner(
        &self,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, RouteError> {
        let start = Instant::now();
        let max_tokens = if request.max_tokens > 0 {
            request.max_tokens
        } else {
            512
        };

        let (url, payload) = if request.messages.is_empty() {
            (
                format!("http://{}/completion", self.address),
                serde_json::json!({
                    "prompt": request.prompt.clone().unwrap_or_default(),
                    "n_predict": max_tokens,
                    "temperature": request.temperature,
                    "stream": false,
                }),
            )
        } else {
            (
                format!("http://{}/v1/chat/completions", self.address),
                serde_json::json!({
                    "messages": request.messages,
                    "max_tokens": max_tokens,
                    "temperature": request.temperature,
                    "stream": false,
                }),
            )
        };

        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RouteError::CoordinatorRequest(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RouteError::CoordinatorRequest(format!(
                "coordinator returned {status}: {body}"
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RouteError::CoordinatorRequest(e.to_string()))?;

        let (content, tokens_used) = if request.messages.is_empty() {
            (
                data.get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or("")
                    .to_string(),
                data.get("tokens_predicted")
                    .and_then(serde_json::Value::as_u64)
                    .map(|t| t as u32),
            )
        } else {
            (
                data.get("choices")
                    .and_then(|c| c.as_array())
                    .and_then(|c| c.first())
                    .and_then(|c| c.get("message"))
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_str())
                    .unwrap_or("")
                    .to_string(),
                data.get("usage")
                    .and_then(|u| u.get("completion_tokens"))
                    .and_then(serde_json::Value::as_u64)
                    .map(|t| t as u32),
            )
        };

        Ok(InferenceResponse {
            content,
            model: request.model.clone(),
            tokens_used,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

struct CoordinatorCell {
    coordinator: Arc<Coordinator>,
    shutdown: Arc<Notify>,
}

// ============================================================================
// Supervisor
// ============================================================================

/// Owns coordinator lifecycles: spawn coalescing, readiness, idle teardown
pub struct CoordinatorSupervisor {
    cells: DashMap<String, Arc<CoordinatorCell>>,
    registry: Arc<BackendRegistry>,
    resolver: Arc<WeightResolver>,
    launcher: Arc<dyn CoordinatorLauncher>,
    config: CoordinatorConfig,
    port_counter: AtomicU32,
}

impl CoordinatorSupervisor {
    /// Create a supervisor using the real process launcher
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        resolver: Arc<WeightResolver>,
        config: CoordinatorConfig,
    ) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(config.binary.clone()));
        Self::with_launcher(registry, resolver, config, launcher)
    }

    /// Create a supervisor with an injected launcher (the test seam)
    #[must_use]
    pub fn with_launcher(
        registry: Arc<BackendRegistry>,
        resolver: Arc<WeightResolver>,
        config: CoordinatorConfig,
        launcher: Arc<dyn CoordinatorLauncher>,
    ) -> Self {
        Self {
            cells: DashMap::new(),
            registry,
            resolver,
            launcher,
            config,
            port_counter: AtomicU32::new(0),
        }
    }

    /// Number of tracked coordinators
    #[must_use]
    pub fn count(&self) -> usize {
        self.cells.len()
    }

    /// Number of coordinators currently able to serve
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|cell| cell.coordinator.is_available())
            .count()
    }

    fn make_key(model: &str, backends: &[RpcBackend]) -> String {
        let mut addresses: Vec<String> = backends.iter().map(RpcBackend::address).collect();
        addresses.sort();
        format!("{}@{}", model, addresses.join(","))
    }

    fn allocate_port(&self) -> u16 {
        let n = self.port_counter.fetch_add(1, Ordering::Relaxed);
        self.config.base_port.wrapping_add((n % 512) as u16)
    }

    /// Get a ready coordinator for (model, backend set), spawning at most
    /// one subprocess per key
    ///
    /// A Ready/Serving coordinator for the exact key is reused. Otherwise
    /// the first caller spawns and everyone else awaits the same outcome.
    /// A caller that outlives the startup timeout kills the half-started
    /// process before its error propagates.
    pub async fn ensure_ready(
        &self,
        model: &str,
        backends: &[RpcBackend],
    ) -> Result<Arc<Coordinator>, RouteError> {
        if backends.is_empty() {
            return Err(RouteError::CoordinatorRequest(
                "no rpc backends available for sharding".to_string(),
            ));
        }

        let params = ModelSpec::estimate(model).parameters_b;
        let startup_timeout = self.config.startup_timeout(params);
        let key = Self::make_key(model, backends);

        // A cell can be found already Stopped (idle teardown raced us);
        // one respawn is allowed before giving up.
        for _attempt in 0..2 {
            let cell = match self.cells.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    let cell = self.spawn_cell(model, &key, backends, startup_timeout);
                    entry.insert(cell.clone());
                    cell
                }
            };

            let mut rx = cell.coordinator.subscribe();
            let outcome = tokio::time::timeout(startup_timeout, async {
                loop {
                    let state = rx.borrow_and_update().clone();
                    match state {
                        CoordinatorState::Ready | CoordinatorState::Serving => {
                            return Ok(());
                        }
                        CoordinatorState::Stopped => return Err(None),
                        CoordinatorState::Failed(reason) => return Err(Some(reason)),
                        _ => {}
                    }
                    if rx.changed().await.is_err() {
                        return Err(None);
                    }
                }
            })
            .await;

            match outcome {
                Ok(Ok(())) => return Ok(cell.coordinator.clone()),
                Ok(Err(Some(reason))) => {
                    self.remove_cell(&key, &cell);
                    return Err(Self::map_failure(reason, model, startup_timeout));
                }
                Ok(Err(None)) => {
                    // Stopped under us; retry with a fresh spawn.
                    self.remove_cell(&key, &cell);
                }
                Err(_) => {
                    // Caller timed out: make sure the half-started process
                    // dies before the error surfaces. notify_one stores a
                    // permit, so the signal lands even if the supervision
                    // task is mid-launch.
                    cell.shutdown.notify_one();
                    self.remove_cell(&key, &cell);
                    return Err(RouteError::CoordinatorStartupTimeout {
                        model: model.to_string(),
                        waited: startup_timeout,
                    });
                }
            }
        }

        Err(RouteError::CoordinatorRequest(format!(
            "coordinator for '{model}' kept stopping during startup"
        )))
    }

    /// Proxy a request through a coordinator
    pub async fn forward(
        &self,
        coordinator: &Coordinator,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, RouteError> {
        coordinator.forward(request).await
    }

    /// Stop a coordinator and release its backends
    pub async fn stop(&self, coordinator: &Arc<Coordinator>) {
        let key = coordinator.key.clone();
        if let Some((_, cell)) = self
            .cells
            .remove_if(&key, |_, cell| Arc::ptr_eq(&cell.coordinator, coordinator))
        {
            cell.shutdown.notify_one();
            Self::await_terminal(&cell).await;
        }
    }

    /// Stop every coordinator
    pub async fn stop_all(&self) {
        let cells: Vec<_> = self.cells.iter().map(|e| e.value().clone()).collect();
        self.cells.clear();
        for cell in cells {
            cell.shutdown.notify_one();
            Self::await_terminal(&cell).await;
        }
    }

    async fn await_terminal(cell: &Arc<CoordinatorCell>) {
        let mut rx = cell.coordinator.subscribe();
        let _ = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
    }

    fn remove_cell(&self, key: &str, cell: &Arc<CoordinatorCell>) {
        self.cells
            .remove_if(key, |_, existing| Arc::ptr_eq(existing, cell));
    }

    fn map_failure(reason: FailReason, model: &str, waited: Duration) -> RouteError {
        match reason {
            FailReason::ModelNotFound(detail) => RouteError::ModelNotFound {
                model: model.to_string(),
                detail,
            },
            FailReason::Launch(detail) => {
                RouteError::CoordinatorRequest(format!("launch failed: {detail}"))
            }
            FailReason::StartupTimeout => RouteError::CoordinatorStartupTimeout {
                model: model.to_string(),
                waited,
            },
            FailReason::Startup(detail) => {
                RouteError::CoordinatorRequest(format!("startup failed: {detail}"))
            }
        }
    }

    fn spawn_cell(
        &self,
        model: &str,
        key: &str,
        backends: &[RpcBackend],
        startup_timeout: Duration,
    ) -> Arc<CoordinatorCell> {
        let port = self.allocate_port();
        let address = format!("{}:{}", self.config.bind_host, port);
        let backend_addresses: Vec<String> = backends.iter().map(RpcBackend::address).collect();

        let (state_tx, state_rx) = watch::channel(CoordinatorState::Unstarted);
        let state_tx = Arc::new(state_tx);

        let coordinator = Arc::new(Coordinator {
            model: model.to_string(),
            key: key.to_string(),
            address,
            backend_addresses: backend_addresses.clone(),
            state_tx: state_tx.clone(),
            state_rx,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .expect("failed to create HTTP client"),
            inflight: AtomicUsize::new(0),
            last_used: RwLock::new(Instant::now()),
        });

        let shutdown = Arc::new(Notify::new());
        let cell = Arc::new(CoordinatorCell {
            coordinator: coordinator.clone(),
            shutdown: shutdown.clone(),
        });

        // The backend set is held for the whole coordinator session; the
        // registry's stale-tolerant window starts now.
        self.registry.mark_session_active(&backend_addresses);

        let spec = LaunchSpec {
            model_path: PathBuf::new(), // filled in after resolution
            bind_host: self.config.bind_host.clone(),
            port,
            rpc_backends: backend_addresses.clone(),
            gpu_layers: self.config.gpu_layers,
            ctx_size: self.config.ctx_size,
        };

        tokio::spawn(supervise(
            coordinator,
            state_tx,
            shutdown,
            spec,
            SuperviseContext {
                registry: self.registry.clone(),
                resolver: self.resolver.clone(),
                launcher: self.launcher.clone(),
                startup_timeout,
                keep_warm: self.config.keep_warm,
                idle_timeout: self.config.idle_timeout(),
            },
        ));

        cell
    }
}

struct SuperviseContext {
    registry: Arc<BackendRegistry>,
    resolver: Arc<WeightResolver>,
    launcher: Arc<dyn CoordinatorLauncher>,
    startup_timeout: Duration,
    keep_warm: bool,
    idle_timeout: Duration,
}

/// One coordinator's supervision task: owns the subprocess from spawn to
/// termination and publishes every state transition.
async fn supervise(
    coordinator: Arc<Coordinator>,
    state_tx: Arc<watch::Sender<CoordinatorState>>,
    shutdown: Arc<Notify>,
    mut spec: LaunchSpec,
    ctx: SuperviseContext,
) {
    let model = coordinator.model.clone();
    let backend_addresses = coordinator.backend_addresses.clone();

    let publish = |state: CoordinatorState| {
        let _ = state_tx.send(state);
    };

    let fail = |reason: FailReason| {
        tracing::warn!(model = %model, ?reason, "coordinator failed");
        let _ = state_tx.send(CoordinatorState::Failed(reason));
    };

    publish(CoordinatorState::ResolvingModel);
    let model_path = match ctx.resolver.resolve(&model).await {
        Ok(path) => path,
        Err(RouteError::ModelNotFound { detail, .. }) => {
            fail(FailReason::ModelNotFound(detail));
            ctx.registry.mark_session_released(&backend_addresses);
            return;
        }
        Err(e) => {
            fail(FailReason::Launch(e.to_string()));
            ctx.registry.mark_session_released(&backend_addresses);
            return;
        }
    };
    spec.model_path = model_path;

    publish(CoordinatorState::Starting);
    let mut process = match ctx.launcher.launch(&spec).await {
        Ok(process) => process,
        Err(e) => {
            fail(FailReason::Launch(e.to_string()));
            ctx.registry.mark_session_released(&backend_addresses);
            return;
        }
    };

    publish(CoordinatorState::Loading);
    let ready = tokio::select! {
        result = process.wait_ready(ctx.startup_timeout) => Some(result),
        () = shutdown.notified() => None,
    };
    match ready {
        Some(Ok(())) => {
            tracing::info!(
                model = %model,
                address = %coordinator.address,
                backends = backend_addresses.len(),
                "coordinator ready"
            );
            publish(CoordinatorState::Ready);
        }
        Some(Err(ReadyError::TimedOut)) => {
            process.shutdown().await;
            fail(FailReason::StartupTimeout);
            ctx.registry.mark_session_released(&backend_addresses);
            return;
        }
        Some(Err(ReadyError::Failed(detail))) => {
            process.shutdown().await;
            fail(FailReason::Startup(detail));
            ctx.registry.mark_session_released(&backend_addresses);
            return;
        }
        None => {
            process.shutdown().await;
            publish(CoordinatorState::Stopped);
            ctx.registry.mark_session_released(&backend_addresses);
            return;
        }
    }

    // Serve until an explicit stop or, for ephemeral coordinators, until
    // the model has sat idle long enough.
    let idle_check = (ctx.idle_timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(10));
    loop {
        tokio::select! {
            () = shutdown.notified() => break,
            () = tokio::time::sleep(idle_check) => {
                if !ctx.keep_warm
                    && coordinator.inflight() == 0
                    && coordinator.idle_for() >= ctx.idle_timeout
                {
                    tracing::info!(model = %model, "stopping idle coordinator");
                    break;
                }
            }
        }
    }

    process.shutdown().await;
    publish(CoordinatorState::Stopped);
    ctx.registry.mark_session_released(&backend_addresses);
    tracing::info!(model = %model, "coordinator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_order_insensitive() {
        let a = [
            RpcBackend::new("10.0.0.2", 50052),
            RpcBackend::new("10.0.0.1", 50052),
        ];
        let b = [
            RpcBackend::new("10.0.0.1", 50052),
            RpcBackend::new("10.0.0.2", 50052),
        ];
        assert_eq!(
            CoordinatorSupervisor::make_key("llama3.1:70b", &a),
            CoordinatorSupervisor::make_key("llama3.1:70b", &b),
        );
    }

    #[test]
    fn test_key_differs_by_model_and_backends() {
        let backends = [RpcBackend::new("10.0.0.1", 50052)];
        let more = [
            RpcBackend::new("10.0.0.1", 50052),
            RpcBackend::new("10.0.0.2", 50052),
        ];
        assert_ne!(
            CoordinatorSupervisor::make_key("a:70b", &backends),
            CoordinatorSupervisor::make_key("b:70b", &backends),
        );
        assert_ne!(
            CoordinatorSupervisor::make_key("a:70b", &backends),
            CoordinatorSupervisor::make_key("a:70b", &more),
        );
    }

    #[test]
    fn test_state_predicates() {
        assert!(CoordinatorState::Ready.is_available());
        assert!(CoordinatorState::Serving.is_available());
        assert!(!CoordinatorState::Loading.is_available());
        assert!(CoordinatorState::Stopped.is_terminal());
        assert!(CoordinatorState::Failed(FailReason::StartupTimeout).is_terminal());
        assert!(!CoordinatorState::Ready.is_terminal());
    }
}
