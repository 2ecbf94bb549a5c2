//! Worker Nodes
//!
//! A worker node is a full-model inference server (Ollama-compatible API)
//! that takes complete requests. This module owns the per-node HTTP client
//! and the node's cached health and rolling performance state. The cache is
//! what request handling reads; probes happen on background workers only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::api::{InferenceRequest, InferenceResponse};
use crate::locality::PhysicalHostId;

// ============================================================================
// Node State
// ============================================================================

/// Hardware capabilities learned from probing
#[derive(Clone, Debug, Default, Serialize)]
pub struct NodeCapabilities {
    /// Whether the node appears to run models on a GPU
    pub has_gpu: bool,
    /// Free GPU memory in MB (0 when unknown)
    pub gpu_free_mb: u64,
    /// Models currently available on the node
    pub models: Vec<String>,
}

#[derive(Debug)]
struct NodeState {
    healthy: bool,
    consecutive_failures: u32,
    avg_latency_ms: f64,
    total_requests: u64,
    failed_requests: u64,
    last_probe: Option<Instant>,
    capabilities: NodeCapabilities,
}

impl NodeState {
    fn new() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            total_requests: 0,
            failed_requests: 0,
            last_probe: None,
            capabilities: NodeCapabilities::default(),
        }
    }
}

/// Point-in-time view of a node used for scoring and stats
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    /// Node URL
    pub url: String,
    /// Friendly name
    pub name: String,
    /// Configured priority (higher = preferred)
    pub priority: i32,
    /// Registration order, for deterministic tie-breaks
    pub ordinal: u64,
    /// Cached health
    pub healthy: bool,
    /// Rolling average request latency (EMA)
    pub avg_latency_ms: f64,
    /// Lifetime success rate
    pub success_rate: f64,
    /// Requests in flight right now
    pub inflight: usize,
    /// Probed capabilities
    pub capabilities: NodeCapabilities,
}

/// A registered worker node
pub struct WorkerNode {
    url: String,
    name: String,
    priority: i32,
    ordinal: u64,
    physical_host: PhysicalHostId,
    client: NodeClient,
    inflight: AtomicUsize,
    state: RwLock<NodeState>,
}

impl WorkerNode {
    /// Create a node; `ordinal` is its registration position
    pub fn new(
        url: impl Into<String>,
        name: Option<String>,
        priority: i32,
        ordinal: u64,
        physical_host: PhysicalHostId,
    ) -> Self {
        let url = url.into();
        Self {
            client: NodeClient::new(&url),
            name: name.unwrap_or_else(|| url.clone()),
            url,
            priority,
            ordinal,
            physical_host,
            inflight: AtomicUsize::new(0),
            state: RwLock::new(NodeState::new()),
        }
    }

    /// Node URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Friendly name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical physical-host identity
    #[must_use]
    pub fn physical_host(&self) -> &PhysicalHostId {
        &self.physical_host
    }

    /// HTTP client for this node
    #[must_use]
    pub fn client(&self) -> &NodeClient {
        &self.client
    }

    /// Cached health; never triggers a probe
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state.read().healthy
    }

    /// Requests in flight
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Try to reserve an execution slot, bounded by `max_inflight`
    pub fn try_acquire_slot(&self, max_inflight: usize) -> bool {
        self.inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max_inflight).then_some(current + 1)
            })
            .is_ok()
    }

    /// Release a previously acquired slot
    pub fn release_slot(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            });
    }

    /// Apply a probe result to the cached health state
    ///
    /// A node only leaves the candidate set after `failure_threshold`
    /// consecutive failures; one success restores it.
    pub fn record_probe(&self, result: Option<ProbeReport>, failure_threshold: u32) {
        let mut state = self.state.write();
        state.last_probe = Some(Instant::now());
        match result {
            Some(report) => {
                if !state.healthy {
                    tracing::info!(node = %self.url, "node recovered");
                }
                state.healthy = true;
                state.consecutive_failures = 0;
                state.capabilities.models = report.models;
                if report.gpu_free_mb > 0 {
                    state.capabilities.has_gpu = true;
                    state.capabilities.gpu_free_mb = report.gpu_free_mb;
                }
            }
            None => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= failure_threshold && state.healthy {
                    tracing::warn!(
                        node = %self.url,
                        failures = state.consecutive_failures,
                        "node marked unhealthy"
                    );
                    state.healthy = false;
                }
            }
        }
    }

    /// Record a completed request's outcome into the rolling metrics
    pub fn record_result(&self, latency_ms: f64, success: bool) {
        const ALPHA: f64 = 0.3;

        let mut state = self.state.write();
        state.total_requests += 1;
        if success {
            if state.avg_latency_ms == 0.0 {
                state.avg_latency_ms = latency_ms;
            } else {
                state.avg_latency_ms = ALPHA * latency_ms + (1.0 - ALPHA) * state.avg_latency_ms;
            }
        } else {
            state.failed_requests += 1;
        }
    }

    /// Snapshot for scoring and stats
    #[must_use]
    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.read();
        let success_rate = if state.total_requests > 0 {
            (state.total_requests - state.failed_requests) as f64 / state.total_requests as f64
        } else {
            1.0
        };
        NodeSnapshot {
            url: self.url.clone(),
            name: self.name.clone(),
            priority: self.priority,
            ordinal: self.ordinal,
            healthy: state.healthy,
            avg_latency_ms: state.avg_latency_ms,
            success_rate,
            inflight: self.inflight(),
            capabilities: state.capabilities.clone(),
        }
    }
}

/// What a successful status probe reported
#[derive(Clone, Debug, Default)]
pub struct ProbeReport {
    /// Models available on the node
    pub models: Vec<String>,
    /// Free GPU memory in MB, 0 when not reported
    pub gpu_free_mb: u64,
}

// ============================================================================
// HTTP Client
// ============================================================================

/// A streaming response chunk from a node
#[derive(Clone, Debug)]
pub enum StreamChunk {
    /// A generated token
    Token(String),
    /// Generation finished; carries the full message
    Complete {
        /// Complete response text
        message: String,
    },
    /// Streaming failed partway
    Error(String),
}

/// HTTP client for one worker node
#[derive(Clone)]
pub struct NodeClient {
    base_url: String,
    http: reqwest::Client,
}

impl NodeClient {
    /// Create a client for a node URL
    pub fn new(url: &str) -> Self {
        Self {
            base_url: url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .expect("failed to create HTTP client"),
        }
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    fn ps_url(&self) -> String {
        format!("{}/api/ps", self.base_url)
    }

    /// Probe the node's status endpoint
    ///
    /// Success reports available models and, best effort, GPU residency
    /// from the running-models endpoint.
    pub async fn probe(&self, timeout: Duration) -> Option<ProbeReport> {
        let response = self
            .http
            .get(self.tags_url())
            .timeout(timeout)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let data: serde_json::Value = response.json().await.ok()?;
        let models = data
            .get("models")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()).map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut report = ProbeReport {
            models,
            gpu_free_mb: 0,
        };

        // GPU residency is best effort; nodes without the endpoint still
        // count as healthy.
        if let Ok(ps) = self
            .http
            .get(self.ps_url())
            .timeout(timeout)
            .send()
            .await
        {
            if let Ok(data) = ps.json::<serde_json::Value>().await {
                let vram: u64 = data
                    .get("models")
                    .and_then(|m| m.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|m| m.get("size_vram").and_then(serde_json::Value::as_u64))
                            .sum()
                    })
                    .unwrap_or(0);
                report.gpu_free_mb = vram / (1024 * 1024);
            }
        }

        Some(report)
    }

    /// Send a non-streaming completion request
    pub async fn generate(&self, request: &InferenceRequest) -> anyhow::Result<InferenceResponse> {
        let start = Instant::now();
        let use_chat = !request.messages.is_empty();
        let url = if use_chat {
            self.chat_url()
        } else {
            self.generate_url()
        };

        let payload = self.build_payload(request, false);
        let response = self.http.post(&url).json(&payload).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("node returned {status}: {body}");
        }

        let data: serde_json::Value = response.json().await?;
        let content = if use_chat {
            data.get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string()
        } else {
            data.get("response")
                .and_then(|r| r.as_str())
                .unwrap_or("")
                .to_string()
        };

        let tokens_used = data
            .get("eval_count")
            .and_then(serde_json::Value::as_u64)
            .map(|c| c as u32);

        Ok(InferenceResponse {
            content,
            model: request.model.clone(),
            tokens_used,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Send a streaming completion request
    ///
    /// Returns a channel of chunks; the channel closes after `Complete` or
    /// `Error`.
    pub async fn generate_streaming(
        &self,
        request: &InferenceRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamChunk>> {
        let (tx, rx) = mpsc::channel(100);
        let use_chat = !request.messages.is_empty();
        let url = if use_chat {
            self.chat_url()
        } else {
            self.generate_url()
        };

        let payload = self.build_payload(request, true);
        let response = self.http.post(&url).json(&payload).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("node returned {status}: {body}");
        }

        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut full_response = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Newline-delimited JSON frames.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(data) = serde_json::from_str::<serde_json::Value>(&line) else {
                        continue;
                    };

                    let token = if use_chat {
                        data.get("message")
                            .and_then(|m| m.get("content"))
                            .and_then(|c| c.as_str())
                    } else {
                        data.get("response").and_then(|r| r.as_str())
                    };
                    if let Some(token) = token {
                        full_response.push_str(token);
                        if tx.send(StreamChunk::Token(token.to_string())).await.is_err() {
                            return;
                        }
                    }

                    if data
                        .get("done")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false)
                    {
                        let _ = tx
                            .send(StreamChunk::Complete {
                                message: full_response,
                            })
                            .await;
                        return;
                    }
                }
            }

            if !full_response.is_empty() {
                let _ = tx
                    .send(StreamChunk::Complete {
                        message: full_response,
                    })
                    .await;
            }
        });

        Ok(rx)
    }

    fn build_payload(&self, request: &InferenceRequest, stream: bool) -> serde_json::Value {
        let mut payload = if request.messages.is_empty() {
            serde_json::json!({
                "model": request.model,
                "prompt": request.prompt.clone().unwrap_or_default(),
                "stream": stream,
            })
        } else {
            serde_json::json!({
                "model": request.model,
                "messages": request.messages,
                "stream": stream,
            })
        };

        let mut options = serde_json::Map::new();
        if (request.temperature - 0.7).abs() > f32::EPSILON {
            options.insert("temperature".to_string(), serde_json::json!(request.temperature));
        }
        if request.max_tokens > 0 {
            options.insert("num_predict".to_string(), serde_json::json!(request.max_tokens));
        }
        if !options.is_empty() {
            payload["options"] = serde_json::Value::Object(options);
        }
        payload
    }
}
