//! Backend Registry
//!
//! Tracks configured and discovered RPC backends with a stale-tolerant
//! health cache. The defining behavior: while a coordinator holds active
//! connections to a backend, failed probes do NOT downgrade it: the
//! backend's connection backlog is saturated by real traffic, and the
//! registry keeps the last good status as `AssumedHealthy` until the TTL
//! runs out. Only repeated failures outside an active session mark a
//! backend `Failed`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;

use super::backend::{self, BackendHealth, RpcBackend};
use crate::config::{BackendEntry, DiscoveryConfig, HealthConfig};
use crate::locality::{cidr_hosts, detect_local_cidr};

/// Consecutive out-of-session failures required to mark a backend Failed
const FAILURE_THRESHOLD: u32 = 2;

#[derive(Debug)]
struct BackendState {
    backend: RpcBackend,
    health: BackendHealth,
    last_probe: Option<Instant>,
    last_confirmed: Option<Instant>,
    consecutive_failures: u32,
}

/// Serializable view of one backend's cached state
#[derive(Clone, Debug, Serialize)]
pub struct BackendSnapshot {
    /// Backend host
    pub host: String,
    /// Backend port
    pub port: u16,
    /// Cached health tag
    pub health: BackendHealth,
    /// Whether a coordinator currently holds this backend
    pub in_active_session: bool,
    /// Seconds since the last successful probe, if any
    pub secs_since_confirmed: Option<u64>,
}

/// Registry of sharding backends with stale-tolerant health caching
pub struct BackendRegistry {
    states: DashMap<String, BackendState>,
    active_sessions: DashMap<String, usize>,
    stale_ttl: Duration,
    probe_timeout: Duration,
    probe_interval: Duration,
}

impl BackendRegistry {
    /// Create a registry with the given health tunables
    #[must_use]
    pub fn new(health: &HealthConfig) -> Self {
        Self {
            states: DashMap::new(),
            active_sessions: DashMap::new(),
            stale_ttl: health.backend_stale_ttl(),
            probe_timeout: Duration::from_millis(health.probe_timeout_ms),
            probe_interval: Duration::from_secs(health.probe_interval_secs.max(1)),
        }
    }

    /// Create a registry pre-populated from configuration
    ///
    /// Entries are registered without probing; call
    /// [`BackendRegistry::probe_all`] (or let the monitor run) to confirm
    /// them.
    #[must_use]
    pub fn from_entries(entries: &[BackendEntry], health: &HealthConfig) -> Self {
        let registry = Self::new(health);
        for entry in entries {
            registry.register(RpcBackend::from(entry));
        }
        registry
    }

    /// Register a backend, de-duplicated by (host, port)
    ///
    /// Returns false if the backend was already present.
    pub fn register(&self, backend: RpcBackend) -> bool {
        let address = backend.address();
        let mut inserted = false;
        self.states.entry(address.clone()).or_insert_with(|| {
            inserted = true;
            BackendState {
                backend,
                // Unprobed backends start available; the first probe settles it.
                health: BackendHealth::AssumedHealthy,
                last_probe: None,
                last_confirmed: None,
                consecutive_failures: 0,
            }
        });
        if inserted {
            tracing::info!(backend = %address, "rpc backend registered");
        }
        inserted
    }

    /// Register a backend and probe it once
    ///
    /// A successful probe at registration sets `Confirmed`.
    pub async fn register_and_probe(&self, backend: RpcBackend) -> BackendHealth {
        let address = backend.address();
        self.register(backend.clone());
        let up = backend::probe(&backend, self.probe_timeout).await;
        self.record_probe(&address, up);
        self.health_of(&address).unwrap_or(BackendHealth::Failed)
    }

    /// Number of registered backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no backends are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Cached health for an address
    #[must_use]
    pub fn health_of(&self, address: &str) -> Option<BackendHealth> {
        self.states.get(address).map(|s| s.health)
    }

    /// Backends eligible for a new coordinator (anything not `Failed`)
    #[must_use]
    pub fn available_backends(&self) -> Vec<RpcBackend> {
        let mut backends: Vec<_> = self
            .states
            .iter()
            .filter(|entry| entry.health.is_available())
            .map(|entry| entry.backend.clone())
            .collect();
        backends.sort_by(|a, b| a.address().cmp(&b.address()));
        backends
    }

    /// Snapshot of every backend's cached state
    #[must_use]
    pub fn snapshots(&self) -> Vec<BackendSnapshot> {
        let mut snapshots: Vec<_> = self
            .states
            .iter()
            .map(|entry| BackendSnapshot {
                host: entry.backend.host.clone(),
                port: entry.backend.port,
                health: entry.health,
                in_active_session: self.is_session_active(entry.key()),
                secs_since_confirmed: entry.last_confirmed.map(|t| t.elapsed().as_secs()),
            })
            .collect();
        snapshots.sort_by(|a, b| (a.host.clone(), a.port).cmp(&(b.host.clone(), b.port)));
        snapshots
    }

    /// Mark a backend set as held by an active coordinator
    pub fn mark_session_active(&self, addresses: &[String]) {
        for address in addresses {
            *self.active_sessions.entry(address.clone()).or_insert(0) += 1;
        }
    }

    /// Release a backend set when its coordinator stops
    pub fn mark_session_released(&self, addresses: &[String]) {
        for address in addresses {
            if let Some(mut count) = self.active_sessions.get_mut(address) {
                *count = count.saturating_sub(1);
            }
        }
        self.active_sessions.retain(|_, count| *count > 0);
    }

    /// Whether any coordinator currently holds this backend
    #[must_use]
    pub fn is_session_active(&self, address: &str) -> bool {
        self.active_sessions
            .get(address)
            .is_some_and(|count| *count > 0)
    }

    /// Apply one probe result to the cache
    ///
    /// See the module docs for the downgrade rules. A probe disagreement
    /// during an active session is expected operation, logged at debug and
    /// never as an error.
    pub fn record_probe(&self, address: &str, success: bool) {
        let in_session = self.is_session_active(address);
        let Some(mut state) = self.states.get_mut(address) else {
            return;
        };

        let now = Instant::now();
        state.last_probe = Some(now);

        if success {
            if state.health == BackendHealth::Failed {
                tracing::info!(backend = %address, "backend recovered");
            }
            state.health = BackendHealth::Confirmed;
            state.last_confirmed = Some(now);
            state.consecutive_failures = 0;
            return;
        }

        let within_ttl = state
            .last_confirmed
            .is_some_and(|t| t.elapsed() < self.stale_ttl);

        if in_session && within_ttl {
            // Expected: the backend's backlog is full of coordinator
            // traffic. Keep the last good status.
            state.health = BackendHealth::AssumedHealthy;
            state.consecutive_failures = 0;
            tracing::debug!(
                backend = %address,
                "probe failed during active session; assuming healthy"
            );
            return;
        }

        state.consecutive_failures += 1;
        if state.consecutive_failures >= FAILURE_THRESHOLD
            && state.health != BackendHealth::Failed
        {
            tracing::warn!(
                backend = %address,
                failures = state.consecutive_failures,
                "backend marked failed"
            );
            state.health = BackendHealth::Failed;
        }
    }

    /// Probe every backend once
    pub async fn probe_all(&self) {
        let backends: Vec<RpcBackend> = self
            .states
            .iter()
            .map(|entry| entry.backend.clone())
            .collect();

        let probes = backends.into_iter().map(|b| {
            let timeout = self.probe_timeout;
            async move {
                let up = backend::probe(&b, timeout).await;
                (b.address(), up)
            }
        });

        for (address, up) in futures::future::join_all(probes).await {
            self.record_probe(&address, up);
        }
    }

    /// Spawn the background health monitor
    pub fn spawn_health_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                let jitter_ms = rand::thread_rng().gen_range(0..1_000);
                tokio::time::sleep(registry.probe_interval + Duration::from_millis(jitter_ms))
                    .await;
                registry.probe_all().await;
            }
        })
    }

    /// Scan a subnet for backends on the well-known RPC port
    ///
    /// Discovered backends merge with explicit configuration, de-duplicated
    /// by (host, port).
    pub async fn discover(&self, discovery: &DiscoveryConfig) -> Vec<RpcBackend> {
        let cidr = if discovery.cidr.is_empty() {
            match detect_local_cidr() {
                Some(cidr) => cidr,
                None => {
                    tracing::warn!("could not detect local network; skipping backend discovery");
                    return Vec::new();
                }
            }
        } else {
            discovery.cidr.clone()
        };

        let port = discovery.rpc_port;
        let timeout = Duration::from_millis(discovery.probe_timeout_ms);
        tracing::info!(%cidr, port, "scanning for rpc backends");

        let probes = cidr_hosts(&cidr).into_iter().map(|ip| async move {
            let candidate = RpcBackend::new(ip.to_string(), port);
            backend::probe(&candidate, timeout)
                .await
                .then_some(candidate)
        });

        let mut discovered = Vec::new();
        let results = futures::stream::iter(probes)
            .buffer_unordered(50)
            .collect::<Vec<_>>()
            .await;

        for candidate in results.into_iter().flatten() {
            let address = candidate.address();
            self.register(candidate.clone());
            self.record_probe(&address, true);
            discovered.push(candidate);
        }

        tracing::info!(count = discovered.len(), "backend discovery finished");
        discovered
    }
}
