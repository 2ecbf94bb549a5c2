//! RPC Backends
//!
//! A backend is a worker process holding a subset of a sharded model's
//! layers. It speaks an RPC protocol only its coordinator understands, so
//! the deepest health check this core can do is a TCP connect to its port.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BackendEntry;

/// Well-known RPC port for sharding backends
pub const DEFAULT_RPC_PORT: u16 = 50052;

/// Address of one layer-sharding backend
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpcBackend {
    /// Backend host
    pub host: String,
    /// Backend RPC port
    pub port: u16,
}

impl RpcBackend {
    /// Create a backend address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form used on coordinator command lines and as the
    /// registry key
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&BackendEntry> for RpcBackend {
    fn from(entry: &BackendEntry) -> Self {
        Self::new(entry.host.clone(), entry.port)
    }
}

impl std::fmt::Display for RpcBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Cached health of a backend: three states, deliberately not a boolean
///
/// A busy backend's connection backlog is saturated by legitimate
/// coordinator traffic, so probe failures during an active session say
/// nothing about its health. `AssumedHealthy` preserves that nuance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendHealth {
    /// A probe succeeded and nothing has contradicted it
    Confirmed,
    /// Probes are failing, but the backend is inside an active coordinator
    /// session and its last good probe is within the stale TTL
    AssumedHealthy,
    /// Repeated probe failures outside any active session
    Failed,
}

impl BackendHealth {
    /// Whether this backend may appear in candidate sets
    #[must_use]
    pub fn is_available(self) -> bool {
        !matches!(self, Self::Failed)
    }

    /// Stable label for logs and snapshots
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::AssumedHealthy => "assumed-healthy",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Probe a backend with a TCP connect
///
/// The RPC protocol is opaque to this core; reachability of the port is
/// the whole check.
pub async fn probe(backend: &RpcBackend, timeout: Duration) -> bool {
    let addr = backend.address();
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_form() {
        let backend = RpcBackend::new("10.0.0.7", 50052);
        assert_eq!(backend.address(), "10.0.0.7:50052");
    }

    #[test]
    fn test_availability() {
        assert!(BackendHealth::Confirmed.is_available());
        assert!(BackendHealth::AssumedHealthy.is_available());
        assert!(!BackendHealth::Failed.is_available());
    }

    #[tokio::test]
    async fn test_probe_succeeds_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let backend = RpcBackend::new("127.0.0.1", port);

        assert!(probe(&backend, Duration::from_millis(500)).await);
        drop(listener);
    }

    #[tokio::test]
    async fn test_probe_fails_against_closed_port() {
        // Bind then drop to find a port that is definitely closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let backend = RpcBackend::new("127.0.0.1", port);
        assert!(!probe(&backend, Duration::from_millis(500)).await);
    }
}
