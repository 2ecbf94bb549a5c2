//! Error Types
//!
//! Typed errors for the routing core. Stale cached health is deliberately
//! not represented here: an `AssumedHealthy` backend is a defined state,
//! not a failure, and never blocks routing.

use std::time::Duration;

use thiserror::Error;

use crate::api::RoutePath;

/// One failed attempt at an execution path, kept for the final error report
#[derive(Clone, Debug)]
pub struct PathAttempt {
    /// Path that was attempted
    pub path: RoutePath,
    /// Target that was selected, if selection got that far
    pub target: Option<String>,
    /// Why the attempt failed
    pub detail: String,
}

impl std::fmt::Display for PathAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{} via {}: {}", self.path, target, self.detail),
            None => write!(f, "{}: {}", self.path, self.detail),
        }
    }
}

/// Errors surfaced by the hybrid router and its execution paths
#[derive(Debug, Error)]
pub enum RouteError {
    /// No viable execution path is configured
    #[error("no viable execution path configured: {0}")]
    Configuration(String),

    /// The sharding path could not locate the model's weight file locally
    #[error("model '{model}' not found in local store: {detail}; fetch the model first")]
    ModelNotFound {
        /// Requested model name/tag
        model: String,
        /// What the resolver looked for
        detail: String,
    },

    /// The coordinator subprocess did not become ready in time
    ///
    /// The half-started process is killed before this error propagates.
    #[error("coordinator for '{model}' not ready after {}s", waited.as_secs())]
    CoordinatorStartupTimeout {
        /// Model the coordinator was loading
        model: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// A ready coordinator failed mid-request
    #[error("coordinator request failed: {0}")]
    CoordinatorRequest(String),

    /// No healthy task-distribution node could take the request
    #[error("no healthy worker node available: {0}")]
    NodeUnavailable(String),

    /// Every configured path was attempted and failed
    #[error("all execution paths failed: {}", format_attempts(attempts))]
    AllPathsFailed {
        /// Each attempted path with its failure reason
        attempts: Vec<PathAttempt>,
    },
}

fn format_attempts(attempts: &[PathAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl RouteError {
    /// Whether a fallback to the other path is worth attempting
    ///
    /// Configuration and total-failure errors are terminal; path-local
    /// failures are candidates for the single fallback attempt.
    #[must_use]
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            Self::ModelNotFound { .. }
                | Self::CoordinatorStartupTimeout { .. }
                | Self::CoordinatorRequest(_)
                | Self::NodeUnavailable(_)
        )
    }
}
