//! Logging Initialization
//!
//! Convenience setup for embedders and binaries. The library itself only
//! emits `tracing` events; installing a subscriber is the host's choice.

use tracing_subscriber::EnvFilter;

/// Install a formatted tracing subscriber
///
/// Respects `RUST_LOG` when set, otherwise falls back to the given
/// directive (e.g., `"flotilla_core=info"`). Safe to call more than once:
/// later calls are no-ops.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
