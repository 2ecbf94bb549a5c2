//! Model Sharding
//!
//! When a model is too large for any single node, its layers are split
//! across a set of RPC backends fronted by an ephemeral coordinator
//! subprocess. This module owns the backend registry with its
//! stale-tolerant health cache, local weight resolution, and the
//! coordinator lifecycle.
//!
//! # Architecture
//!
//! ```text
//! +-------------------+
//! |   HybridRouter    |
//! +---------+---------+
//!           |
//!           v
//! +-------------------+       +--------------------+
//! | CoordinatorSuper- | <---> |  BackendRegistry   |
//! | visor (lifecycle) |       |  (health cache)    |
//! +---------+---------+       +--------------------+
//!           |
//!           v  spawns, HTTP
//! +-------------------+  opaque RPC   +----------+
//! |   coordinator     | ------------> | backends |
//! |   subprocess      |               | (layers) |
//! +-------------------+               +----------+
//! ```
//!
//! The coordinator's protocol to its backends is opaque; this core only
//! ever talks to the coordinator's HTTP surface.

pub mod backend;
pub mod coordinator;
pub mod registry;
pub mod resolver;

pub use backend::{BackendHealth, RpcBackend};
pub use coordinator::{
    Coordinator, CoordinatorLauncher, CoordinatorProcess, CoordinatorState, CoordinatorSupervisor,
    FailReason, LaunchSpec, ProcessLauncher, ReadyError,
};
pub use registry::{BackendRegistry, BackendSnapshot};
pub use resolver::WeightResolver;
