//! corral-smcontroller — the CM's northbound face to each node's SM.
//!
//! One [`SmClient`] per connected node carries the RPC surface; the
//! [`SmController`] multiplexes them: per-node config check/set, instance
//! run/stop, environment overrides, monitoring averages, and ingress
//! dispatch for the instance-status / log / monitoring / alert /
//! node-config streams flowing SM → CM.
//!
//! Transient RPC failures retry with jittered exponential backoff
//! (100 ms → 5 s). The controller implements the launcher's
//! [`InstanceRunner`](corral_launcher::InstanceRunner) and the unit
//! config's [`NodeConfigController`](corral_config::NodeConfigController)
//! seams directly.
//!
//! The SM-side resource manager is an external collaborator; only its
//! contract lives here ([`resources`]).

pub mod controller;
pub mod error;
pub mod resources;
pub mod retry;

pub use controller::{
    LogChunk, SmClient, SmConnectionObserver, SmController, SmIngressObserver,
};
pub use error::{SmError, SmResult};
pub use retry::RetryPolicy;
