//! corral-config — unit config distribution and versioning.
//!
//! The unit config is a semver-versioned document carrying one
//! [`NodeConfig`](corral_core::NodeConfig) slice per node (keyed by node id,
//! falling back to node type). The CM owns the authoritative copy on disk,
//! validates candidates against every node before applying them, pushes
//! per-node slices through the [`NodeConfigController`] seam, and
//! proactively re-pushes when a node reports a stale version.

pub mod error;
pub mod unit;

pub use error::{ConfigError, ConfigResult};
pub use unit::{NodeConfigChangeListener, NodeConfigController, UnitConfig};
