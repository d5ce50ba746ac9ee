//! corral-launcher — places service instances onto nodes and tracks
//! their lifecycle.
//!
//! The placement engine ([`placement`]) is pure: given the desired
//! instance list, the current placements and the node views, it decides
//! what to keep, start and stop. The [`Launcher`] drives it: reconciles
//! desired state against the unit, requests start/stop on SMs through the
//! [`InstanceRunner`] seam, retries failed starts on the next-best node,
//! caches reported instance statuses and dispatches environment-variable
//! overrides with TTL expiry.
//!
//! # Architecture
//!
//! ```text
//! Launcher
//!   ├── placement (pure: sticky keep / priority scoring / tie-breaks)
//!   ├── StateStore (persisted PlacementRecord per instance)
//!   ├── InstanceRunner (SM controller: start/stop/env RPCs)
//!   └── status cache (ident → InstanceStatus, fed by SM streams)
//! ```

pub mod error;
pub mod launcher;
pub mod placement;

pub use error::{LauncherError, LauncherResult};
pub use launcher::{
    EnvVarInfo, EnvVarsInstanceInfo, InstanceFilter, InstanceRunner, InstanceStatusListener,
    Launcher, NodeCatalog, RunRequest, StartRequest,
};
pub use placement::{Assignment, NodeView, Plan, compute_placement, rank_candidates};
