//! corral-node — the unit's view of its nodes.
//!
//! Two layers:
//!
//! - [`NodeInfoProvider`] merges IAM's provisioning view with SM liveness
//!   signals into the effective per-node state the rest of the CM consumes.
//! - [`NodeManager`] is a thin cache in front of the persistent node
//!   storage, notifying listeners only on observable change.
//!
//! Listener fan-out is snapshot-then-invoke: the subscriber list is copied
//! under the lock and callbacks run outside it.

pub mod error;
pub mod manager;
pub mod provider;

pub use error::{NodeError, NodeResult};
pub use manager::NodeManager;
pub use provider::{IamNodeSource, NodeInfoListener, NodeInfoProvider};
