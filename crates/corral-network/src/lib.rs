//! corral-network — instance network parameter allocation.
//!
//! For each `(instance, network, node)` the manager produces a
//! [`NetworkParameters`] struct: IP, subnet, DNS servers, ingress rules
//! and exposed ports. Allocation is idempotent and deterministic per
//! unit — rerunning with the same inputs returns the same IP, because
//! leases and per-network pools are persisted. Freed addresses are
//! reused oldest-first before the pool's untouched range advances.
//!
//! The node-local veth/bridge fabric and the CNI plugin glue are external
//! collaborators; the [`DnsController`] seam carries the one side effect
//! they must honour after any network mutation.

pub mod error;
pub mod manager;

pub use corral_core::{FirewallRule, NetworkParameters};
pub use error::{NetworkError, NetworkResult};
pub use manager::{DnsController, NetworkManager};
