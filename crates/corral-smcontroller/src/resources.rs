//! SM-side resource manager contract.
//!
//! Each node's SM advertises the host devices, shared resources and
//! alert rules available for its node type. The implementation lives in
//! the SM; the CM consumes the contract when validating node configs and
//! scheduling device-hungry instances.

use serde::{Deserialize, Serialize};

use corral_core::AlertRules;

/// A host device instances may request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    /// How many instances may share the device; 0 = unlimited.
    pub shared_count: u32,
    pub groups: Vec<String>,
    pub host_devices: Vec<String>,
}

/// A named mountable resource (directories, groups, env).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub name: String,
    pub groups: Vec<String>,
    pub mounts: Vec<String>,
    pub env: Vec<String>,
}

/// Per-node-type resource advertisement.
pub trait ResourceInfoProvider: Send + Sync {
    fn node_devices(&self, node_type: &str) -> Vec<DeviceInfo>;
    fn node_resources(&self, node_type: &str) -> Vec<ResourceInfo>;
    fn alert_rules(&self, node_type: &str) -> Option<AlertRules>;
}
