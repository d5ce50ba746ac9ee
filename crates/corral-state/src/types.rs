//! Persisted row types.

use serde::{Deserialize, Serialize};

use corral_core::{
    DesiredStatus, ErrorInfo, ImageState, InstanceIdent, ItemId, NodeId, UpdateState,
};

/// Where an instance identity is (or was last) placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub ident: InstanceIdent,
    pub node_id: NodeId,
    /// Previous node, kept for stickiness during rebalance.
    pub prev_node_id: Option<NodeId>,
}

impl PlacementRecord {
    /// Build the composite key for the placements table.
    pub fn table_key(&self) -> String {
        placement_key(&self.ident)
    }
}

/// Placement table key for an instance identity.
pub fn placement_key(ident: &InstanceIdent) -> String {
    format!("{}:{}:{}", ident.item_id, ident.subject_id, ident.instance)
}

/// Last ingested desired status plus the pipeline stage it reached.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersistedUpdate {
    pub desired: DesiredStatus,
    pub state: UpdateState,
}

/// One blob referenced by a stored item version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredImage {
    pub image_id: String,
    /// Content digest in `"<algo>:<hex>"` form.
    pub digest: String,
    /// Unpacked size in bytes.
    pub size: u64,
    pub state: ImageState,
    pub error: Option<ErrorInfo>,
}

/// Image store index row: one installed/cached item version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub item_id: ItemId,
    pub version: String,
    pub state: ImageState,
    /// Bytes charged against the space allocator.
    pub total_size: u64,
    pub images: Vec<StoredImage>,
    /// Install (or demotion) time, drives LRU eviction of cached versions.
    pub timestamp_ms: u64,
    pub error: Option<ErrorInfo>,
}

impl StoredItem {
    /// Build the composite key for the items table.
    pub fn table_key(&self) -> String {
        item_key(&self.item_id, &self.version)
    }
}

/// Items table key for an item version.
pub fn item_key(item_id: &str, version: &str) -> String {
    format!("{item_id}:{version}")
}

/// Per-network address pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkPool {
    pub network_id: String,
    /// Subnet in CIDR form, e.g. `172.18.0.0/16`.
    pub subnet: String,
    /// Next never-used host ordinal.
    pub next_host: u32,
    /// Freed addresses, oldest first; reused before `next_host` advances.
    pub free: Vec<String>,
}

/// One instance's address lease inside a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkLease {
    pub network_id: String,
    pub ident: InstanceIdent,
    pub ip: String,
}

impl NetworkLease {
    /// Build the composite key for the leases table.
    pub fn table_key(&self) -> String {
        lease_key(&self.network_id, &self.ident)
    }
}

/// Leases table key for an instance inside a network.
pub fn lease_key(network_id: &str, ident: &InstanceIdent) -> String {
    format!(
        "{network_id}:{}:{}:{}",
        ident.item_id, ident.subject_id, ident.instance
    )
}
