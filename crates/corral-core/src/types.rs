//! Node, instance and update-item value types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorInfo;

/// Stable node identifier (bounded by [`crate::limits::MAX_ID_LEN`]).
pub type NodeId = String;

/// Node type label, used for node-config lookup fallback.
pub type NodeType = String;

/// Update item identifier.
pub type ItemId = String;

/// Subject (tenant/owner) identifier.
pub type SubjectId = String;

// ── Nodes ──────────────────────────────────────────────────────────

/// Core daemons a node can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreComponent {
    Iam,
    Cm,
    Sm,
}

/// Node lifecycle state as seen by the unit.
///
/// `Provisioned`/`Paused`/`Unprovisioned` come from IAM; `Error` is the
/// derived state of a provisioned node whose SM stopped heartbeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Provisioned,
    Paused,
    Unprovisioned,
    Error,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Provisioned => "provisioned",
            NodeState::Paused => "paused",
            NodeState::Unprovisioned => "unprovisioned",
            NodeState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One CPU package advertised by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub model: String,
    pub num_cores: u32,
    pub num_threads: u32,
    /// Aggregate compute budget in DMIPS.
    pub dmips: u64,
}

/// One mounted partition advertised by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub name: String,
    pub path: String,
    pub types: Vec<String>,
    pub total_size: u64,
}

/// Operating system facts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OsInfo {
    pub os: String,
    pub version: String,
}

/// Free-form node attribute. The attribute named `components` lists the
/// core components present on the node (`iam`, `cm`, `sm`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttribute {
    pub name: String,
    pub value: String,
}

/// Attribute name carrying the core-component list.
pub const ATTR_COMPONENTS: &str = "components";

/// Authoritative per-node record.
///
/// `is_connected` is runtime-only: it is never persisted and implies
/// `state == Provisioned`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub name: String,
    pub cpus: Vec<CpuInfo>,
    pub partitions: Vec<PartitionInfo>,
    pub os_info: OsInfo,
    pub total_ram: u64,
    pub attrs: Vec<NodeAttribute>,
    pub provisioned: bool,
    pub state: NodeState,
    pub is_connected: bool,
    pub error: Option<ErrorInfo>,
}

impl NodeInfo {
    /// Core components listed in the `components` attribute.
    pub fn core_components(&self) -> Vec<CoreComponent> {
        self.attrs
            .iter()
            .find(|a| a.name == ATTR_COMPONENTS)
            .map(|a| {
                a.value
                    .split(',')
                    .filter_map(|c| match c.trim() {
                        "iam" => Some(CoreComponent::Iam),
                        "cm" => Some(CoreComponent::Cm),
                        "sm" => Some(CoreComponent::Sm),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the node runs a service manager and can host instances.
    pub fn has_sm(&self) -> bool {
        self.core_components().contains(&CoreComponent::Sm)
    }
}

// ── Instances ──────────────────────────────────────────────────────

/// Kind of update item an instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Service,
    Layer,
    Component,
}

/// Identity of a placed service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceIdent {
    pub item_id: ItemId,
    pub subject_id: SubjectId,
    pub instance: u32,
    pub item_type: ItemType,
}

impl fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.item_id, self.subject_id, self.instance)
    }
}

/// Instance lifecycle state as reported by the owning SM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Activating,
    Active,
    Inactive,
    Failed,
}

/// Why a status transition was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusReason {
    Run,
    Update,
}

/// Reported status of one instance. Exactly one `(node_id, state)` pair is
/// visible upstream per identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub ident: InstanceIdent,
    pub version: String,
    pub node_id: NodeId,
    pub state: InstanceState,
    pub reason: StatusReason,
    pub state_checksum: Option<String>,
    pub error: Option<ErrorInfo>,
}

// ── Update items ───────────────────────────────────────────────────

/// Image lifecycle inside the content-addressed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    Pending,
    Downloading,
    Installed,
    Cached,
    Removed,
    Error,
}

/// Parameters needed to unwrap a CMS `EnvelopedData` payload. The envelope
/// itself is handled by the crypto collaborator; these fields are opaque
/// pass-through.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DecryptInfo {
    pub key_wrap_alg: String,
    pub content_alg: String,
    pub wrapped_key: Vec<u8>,
    pub iv: Vec<u8>,
}

/// Detached signature over an image plus the chain that anchors it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignInfo {
    pub chain_name: String,
    pub alg: String,
    pub signature: Vec<u8>,
    pub trusted_timestamp: Option<u64>,
}

/// One downloadable artifact of an update item. Content-addressed by
/// `(image_id, digest)` where digest is `"<algo>:<hex>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub image_id: String,
    pub urls: Vec<String>,
    pub digest: String,
    pub size: u64,
    pub decrypt_info: DecryptInfo,
    pub sign_info: SignInfo,
}

/// Desired update item as delivered by the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateItemInfo {
    pub item_id: ItemId,
    pub subject_id: Option<SubjectId>,
    pub owner: String,
    pub version: String,
    pub item_type: ItemType,
    pub images: Vec<ImageInfo>,
}

/// Phase of the unit-wide update pipeline. Persisted so a restart resumes
/// where it left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    #[default]
    None,
    Downloading,
    Pending,
    Installing,
    Launching,
    Finalizing,
}

/// Per-image status inside an update item report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageStatus {
    pub image_id: String,
    pub state: ImageState,
    pub error: Option<ErrorInfo>,
}

/// Reported status of one update item version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateItemStatus {
    pub item_id: ItemId,
    pub version: String,
    pub state: ImageState,
    pub images: Vec<ImageStatus>,
    pub error: Option<ErrorInfo>,
}
