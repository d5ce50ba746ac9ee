//! Cloud-facing semantic types: the declarative `DesiredStatus` input and
//! the reported `UnitStatus` counterpart.
//!
//! The encoded wire form is an external collaborator's concern; these are
//! the semantic payloads only.

use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;
use crate::types::*;

// ── Unit / node configuration ──────────────────────────────────────

/// Threshold pair for one monitored parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub min_threshold: f64,
    pub max_threshold: f64,
    /// How long the value must stay above threshold before alerting.
    pub min_timeout_secs: u64,
}

/// Per-node alert rules advertised through node config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlertRules {
    pub cpu: Option<AlertRule>,
    pub ram: Option<AlertRule>,
    pub download: Option<AlertRule>,
    pub upload: Option<AlertRule>,
    #[serde(default)]
    pub partitions: Vec<PartitionAlertRule>,
}

/// Alert rule scoped to one named partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionAlertRule {
    pub name: String,
    #[serde(flatten)]
    pub rule: AlertRule,
}

/// Fractions of node resources granted to service instances.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRatios {
    pub cpu: Option<f64>,
    pub ram: Option<f64>,
    pub storage: Option<f64>,
}

/// Per-node slice of the unit config. Keyed by `node_id` when present,
/// falling back to `node_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: Option<NodeId>,
    pub node_type: Option<NodeType>,
    #[serde(default)]
    pub priority: u64,
    #[serde(default)]
    pub labels: Vec<String>,
    pub alert_rules: Option<AlertRules>,
    pub resource_ratios: Option<ResourceRatios>,
}

/// Unit-wide configuration, versioned with semver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConfigFile {
    pub version: String,
    pub format_version: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Aggregate state of the installed unit config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigState {
    Installed,
    Absent,
    Failed,
}

/// Unit config section of a `UnitStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConfigStatus {
    pub version: String,
    pub state: ConfigState,
    pub error: Option<ErrorInfo>,
}

/// Per-node config application result, reported by the node's SM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfigStatus {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub version: String,
    pub error: Option<ErrorInfo>,
}

// ── Desired status ─────────────────────────────────────────────────

/// Target state the cloud may request for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredNodeState {
    Provisioned,
    Paused,
}

/// Requested state for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredNode {
    pub node_id: NodeId,
    pub state: DesiredNodeState,
}

/// Desired multiplicity of one instance identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub item_id: ItemId,
    pub subject_id: SubjectId,
    pub item_type: ItemType,
    #[serde(default)]
    pub priority: u64,
    pub num_instances: u32,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Certificate to install, delivered with the desired status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub cert_type: String,
    pub certificate: Vec<u8>,
}

/// Certificate chain referenced by image sign info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateChainInfo {
    pub name: String,
    pub fingerprints: Vec<String>,
}

/// Result of installing one certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallCertStatus {
    pub cert_type: String,
    pub serial: String,
    pub error: Option<ErrorInfo>,
}

/// The cloud's declarative input. Applying the same value twice is a no-op.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesiredStatus {
    #[serde(default)]
    pub nodes: Vec<DesiredNode>,
    pub unit_config: Option<UnitConfigFile>,
    #[serde(default)]
    pub update_items: Vec<UpdateItemInfo>,
    #[serde(default)]
    pub instances: Vec<InstanceInfo>,
    #[serde(default)]
    pub certificates: Vec<CertificateInfo>,
    #[serde(default)]
    pub certificate_chains: Vec<CertificateChainInfo>,
}

impl Default for UnitConfigFile {
    fn default() -> Self {
        Self {
            version: "0.0.0".to_string(),
            format_version: "1".to_string(),
            nodes: Vec::new(),
        }
    }
}

// ── Unit status ────────────────────────────────────────────────────

/// The reported counterpart of `DesiredStatus`. Each section is optional;
/// a delta status omits unchanged sections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnitStatus {
    pub is_delta: bool,
    pub unit_config: Option<Vec<UnitConfigStatus>>,
    pub nodes: Option<Vec<NodeInfo>>,
    pub update_items: Option<Vec<UpdateItemStatus>>,
    pub instances: Option<Vec<InstanceStatus>>,
    pub unit_subjects: Option<Vec<SubjectId>>,
    pub certificates: Option<Vec<InstallCertStatus>>,
}

impl UnitStatus {
    /// A delta with every section empty — nothing to report.
    pub fn is_empty(&self) -> bool {
        self.unit_config.is_none()
            && self.nodes.is_none()
            && self.update_items.is_none()
            && self.instances.is_none()
            && self.unit_subjects.is_none()
            && self.certificates.is_none()
    }
}
