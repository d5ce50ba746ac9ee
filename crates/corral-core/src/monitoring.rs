//! Monitoring sample types exchanged between SMs, the aggregator and the
//! cloud sender.

use serde::{Deserialize, Serialize};

use crate::types::{InstanceIdent, InstanceState, NodeId, NodeState};

/// Usage of one named partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionUsage {
    pub name: String,
    pub used_size: u64,
}

/// One time-stamped resource sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSample {
    pub timestamp_ms: u64,
    /// CPU load in percent of the node budget.
    pub cpu: f64,
    pub ram: u64,
    #[serde(default)]
    pub partitions: Vec<PartitionUsage>,
    pub download: u64,
    pub upload: u64,
}

/// Per-instance sample as shipped by an SM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMonitoringData {
    pub ident: InstanceIdent,
    pub node_id: NodeId,
    pub sample: MonitoringSample,
}

/// Per-node sample as shipped by an SM, with its instances attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMonitoringData {
    pub node_id: NodeId,
    pub sample: MonitoringSample,
    #[serde(default)]
    pub instances: Vec<InstanceMonitoringData>,
}

/// One recorded node-state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStateRecord {
    pub timestamp_ms: u64,
    pub state: NodeState,
    pub is_connected: bool,
}

/// One recorded instance-state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStateRecord {
    pub timestamp_ms: u64,
    pub state: InstanceState,
}
