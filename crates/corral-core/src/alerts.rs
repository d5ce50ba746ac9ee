//! Alert variants.
//!
//! Every alert carries a millisecond timestamp; equality for
//! de-duplication deliberately ignores it — the same condition reported
//! at a later time is still the same alert.

use serde::{Deserialize, Serialize};

use crate::types::{CoreComponent, InstanceIdent, NodeId};

/// Tag identifying the alert variant, used for listener subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTag {
    System,
    Core,
    Download,
    SystemQuota,
    InstanceQuota,
    DeviceAllocate,
    ResourceValidate,
}

/// Free-text alert from a node's system services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub timestamp_ms: u64,
    pub node_id: NodeId,
    pub message: String,
}

/// Alert raised by one of the core daemons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreAlert {
    pub timestamp_ms: u64,
    pub node_id: NodeId,
    pub component: CoreComponent,
    pub message: String,
}

/// Download progress or failure alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadAlert {
    pub timestamp_ms: u64,
    pub target_id: String,
    pub url: String,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub message: String,
}

/// Node-level resource quota crossed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemQuotaAlert {
    pub timestamp_ms: u64,
    pub node_id: NodeId,
    pub parameter: String,
    pub value: f64,
}

/// Instance-level resource quota crossed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceQuotaAlert {
    pub timestamp_ms: u64,
    pub ident: InstanceIdent,
    pub parameter: String,
    pub value: f64,
}

/// Device could not be allocated to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAllocateAlert {
    pub timestamp_ms: u64,
    pub ident: InstanceIdent,
    pub node_id: NodeId,
    pub device: String,
    pub message: String,
}

/// Node-config resource section failed validation on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceValidateAlert {
    pub timestamp_ms: u64,
    pub node_id: NodeId,
    pub name: String,
    pub errors: Vec<String>,
}

/// Tagged alert variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum Alert {
    System(SystemAlert),
    Core(CoreAlert),
    Download(DownloadAlert),
    SystemQuota(SystemQuotaAlert),
    InstanceQuota(InstanceQuotaAlert),
    DeviceAllocate(DeviceAllocateAlert),
    ResourceValidate(ResourceValidateAlert),
}

impl Alert {
    pub fn tag(&self) -> AlertTag {
        match self {
            Alert::System(_) => AlertTag::System,
            Alert::Core(_) => AlertTag::Core,
            Alert::Download(_) => AlertTag::Download,
            Alert::SystemQuota(_) => AlertTag::SystemQuota,
            Alert::InstanceQuota(_) => AlertTag::InstanceQuota,
            Alert::DeviceAllocate(_) => AlertTag::DeviceAllocate,
            Alert::ResourceValidate(_) => AlertTag::ResourceValidate,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Alert::System(a) => a.timestamp_ms,
            Alert::Core(a) => a.timestamp_ms,
            Alert::Download(a) => a.timestamp_ms,
            Alert::SystemQuota(a) => a.timestamp_ms,
            Alert::InstanceQuota(a) => a.timestamp_ms,
            Alert::DeviceAllocate(a) => a.timestamp_ms,
            Alert::ResourceValidate(a) => a.timestamp_ms,
        }
    }

    fn set_timestamp_ms(&mut self, ts: u64) {
        match self {
            Alert::System(a) => a.timestamp_ms = ts,
            Alert::Core(a) => a.timestamp_ms = ts,
            Alert::Download(a) => a.timestamp_ms = ts,
            Alert::SystemQuota(a) => a.timestamp_ms = ts,
            Alert::InstanceQuota(a) => a.timestamp_ms = ts,
            Alert::DeviceAllocate(a) => a.timestamp_ms = ts,
            Alert::ResourceValidate(a) => a.timestamp_ms = ts,
        }
    }

    /// Equality with the timestamp masked out.
    pub fn eq_ignoring_timestamp(&self, other: &Alert) -> bool {
        let mut normalized = other.clone();
        normalized.set_timestamp_ms(self.timestamp_ms());
        *self == normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system_alert(ts: u64, node: &str, msg: &str) -> Alert {
        Alert::System(SystemAlert {
            timestamp_ms: ts,
            node_id: node.to_string(),
            message: msg.to_string(),
        })
    }

    #[test]
    fn same_payload_different_timestamp_is_equal() {
        let a = system_alert(1000, "node1", "disk failing");
        let b = system_alert(4000, "node1", "disk failing");
        assert!(a.eq_ignoring_timestamp(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn different_payload_is_not_equal() {
        let a = system_alert(1000, "node1", "disk failing");
        let b = system_alert(1000, "node2", "disk failing");
        assert!(!a.eq_ignoring_timestamp(&b));
    }

    #[test]
    fn different_variant_is_not_equal() {
        let a = system_alert(1000, "node1", "msg");
        let b = Alert::Core(CoreAlert {
            timestamp_ms: 1000,
            node_id: "node1".to_string(),
            component: CoreComponent::Sm,
            message: "msg".to_string(),
        });
        assert!(!a.eq_ignoring_timestamp(&b));
    }

    #[test]
    fn tag_is_serialized() {
        let a = system_alert(1, "node1", "msg");
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.contains("\"tag\":\"system\""));
    }
}
