//! Node info provider — merges IAM's provisioning view with SM liveness.
//!
//! The effective state of a node is derived as:
//!
//! ```text
//! if IAM == Unprovisioned      -> Unprovisioned
//! else if IAM == Paused        -> Paused
//! else if node has no SM       -> IAM state (no liveness to track)
//! else if SM heartbeat fresh   -> IAM state, connected
//! else                         -> Error (provisioned but silent)
//! ```
//!
//! Freshness is governed by the configurable SM connection timeout. A
//! background task re-evaluates all nodes so age-out transitions fire
//! without new input.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use corral_core::{ErrorInfo, ErrorKind, NodeId, NodeInfo, NodeState};

use crate::error::{NodeError, NodeResult};

/// Receives effective node info on every observable transition.
pub trait NodeInfoListener: Send + Sync {
    fn on_node_info_changed(&self, info: &NodeInfo);
}

/// IAM's provisioning view of the unit.
pub trait IamNodeSource: Send + Sync {
    fn node_ids(&self) -> Vec<NodeId>;
    fn node_info(&self, node_id: &str) -> Option<NodeInfo>;
}

struct Entry {
    iam: NodeInfo,
    last_sm_seen: Option<Instant>,
    effective: NodeInfo,
}

/// Connection-aware, authoritative map of node-id → effective node info.
pub struct NodeInfoProvider {
    sm_connect_timeout: Duration,
    entries: Mutex<Vec<Entry>>,
    listeners: Mutex<Vec<Arc<dyn NodeInfoListener>>>,
}

impl NodeInfoProvider {
    /// Seed the provider from IAM's current view.
    pub fn new(iam: &dyn IamNodeSource, sm_connect_timeout: Duration) -> Self {
        let entries = iam
            .node_ids()
            .iter()
            .filter_map(|id| iam.node_info(id))
            .map(|info| {
                let effective = Self::merge(&info, None, sm_connect_timeout);
                Entry { iam: info, last_sm_seen: None, effective }
            })
            .collect();

        Self {
            sm_connect_timeout,
            entries: Mutex::new(entries),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// IDs of all known nodes, in the order IAM first reported them.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.effective.node_id.clone())
            .collect()
    }

    /// Effective info of one node.
    pub fn node_info(&self, node_id: &str) -> NodeResult<NodeInfo> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.effective.node_id == node_id)
            .ok_or_else(|| NodeError::NotFound(node_id.to_string()))?;

        entry.effective = Self::merge(&entry.iam, entry.last_sm_seen, self.sm_connect_timeout);
        Ok(entry.effective.clone())
    }

    /// Subscribe to effective-state transitions.
    pub fn subscribe(&self, listener: Arc<dyn NodeInfoListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// IAM reported a new or changed node.
    pub fn on_iam_node_changed(&self, info: NodeInfo) {
        debug!(node_id = %info.node_id, state = %info.state, "iam node changed");

        let changed = {
            let mut entries = self.entries.lock().unwrap();
            match entries.iter_mut().find(|e| e.effective.node_id == info.node_id) {
                Some(entry) => {
                    entry.iam = info;
                    Self::refresh(entry, self.sm_connect_timeout)
                }
                None => {
                    let effective = Self::merge(&info, None, self.sm_connect_timeout);
                    entries.push(Entry {
                        iam: info,
                        last_sm_seen: None,
                        effective: effective.clone(),
                    });
                    Some(effective)
                }
            }
        };

        if let Some(info) = changed {
            self.notify(&info);
        }
    }

    /// An SM heartbeat (or any SM message) arrived for a node.
    pub fn on_sm_info_received(&self, node_id: &str) {
        let changed = {
            let mut entries = self.entries.lock().unwrap();
            let Some(entry) = entries.iter_mut().find(|e| e.effective.node_id == node_id)
            else {
                warn!(%node_id, "sm heartbeat from unknown node");
                return;
            };

            entry.last_sm_seen = Some(Instant::now());
            Self::refresh(entry, self.sm_connect_timeout)
        };

        if let Some(info) = changed {
            self.notify(&info);
        }
    }

    /// The SM stream to a node closed. The node stays in its last state
    /// until the heartbeat ages out, then transitions to `Error`.
    pub fn on_sm_disconnected(&self, node_id: &str) {
        debug!(%node_id, "sm disconnected");

        let changed = {
            let mut entries = self.entries.lock().unwrap();
            let Some(entry) = entries.iter_mut().find(|e| e.effective.node_id == node_id)
            else {
                return;
            };
            Self::refresh(entry, self.sm_connect_timeout)
        };

        if let Some(info) = changed {
            self.notify(&info);
        }
    }

    /// Periodically re-evaluate freshness so age-out transitions fire.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = (self.sm_connect_timeout / 4).max(Duration::from_millis(100));
        let mut tick = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = tick.tick() => self.reevaluate(),
                _ = shutdown.changed() => {
                    debug!("node info provider stopped");
                    return;
                }
            }
        }
    }

    fn reevaluate(&self) {
        let changed: Vec<NodeInfo> = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .iter_mut()
                .filter_map(|e| Self::refresh(e, self.sm_connect_timeout))
                .collect()
        };

        for info in changed {
            self.notify(&info);
        }
    }

    /// Recompute an entry's effective info; returns it if it changed.
    fn refresh(entry: &mut Entry, timeout: Duration) -> Option<NodeInfo> {
        let effective = Self::merge(&entry.iam, entry.last_sm_seen, timeout);
        if effective == entry.effective {
            return None;
        }
        entry.effective = effective.clone();
        Some(effective)
    }

    fn merge(iam: &NodeInfo, last_sm_seen: Option<Instant>, timeout: Duration) -> NodeInfo {
        let mut effective = iam.clone();
        effective.is_connected = false;
        effective.error = None;

        match iam.state {
            NodeState::Unprovisioned => effective.state = NodeState::Unprovisioned,
            NodeState::Paused => effective.state = NodeState::Paused,
            _ if !iam.has_sm() => effective.state = iam.state,
            _ => {
                let fresh = last_sm_seen.is_some_and(|t| t.elapsed() <= timeout);
                if fresh {
                    effective.state = iam.state;
                    effective.is_connected = true;
                } else {
                    effective.state = NodeState::Error;
                    effective.error = Some(ErrorInfo::new(
                        ErrorKind::Timeout,
                        "sm connection timed out",
                    ));
                }
            }
        }

        effective
    }

    fn notify(&self, info: &NodeInfo) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_node_info_changed(info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{NodeAttribute, OsInfo};

    struct StubIam {
        nodes: Mutex<Vec<NodeInfo>>,
    }

    impl StubIam {
        fn new(nodes: Vec<NodeInfo>) -> Self {
            Self { nodes: Mutex::new(nodes) }
        }
    }

    impl IamNodeSource for StubIam {
        fn node_ids(&self) -> Vec<NodeId> {
            self.nodes.lock().unwrap().iter().map(|n| n.node_id.clone()).collect()
        }

        fn node_info(&self, node_id: &str) -> Option<NodeInfo> {
            self.nodes
                .lock()
                .unwrap()
                .iter()
                .find(|n| n.node_id == node_id)
                .cloned()
        }
    }

    struct RecordingListener {
        events: Mutex<Vec<NodeInfo>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self { events: Mutex::new(Vec::new()) })
        }

        fn states(&self) -> Vec<NodeState> {
            self.events.lock().unwrap().iter().map(|i| i.state).collect()
        }
    }

    impl NodeInfoListener for RecordingListener {
        fn on_node_info_changed(&self, info: &NodeInfo) {
            self.events.lock().unwrap().push(info.clone());
        }
    }

    fn iam_node(id: &str, state: NodeState, with_sm: bool) -> NodeInfo {
        let attrs = if with_sm {
            vec![NodeAttribute { name: "components".to_string(), value: "sm".to_string() }]
        } else {
            Vec::new()
        };

        NodeInfo {
            node_id: id.to_string(),
            node_type: "gateway".to_string(),
            name: id.to_string(),
            cpus: Vec::new(),
            partitions: Vec::new(),
            os_info: OsInfo::default(),
            total_ram: 0,
            attrs,
            provisioned: state == NodeState::Provisioned,
            state,
            is_connected: false,
            error: None,
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn unprovisioned_and_paused_win_over_liveness() {
        let iam = StubIam::new(vec![
            iam_node("node1", NodeState::Unprovisioned, true),
            iam_node("node2", NodeState::Paused, true),
        ]);
        let provider = NodeInfoProvider::new(&iam, TIMEOUT);

        provider.on_sm_info_received("node1");
        provider.on_sm_info_received("node2");

        assert_eq!(provider.node_info("node1").unwrap().state, NodeState::Unprovisioned);
        assert_eq!(provider.node_info("node2").unwrap().state, NodeState::Paused);
        assert!(!provider.node_info("node1").unwrap().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn provisioned_without_heartbeat_is_error() {
        let iam = StubIam::new(vec![iam_node("node1", NodeState::Provisioned, true)]);
        let provider = NodeInfoProvider::new(&iam, TIMEOUT);

        let info = provider.node_info("node1").unwrap();
        assert_eq!(info.state, NodeState::Error);
        assert_eq!(info.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_brings_node_online_and_ages_out() {
        let iam = StubIam::new(vec![iam_node("node1", NodeState::Provisioned, true)]);
        let provider = NodeInfoProvider::new(&iam, TIMEOUT);

        provider.on_sm_info_received("node1");
        let info = provider.node_info("node1").unwrap();
        assert_eq!(info.state, NodeState::Provisioned);
        assert!(info.is_connected);

        // Let the heartbeat age past the timeout.
        tokio::time::advance(TIMEOUT * 2).await;
        let info = provider.node_info("node1").unwrap();
        assert_eq!(info.state, NodeState::Error);
        assert!(!info.is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn node_without_sm_keeps_iam_state() {
        let iam = StubIam::new(vec![iam_node("node1", NodeState::Provisioned, false)]);
        let provider = NodeInfoProvider::new(&iam, TIMEOUT);

        let info = provider.node_info("node1").unwrap();
        assert_eq!(info.state, NodeState::Provisioned);
        assert!(!info.is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_fires_age_out_transition() {
        let iam = StubIam::new(vec![iam_node("node1", NodeState::Provisioned, true)]);
        let provider = Arc::new(NodeInfoProvider::new(&iam, TIMEOUT));
        let listener = RecordingListener::new();
        provider.subscribe(listener.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(provider.clone().run(shutdown_rx));

        provider.on_sm_info_received("node1");
        tokio::time::sleep(TIMEOUT * 3).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        // Connected transition, then the age-out back to error.
        let states = listener.states();
        assert_eq!(states.first(), Some(&NodeState::Provisioned));
        assert_eq!(states.last(), Some(&NodeState::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn iam_change_creates_and_updates_nodes() {
        let iam = StubIam::new(Vec::new());
        let provider = NodeInfoProvider::new(&iam, TIMEOUT);
        let listener = RecordingListener::new();
        provider.subscribe(listener.clone());

        provider.on_iam_node_changed(iam_node("node1", NodeState::Provisioned, true));
        assert_eq!(provider.node_ids(), vec!["node1".to_string()]);
        assert_eq!(listener.states(), vec![NodeState::Error]);

        provider.on_iam_node_changed(iam_node("node1", NodeState::Paused, true));
        assert_eq!(listener.states(), vec![NodeState::Error, NodeState::Paused]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_disconnect_recovers() {
        let iam = StubIam::new(vec![iam_node("node1", NodeState::Provisioned, true)]);
        let provider = NodeInfoProvider::new(&iam, TIMEOUT);

        provider.on_sm_info_received("node1");
        provider.on_sm_disconnected("node1");

        // Still within the freshness window right after disconnect.
        assert_eq!(provider.node_info("node1").unwrap().state, NodeState::Provisioned);

        tokio::time::advance(TIMEOUT * 2).await;
        assert_eq!(provider.node_info("node1").unwrap().state, NodeState::Error);

        provider.on_sm_info_received("node1");
        let info = provider.node_info("node1").unwrap();
        assert_eq!(info.state, NodeState::Provisioned);
        assert!(info.is_connected);
    }
}
