//! Node manager — cache in front of the persistent node storage.
//!
//! The cache is authoritative within a process run. Rows are persisted
//! with `is_connected = false` (liveness is runtime-only), and an
//! unprovisioned node is not durable: setting `Unprovisioned` removes the
//! persisted row.

use std::sync::{Arc, Mutex};

use tracing::debug;

use corral_core::{NodeId, NodeInfo, NodeState};
use corral_state::StateStore;

use crate::error::{NodeError, NodeResult};
use crate::provider::NodeInfoListener;

/// Cache + storage of node state, with change notification.
pub struct NodeManager {
    store: StateStore,
    cache: Mutex<Vec<NodeInfo>>,
    listeners: Mutex<Vec<Arc<dyn NodeInfoListener>>>,
}

impl NodeManager {
    /// Load the persisted node rows into the cache.
    pub fn new(store: StateStore) -> NodeResult<Self> {
        let cache = store.list_nodes()?;
        debug!(nodes = cache.len(), "node manager loaded");

        Ok(Self {
            store,
            cache: Mutex::new(cache),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Upsert a node record.
    ///
    /// Listeners fire only when the cached value observably changed
    /// (field-wise comparison including `is_connected`).
    pub fn set_node_info(&self, info: NodeInfo) -> NodeResult<()> {
        debug!(
            node_id = %info.node_id,
            state = %info.state,
            connected = info.is_connected,
            "set node info"
        );

        self.check_connected_invariant(&info)?;
        self.update_storage(&info)?;
        self.update_cache(info);
        Ok(())
    }

    /// Change only the state of a known node.
    pub fn set_node_state(&self, node_id: &str, state: NodeState) -> NodeResult<()> {
        let mut info = self
            .cached(node_id)
            .ok_or_else(|| NodeError::NotFound(node_id.to_string()))?;
        info.state = state;
        if state != NodeState::Provisioned {
            info.is_connected = false;
        }
        self.set_node_info(info)
    }

    /// Change only the connection bit of a known node. Cache-only: the
    /// stored row keeps `is_connected = false`.
    pub fn set_node_connected(&self, node_id: &str, is_connected: bool) -> NodeResult<()> {
        let mut info = self
            .cached(node_id)
            .ok_or_else(|| NodeError::NotFound(node_id.to_string()))?;
        info.is_connected = is_connected;

        self.check_connected_invariant(&info)?;
        self.update_cache(info);
        Ok(())
    }

    /// Current record of one node.
    pub fn node_info(&self, node_id: &str) -> NodeResult<NodeInfo> {
        self.cached(node_id)
            .ok_or_else(|| NodeError::NotFound(node_id.to_string()))
    }

    /// IDs of all known nodes, in cache order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.cache
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// All known node records.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.cache.lock().unwrap().clone()
    }

    /// Subscribe to observable node changes.
    pub fn subscribe(&self, listener: Arc<dyn NodeInfoListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn check_connected_invariant(&self, info: &NodeInfo) -> NodeResult<()> {
        if info.is_connected && info.state != NodeState::Provisioned {
            return Err(NodeError::WrongState(format!(
                "node {} cannot be connected in state {}",
                info.node_id, info.state
            )));
        }
        Ok(())
    }

    fn cached(&self, node_id: &str) -> Option<NodeInfo> {
        self.cache
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.node_id == node_id)
            .cloned()
    }

    fn update_storage(&self, info: &NodeInfo) -> NodeResult<()> {
        if info.state == NodeState::Unprovisioned {
            // Unprovisioned is not durable.
            self.store.delete_node(&info.node_id)?;
            return Ok(());
        }

        // Skip the write when nothing but liveness changed.
        if let Some(cached) = self.cached(&info.node_id) {
            let mut comparable = info.clone();
            comparable.is_connected = cached.is_connected;
            if comparable == cached {
                return Ok(());
            }
        }

        self.store.put_node(info)?;
        Ok(())
    }

    fn update_cache(&self, info: NodeInfo) {
        let changed = {
            let mut cache = self.cache.lock().unwrap();
            match cache.iter_mut().find(|n| n.node_id == info.node_id) {
                Some(cached) if *cached == info => false,
                Some(cached) => {
                    *cached = info.clone();
                    true
                }
                None => {
                    cache.push(info.clone());
                    true
                }
            }
        };

        if changed {
            self.notify(&info);
        }
    }

    fn notify(&self, info: &NodeInfo) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_node_info_changed(info);
        }
    }
}
