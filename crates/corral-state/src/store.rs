//! StateStore — typed CRUD over the redb tables.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use corral_core::{InstanceIdent, NodeId, NodeInfo};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(PLACEMENTS).map_err(map_err!(Table))?;
        txn.open_table(UPDATE).map_err(map_err!(Table))?;
        txn.open_table(ITEMS).map_err(map_err!(Table))?;
        txn.open_table(NETWORKS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_raw(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &impl serde::Serialize,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_raw<T: serde::de::DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_raw<T: serde::de::DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        prefix: Option<&str>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if let Some(prefix) = prefix {
                if !key.value().starts_with(prefix) {
                    continue;
                }
            }
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete_raw(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node row. Liveness is runtime-only: the row is
    /// always written with `is_connected = false`.
    pub fn put_node(&self, node: &NodeInfo) -> StateResult<()> {
        let mut row = node.clone();
        row.is_connected = false;
        self.put_raw(NODES, &row.node_id.clone(), &row)?;
        debug!(node_id = %node.node_id, "node stored");
        Ok(())
    }

    /// Get a node row by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeInfo>> {
        self.get_raw(NODES, node_id)
    }

    /// List all node rows.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeInfo>> {
        self.list_raw(NODES, None)
    }

    /// Delete a node row. Returns true if it existed.
    pub fn delete_node(&self, node_id: &NodeId) -> StateResult<bool> {
        let existed = self.delete_raw(NODES, node_id)?;
        debug!(%node_id, existed, "node deleted");
        Ok(existed)
    }

    // ── Placements ─────────────────────────────────────────────────

    /// Insert or update a placement record.
    pub fn put_placement(&self, placement: &PlacementRecord) -> StateResult<()> {
        self.put_raw(PLACEMENTS, &placement.table_key(), placement)
    }

    /// Get the placement of an instance identity.
    pub fn get_placement(&self, ident: &InstanceIdent) -> StateResult<Option<PlacementRecord>> {
        self.get_raw(PLACEMENTS, &placement_key(ident))
    }

    /// List all placements.
    pub fn list_placements(&self) -> StateResult<Vec<PlacementRecord>> {
        self.list_raw(PLACEMENTS, None)
    }

    /// Delete a placement. Returns true if it existed.
    pub fn delete_placement(&self, ident: &InstanceIdent) -> StateResult<bool> {
        self.delete_raw(PLACEMENTS, &placement_key(ident))
    }

    // ── Update state ───────────────────────────────────────────────

    /// Persist the current desired status + pipeline stage.
    pub fn put_update(&self, update: &PersistedUpdate) -> StateResult<()> {
        self.put_raw(UPDATE, "current", update)
    }

    /// Read the persisted update state, if any.
    pub fn get_update(&self) -> StateResult<Option<PersistedUpdate>> {
        self.get_raw(UPDATE, "current")
    }

    // ── Image store index ──────────────────────────────────────────

    /// Insert or update an item version row.
    pub fn put_item(&self, item: &StoredItem) -> StateResult<()> {
        self.put_raw(ITEMS, &item.table_key(), item)
    }

    /// Get an item version row.
    pub fn get_item(&self, item_id: &str, version: &str) -> StateResult<Option<StoredItem>> {
        self.get_raw(ITEMS, &item_key(item_id, version))
    }

    /// List every stored item version.
    pub fn list_items(&self) -> StateResult<Vec<StoredItem>> {
        self.list_raw(ITEMS, None)
    }

    /// List all stored versions of one item.
    pub fn list_item_versions(&self, item_id: &str) -> StateResult<Vec<StoredItem>> {
        self.list_raw(ITEMS, Some(&format!("{item_id}:")))
    }

    /// Delete an item version row. Returns true if it existed.
    pub fn delete_item(&self, item_id: &str, version: &str) -> StateResult<bool> {
        self.delete_raw(ITEMS, &item_key(item_id, version))
    }

    // ── Networks ───────────────────────────────────────────────────

    /// Insert or update a network address pool.
    pub fn put_network(&self, pool: &NetworkPool) -> StateResult<()> {
        self.put_raw(NETWORKS, &pool.network_id.clone(), pool)
    }

    /// Get a network address pool.
    pub fn get_network(&self, network_id: &str) -> StateResult<Option<NetworkPool>> {
        self.get_raw(NETWORKS, network_id)
    }

    /// List all network address pools.
    pub fn list_networks(&self) -> StateResult<Vec<NetworkPool>> {
        self.list_raw(NETWORKS, None)
    }

    /// Insert or update a lease.
    pub fn put_lease(&self, lease: &NetworkLease) -> StateResult<()> {
        self.put_raw(LEASES, &lease.table_key(), lease)
    }

    /// Get a lease for an instance inside a network.
    pub fn get_lease(
        &self,
        network_id: &str,
        ident: &InstanceIdent,
    ) -> StateResult<Option<NetworkLease>> {
        self.get_raw(LEASES, &lease_key(network_id, ident))
    }

    /// List all leases in a network.
    pub fn list_leases(&self, network_id: &str) -> StateResult<Vec<NetworkLease>> {
        self.list_raw(LEASES, Some(&format!("{network_id}:")))
    }

    /// Delete a lease. Returns true if it existed.
    pub fn delete_lease(&self, network_id: &str, ident: &InstanceIdent) -> StateResult<bool> {
        self.delete_raw(LEASES, &lease_key(network_id, ident))
    }
}
