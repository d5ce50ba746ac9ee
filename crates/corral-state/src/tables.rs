//! redb table definitions.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized rows).
//! Composite keys follow the pattern `{parent}:{child}`.

use redb::TableDefinition;

/// Node rows keyed by `{node_id}`. Connection state is never stored.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Instance placements keyed by `{item_id}:{subject_id}:{instance}`.
pub const PLACEMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("placements");

/// Last desired status + update stage, single row keyed by `"current"`.
pub const UPDATE: TableDefinition<&str, &[u8]> = TableDefinition::new("update");

/// Image store index keyed by `{item_id}:{version}`.
pub const ITEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("items");

/// Network address pools keyed by `{network_id}`.
pub const NETWORKS: TableDefinition<&str, &[u8]> = TableDefinition::new("networks");

/// Instance network leases keyed by `{network_id}:{item_id}:{subject_id}:{instance}`.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
