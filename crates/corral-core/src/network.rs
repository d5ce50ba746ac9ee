//! Instance network value types.

use serde::{Deserialize, Serialize};

/// One allowed ingress connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub proto: String,
    pub port: u16,
}

/// Everything a node needs to wire one instance into a network: address,
/// subnet, resolvers, ingress rules and exposed ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkParameters {
    pub network_id: String,
    pub ip: String,
    pub subnet: String,
    pub dns_servers: Vec<String>,
    pub ingress_rules: Vec<FirewallRule>,
    pub exposed_ports: Vec<String>,
}
