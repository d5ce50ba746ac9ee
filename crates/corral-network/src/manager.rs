//! Network manager implementation.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use corral_core::{ErrorInfo, FirewallRule, InstanceIdent, NetworkParameters, NodeId};
use corral_state::{NetworkLease, NetworkPool, StateStore};

use crate::error::{NetworkError, NetworkResult};

/// Side effect the node-local DNS component must honour after any
/// network mutation.
#[async_trait]
pub trait DnsController: Send + Sync {
    async fn restart_dns_server(&self) -> Result<(), ErrorInfo>;
}

/// Allocates per-instance IP/DNS/firewall parameters backed by persisted
/// per-network pools.
pub struct NetworkManager {
    store: StateStore,
    dns: Arc<dyn DnsController>,
    /// Base /16 from which /24 network subnets are carved.
    base: Ipv4Addr,
    /// Serialises pool mutation so two instances never race on one pool.
    alloc_lock: Mutex<()>,
}

impl NetworkManager {
    pub fn new(store: StateStore, dns: Arc<dyn DnsController>) -> Self {
        Self {
            store,
            dns,
            base: Ipv4Addr::new(172, 18, 0, 0),
            alloc_lock: Mutex::new(()),
        }
    }

    /// Parameters for one instance on one network.
    ///
    /// Idempotent: an existing lease is returned unchanged and triggers
    /// no side effects.
    pub async fn instance_network_parameters(
        &self,
        ident: &InstanceIdent,
        network_id: &str,
        node_id: &NodeId,
        exposed_ports: Vec<String>,
        ingress_rules: Vec<FirewallRule>,
    ) -> NetworkResult<NetworkParameters> {
        let _guard = self.alloc_lock.lock().await;

        if let Some(lease) = self.store.get_lease(network_id, ident)? {
            let pool = self
                .store
                .get_network(network_id)?
                .ok_or_else(|| NetworkError::NotFound(network_id.to_string()))?;

            debug!(%ident, %network_id, ip = %lease.ip, "existing lease reused");
            return Ok(self.parameters(&pool, &lease.ip, exposed_ports, ingress_rules));
        }

        let mut pool = self.pool_for(network_id)?;
        let ip = self.next_address(&mut pool)?;

        self.store.put_network(&pool)?;
        self.store.put_lease(&NetworkLease {
            network_id: network_id.to_string(),
            ident: ident.clone(),
            ip: ip.clone(),
        })?;

        info!(%ident, %network_id, %node_id, %ip, "instance network allocated");

        self.restart_dns().await;

        Ok(self.parameters(&pool, &ip, exposed_ports, ingress_rules))
    }

    /// Release an instance's lease. The freed address goes to the back of
    /// the pool's reuse queue.
    pub async fn remove_instance_network(
        &self,
        ident: &InstanceIdent,
        network_id: &str,
    ) -> NetworkResult<()> {
        let _guard = self.alloc_lock.lock().await;

        let lease = self
            .store
            .get_lease(network_id, ident)?
            .ok_or_else(|| NetworkError::NotFound(format!("{network_id}:{ident}")))?;

        self.store.delete_lease(network_id, ident)?;

        if let Some(mut pool) = self.store.get_network(network_id)? {
            pool.free.push(lease.ip.clone());
            self.store.put_network(&pool)?;
        }

        debug!(%ident, %network_id, ip = %lease.ip, "instance network released");

        self.restart_dns().await;
        Ok(())
    }

    /// Recompute routing for a provider-network set change on a node:
    /// pools for every provider are ensured and the DNS side effect fires.
    pub async fn update_provider_network(
        &self,
        providers: &[String],
        node_id: &NodeId,
    ) -> NetworkResult<()> {
        let _guard = self.alloc_lock.lock().await;

        for provider in providers {
            let pool = self.pool_for(provider)?;
            self.store.put_network(&pool)?;
        }

        info!(%node_id, providers = providers.len(), "provider networks updated");

        self.restart_dns().await;
        Ok(())
    }

    // ── Internal ───────────────────────────────────────────────────

    /// Load or create the pool of a network. New networks take the next
    /// /24 under the base range, assigned densely in creation order.
    fn pool_for(&self, network_id: &str) -> NetworkResult<NetworkPool> {
        if let Some(pool) = self.store.get_network(network_id)? {
            return Ok(pool);
        }

        let index = self.store.list_networks()?.len();
        if index > 255 {
            return Err(NetworkError::PoolExhausted(network_id.to_string()));
        }

        let octets = self.base.octets();
        let subnet = format!("{}.{}.{index}.0/24", octets[0], octets[1]);

        debug!(%network_id, %subnet, "network pool created");

        Ok(NetworkPool {
            network_id: network_id.to_string(),
            subnet,
            next_host: 2,
            free: Vec::new(),
        })
    }

    /// Freed addresses are reused oldest-first; otherwise the untouched
    /// host range advances.
    fn next_address(&self, pool: &mut NetworkPool) -> NetworkResult<String> {
        if !pool.free.is_empty() {
            return Ok(pool.free.remove(0));
        }

        let base = subnet_base(&pool.subnet)?;
        if pool.next_host > 254 {
            return Err(NetworkError::PoolExhausted(pool.network_id.clone()));
        }

        let ip = Ipv4Addr::from(u32::from(base) + pool.next_host);
        pool.next_host += 1;
        Ok(ip.to_string())
    }

    fn parameters(
        &self,
        pool: &NetworkPool,
        ip: &str,
        exposed_ports: Vec<String>,
        ingress_rules: Vec<FirewallRule>,
    ) -> NetworkParameters {
        let dns = subnet_base(&pool.subnet)
            .map(|base| Ipv4Addr::from(u32::from(base) + 1).to_string())
            .ok();

        NetworkParameters {
            network_id: pool.network_id.clone(),
            ip: ip.to_string(),
            subnet: pool.subnet.clone(),
            dns_servers: dns.into_iter().collect(),
            ingress_rules,
            exposed_ports,
        }
    }

    async fn restart_dns(&self) {
        if let Err(e) = self.dns.restart_dns_server().await {
            // Reported, not fatal: the node retries on its next sync.
            warn!(error = %e, "dns restart failed");
        }
    }
}

fn subnet_base(subnet: &str) -> NetworkResult<Ipv4Addr> {
    subnet
        .split_once('/')
        .and_then(|(addr, _)| addr.parse().ok())
        .ok_or_else(|| NetworkError::InvalidSubnet(subnet.to_string()))
}
