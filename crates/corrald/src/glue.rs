//! Adapters that wire the subsystem crates together.
//!
//! Each adapter implements one crate's listener/seam trait and forwards
//! into the neighbouring subsystems, keeping the crates themselves free
//! of cross-dependencies.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use corral_config::{NodeConfigChangeListener, UnitConfig};
use corral_core::{
    DesiredNodeState, ErrorInfo, InstanceIdent, InstanceStatus, NodeConfig, NodeConfigStatus,
    NodeState, UnitConfigFile, UnitConfigStatus, UpdateItemInfo, UpdateItemStatus,
};
use corral_images::{ImageManager, ItemStatusListener};
use corral_launcher::{
    EnvVarsInstanceInfo, InstanceRunner, InstanceStatusListener, Launcher, NodeCatalog, NodeView,
    RunRequest, StartRequest,
};
use corral_monitoring::MonitoringAggregator;
use corral_network::NetworkManager;
use corral_node::{NodeInfoListener, NodeInfoProvider, NodeManager};
use corral_smcontroller::{LogChunk, SmConnectionObserver, SmController, SmIngressObserver};
use corral_updates::{
    InstanceLauncher, ItemInstaller, NodeRegistry, UnitConfigHandler, UpdateManager,
};

// ── Node catalog for the launcher ──────────────────────────────────

/// Merges provider liveness with unit-config priority/labels into the
/// launcher's node view.
pub struct SchedulerCatalog {
    pub provider: Arc<NodeInfoProvider>,
    pub config: Arc<UnitConfig>,
}

impl NodeCatalog for SchedulerCatalog {
    fn nodes(&self) -> Vec<NodeView> {
        self.provider
            .node_ids()
            .iter()
            .filter_map(|id| self.provider.node_info(id).ok())
            .map(|info| {
                let node_config = self
                    .config
                    .node_config(&info.node_id, &info.node_type)
                    .unwrap_or_else(|_| NodeConfig {
                        node_id: Some(info.node_id.clone()),
                        node_type: Some(info.node_type.clone()),
                        priority: 0,
                        labels: Vec::new(),
                        alert_rules: None,
                        resource_ratios: None,
                    });

                NodeView {
                    node_id: info.node_id.clone(),
                    node_type: info.node_type.clone(),
                    is_online: info.state == NodeState::Provisioned && info.is_connected,
                    priority: node_config.priority,
                    labels: node_config.labels,
                    max_instances: 0,
                }
            })
            .collect()
    }
}

// ── SM controller → node info provider ─────────────────────────────

/// Connection transitions and heartbeats feed SM liveness.
pub struct ProviderConnectionBridge {
    pub provider: Arc<NodeInfoProvider>,
}

impl SmConnectionObserver for ProviderConnectionBridge {
    fn on_sm_connected(&self, node_id: &str, _node_type: &str) {
        self.provider.on_sm_info_received(node_id);
    }

    fn on_sm_heartbeat(&self, node_id: &str) {
        self.provider.on_sm_info_received(node_id);
    }

    fn on_sm_disconnected(&self, node_id: &str) {
        self.provider.on_sm_disconnected(node_id);
    }
}

// ── SM controller ingress → subsystems ─────────────────────────────

/// Fans the SM → CM streams out to their consumers.
pub struct IngressBridge {
    pub launcher: Arc<Launcher>,
    pub monitoring: Arc<MonitoringAggregator>,
    pub alerts: Arc<corral_alerts::AlertAggregator>,
    pub config: Arc<UnitConfig>,
    pub updates: Arc<UpdateManager>,
}

impl SmIngressObserver for IngressBridge {
    fn on_instances_status(&self, _node_id: &str, statuses: &[InstanceStatus]) {
        self.launcher.on_instances_status(statuses.to_vec());
    }

    fn on_monitoring(&self, data: &corral_core::monitoring::NodeMonitoringData) {
        self.monitoring.on_monitoring_received(data.clone());
    }

    fn on_alert(&self, alert: &corral_core::Alert) {
        self.alerts.report_alert(alert.clone());
    }

    fn on_node_config_status(&self, status: &NodeConfigStatus) {
        // The self-healing push runs RPCs; hand it off the ingress path.
        let config = self.config.clone();
        let status = status.clone();
        tokio::spawn(async move { config.on_node_config_status(&status).await });
    }

    fn on_log(&self, chunk: &LogChunk) {
        // Log shipping to the cloud is the transport's concern.
        tracing::debug!(node_id = %chunk.node_id, part = chunk.part, "sm log chunk received");
    }
}

// ── Provider → node manager / monitoring / updates ─────────────────

/// Effective node transitions update the durable view and the reporters.
pub struct NodeFanout {
    pub manager: Arc<NodeManager>,
    pub monitoring: Arc<MonitoringAggregator>,
    pub updates: Arc<UpdateManager>,
}

impl NodeInfoListener for NodeFanout {
    fn on_node_info_changed(&self, info: &corral_core::NodeInfo) {
        if let Err(e) = self.manager.set_node_info(info.clone()) {
            warn!(node_id = %info.node_id, error = %e, "failed to store node info");
        }
        self.monitoring.on_node_info_changed(info);
        self.updates.on_node_info_changed(info.clone());
    }
}

// ── Launcher → monitoring / updates ────────────────────────────────

pub struct InstanceFanout {
    pub monitoring: Arc<MonitoringAggregator>,
    pub updates: Arc<UpdateManager>,
}

impl InstanceStatusListener for InstanceFanout {
    fn on_instances_changed(&self, statuses: &[InstanceStatus]) {
        self.monitoring.on_instances_changed(statuses);
        self.updates.on_instances_changed(statuses.to_vec());
    }
}

// ── Image manager → updates ────────────────────────────────────────

pub struct ItemFanout {
    pub updates: Arc<UpdateManager>,
}

impl ItemStatusListener for ItemFanout {
    fn on_item_status_changed(&self, status: &UpdateItemStatus) {
        self.updates.on_item_statuses(vec![status.clone()]);
    }
}

// ── Unit config → updates ──────────────────────────────────────────

pub struct ConfigFanout {
    pub updates: Arc<UpdateManager>,
}

impl NodeConfigChangeListener for ConfigFanout {
    fn on_node_config_changed(&self, _config: &NodeConfig) {
        self.updates.on_unit_config_changed();
    }
}

// ── Network-aware start/stop path ──────────────────────────────────

/// Decorates the SM controller's runner: allocates per-instance network
/// parameters before a start and releases the leases after a stop. Each
/// subject gets its own network.
pub struct NetworkAwareRunner {
    pub sm: Arc<SmController>,
    pub network: Arc<NetworkManager>,
}

#[async_trait]
impl InstanceRunner for NetworkAwareRunner {
    async fn start_instances(
        &self,
        node_id: &str,
        services: &[UpdateItemInfo],
        layers: &[UpdateItemInfo],
        instances: &[StartRequest],
        force_restart: bool,
    ) -> Result<(), ErrorInfo> {
        let mut wired = Vec::with_capacity(instances.len());

        for request in instances {
            let mut request = request.clone();
            let params = self
                .network
                .instance_network_parameters(
                    &request.ident,
                    &request.ident.subject_id,
                    &node_id.to_string(),
                    Vec::new(),
                    Vec::new(),
                )
                .await
                .map_err(|e| ErrorInfo::new(e.kind(), e.to_string()))?;
            request.network = Some(params);
            wired.push(request);
        }

        InstanceRunner::start_instances(
            self.sm.as_ref(),
            node_id,
            services,
            layers,
            &wired,
            force_restart,
        )
        .await
    }

    async fn stop_instances(
        &self,
        node_id: &str,
        instances: &[InstanceIdent],
    ) -> Result<(), ErrorInfo> {
        InstanceRunner::stop_instances(self.sm.as_ref(), node_id, instances).await?;

        for ident in instances {
            if let Err(e) = self
                .network
                .remove_instance_network(ident, &ident.subject_id)
                .await
            {
                // A missing lease just means the instance never started.
                tracing::debug!(%ident, error = %e, "no network lease to release");
            }
        }

        Ok(())
    }

    async fn override_env_vars(
        &self,
        node_id: &str,
        overrides: &[EnvVarsInstanceInfo],
    ) -> Result<(), ErrorInfo> {
        InstanceRunner::override_env_vars(self.sm.as_ref(), node_id, overrides).await
    }
}

// ── Facades for the update manager seams ───────────────────────────

pub struct InstallerFacade(pub Arc<ImageManager>);

#[async_trait]
impl ItemInstaller for InstallerFacade {
    async fn install_items(
        &self,
        items: Vec<corral_core::UpdateItemInfo>,
        chains: Vec<corral_core::CertificateChainInfo>,
    ) -> Vec<UpdateItemStatus> {
        self.0.clone().install_items(items, chains).await
    }

    fn remove_item(&self, item_id: &str) -> Result<(), ErrorInfo> {
        self.0.remove_item(item_id).map_err(|e| e.to_info())
    }

    fn item_statuses(&self) -> Result<Vec<UpdateItemStatus>, ErrorInfo> {
        self.0.item_statuses().map_err(|e| e.to_info())
    }
}

pub struct ConfigFacade(pub Arc<UnitConfig>);

#[async_trait]
impl UnitConfigHandler for ConfigFacade {
    async fn check_unit_config(&self, config: &UnitConfigFile) -> Result<(), ErrorInfo> {
        self.0.check_unit_config(config).await.map_err(|e| e.to_info())
    }

    async fn update_unit_config(&self, config: UnitConfigFile) -> Result<(), ErrorInfo> {
        self.0.update_unit_config(config).await.map_err(|e| e.to_info())
    }

    fn status(&self) -> UnitConfigStatus {
        self.0.status()
    }
}

pub struct LauncherFacade(pub Arc<Launcher>);

#[async_trait]
impl InstanceLauncher for LauncherFacade {
    async fn run_instances(&self, request: RunRequest) -> Result<Vec<InstanceStatus>, ErrorInfo> {
        self.0
            .run_instances(request)
            .await
            .map_err(|e| ErrorInfo::new(e.kind(), e.to_string()))
    }

    fn instance_statuses(&self) -> Vec<InstanceStatus> {
        self.0.instance_statuses()
    }
}

pub struct RegistryFacade(pub Arc<NodeManager>);

impl NodeRegistry for RegistryFacade {
    fn nodes(&self) -> Vec<corral_core::NodeInfo> {
        self.0.nodes()
    }

    fn set_node_state(&self, node_id: &str, state: DesiredNodeState) -> Result<(), ErrorInfo> {
        let state = match state {
            DesiredNodeState::Provisioned => NodeState::Provisioned,
            DesiredNodeState::Paused => NodeState::Paused,
        };

        self.0
            .set_node_state(node_id, state)
            .map_err(|e| ErrorInfo::new(e.kind(), e.to_string()))
    }
}
