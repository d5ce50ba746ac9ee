//! Daemon assembly and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use corral_alerts::AlertAggregator;
use corral_allocator::{HostFs, SpaceManager};
use corral_config::UnitConfig;
use corral_core::{CmConfig, CoreComponent};
use corral_images::{ImageManager, StoredItemRemover};
use corral_launcher::Launcher;
use corral_monitoring::MonitoringAggregator;
use corral_network::NetworkManager;
use corral_node::{IamNodeSource, NodeInfoProvider, NodeManager};
use corral_smcontroller::{RetryPolicy, SmController};
use corral_state::StateStore;
use corral_updates::UpdateManager;

use crate::collab::{
    ArchiveUnpacker, DetachedCloud, FileCertStore, FileIamSource, HttpDownloader, NodeLocalDns,
    PlainCrypto,
};
use crate::glue::{
    ConfigFacade, ConfigFanout, IngressBridge, InstallerFacade, InstanceFanout, ItemFanout,
    LauncherFacade, NetworkAwareRunner, NodeFanout, ProviderConnectionBridge, RegistryFacade,
    SchedulerCatalog,
};

/// The assembled communication manager.
///
/// Holds the public handles the external transports attach to: the SM
/// controller for the node links, the update manager and aggregators for
/// the cloud link.
pub struct Core {
    pub store: StateStore,
    pub sm: Arc<SmController>,
    pub provider: Arc<NodeInfoProvider>,
    pub node_manager: Arc<NodeManager>,
    pub unit_config: Arc<UnitConfig>,
    pub images: Arc<ImageManager>,
    pub network: Arc<NetworkManager>,
    pub launcher: Arc<Launcher>,
    pub alerts: Arc<AlertAggregator>,
    pub monitoring: Arc<MonitoringAggregator>,
    pub updates: Arc<UpdateManager>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Core {
    /// Build and start every subsystem in dependency order.
    pub fn build(config: &CmConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.work_dir).context("create work dir")?;
        std::fs::create_dir_all(&config.storage_dir).context("create storage dir")?;

        let store =
            StateStore::open(&config.database_file()).context("open state database")?;

        let space = SpaceManager::new(Arc::new(HostFs));
        let remover = Arc::new(StoredItemRemover::new(store.clone(), &config.storage_dir));
        let allocator = space
            .allocator(
                &config.storage_dir,
                config.images.partition_limit_percent,
                Some(remover.clone()),
            )
            .context("create image store allocator")?;

        let sm = SmController::new(RetryPolicy::default());

        let iam = Arc::new(FileIamSource::new(&config.work_dir.join("nodes.json")));
        let provider = Arc::new(NodeInfoProvider::new(
            iam.as_ref(),
            Duration::from_secs(config.nodes_connection_timeout_secs),
        ));

        let (current_node_id, current_node_type) = current_node(iam.as_ref());

        let unit_config = Arc::new(UnitConfig::load(
            &config.unit_config_file(),
            current_node_id,
            current_node_type,
            sm.clone(),
        ));

        let images = ImageManager::new(
            &config.storage_dir,
            store.clone(),
            allocator,
            remover,
            Arc::new(HttpDownloader::new()),
            Arc::new(PlainCrypto),
            Arc::new(ArchiveUnpacker),
            config.images.install_workers,
        );

        let network = Arc::new(NetworkManager::new(store.clone(), Arc::new(NodeLocalDns)));

        let node_manager = Arc::new(NodeManager::new(store.clone()).context("load node manager")?);

        let launcher = Launcher::new(
            store.clone(),
            Arc::new(NetworkAwareRunner { sm: sm.clone(), network: network.clone() }),
            Arc::new(SchedulerCatalog {
                provider: provider.clone(),
                config: unit_config.clone(),
            }),
            Duration::from_secs(config.launcher.instance_ttl_secs),
        );

        let alerts = AlertAggregator::new(
            Arc::new(DetachedCloud),
            Duration::from_secs(config.alerts.send_period_secs),
        );

        let monitoring = MonitoringAggregator::new(
            Arc::new(DetachedCloud),
            Duration::from_secs(config.monitoring.send_period_secs),
        );

        let updates = UpdateManager::new(
            store.clone(),
            Arc::new(ConfigFacade(unit_config.clone())),
            Arc::new(InstallerFacade(images.clone())),
            Arc::new(LauncherFacade(launcher.clone())),
            Arc::new(RegistryFacade(node_manager.clone())),
            iam.clone(),
            Arc::new(FileCertStore::new(&config.work_dir.join("certs"))),
            Arc::new(DetachedCloud),
            config.auto_install,
        );

        // ── Wiring ─────────────────────────────────────────────────

        provider.subscribe(Arc::new(NodeFanout {
            manager: node_manager.clone(),
            monitoring: monitoring.clone(),
            updates: updates.clone(),
        }));

        launcher.subscribe(Arc::new(InstanceFanout {
            monitoring: monitoring.clone(),
            updates: updates.clone(),
        }));

        images.subscribe(Arc::new(ItemFanout { updates: updates.clone() }));

        unit_config.subscribe_node_config_change(Arc::new(ConfigFanout {
            updates: updates.clone(),
        }));

        sm.subscribe_connection(Arc::new(ProviderConnectionBridge {
            provider: provider.clone(),
        }));

        sm.subscribe_ingress(Arc::new(IngressBridge {
            launcher: launcher.clone(),
            monitoring: monitoring.clone(),
            alerts: alerts.clone(),
            config: unit_config.clone(),
            updates: updates.clone(),
        }));

        // ── Background tasks ───────────────────────────────────────

        let (shutdown, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(provider.clone().run(shutdown_rx.clone())),
            tokio::spawn(launcher.clone().run(shutdown_rx.clone())),
            tokio::spawn(alerts.clone().run(shutdown_rx.clone())),
            tokio::spawn(monitoring.clone().run(shutdown_rx.clone())),
            tokio::spawn(images.clone().run(
                Duration::from_secs(config.images.remove_outdated_period_secs),
                shutdown_rx.clone(),
            )),
            tokio::spawn(updates.clone().run(shutdown_rx)),
        ];

        info!("communication manager assembled");

        Ok(Self {
            store,
            sm,
            provider,
            node_manager,
            unit_config,
            images,
            network,
            launcher,
            alerts,
            monitoring,
            updates,
            shutdown,
            tasks,
        })
    }

    /// The cloud transport reports its link up.
    pub fn on_cloud_connect(&self) {
        self.updates.on_connect();
        self.alerts.on_connect();
        self.monitoring.on_connect();
    }

    /// The cloud transport reports its link down.
    pub fn on_cloud_disconnect(&self) {
        self.updates.on_disconnect();
        self.alerts.on_disconnect();
        self.monitoring.on_disconnect();
    }

    /// Graceful drain: stop intake, flush the aggregators, wait for the
    /// background tasks. Outstanding space reservations release on drop.
    pub async fn shutdown(self) {
        info!("shutting down");

        let _ = self.shutdown.send(true);

        self.alerts.flush().await;
        self.monitoring.flush().await;

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task aborted");
            }
        }

        info!("shutdown complete");
    }
}

/// Identity of the node this daemon runs on: the roster entry carrying
/// the `cm` component, or a bare default before provisioning.
fn current_node(iam: &FileIamSource) -> (String, String) {
    for node_id in iam.node_ids() {
        if let Some(info) = iam.node_info(&node_id) {
            if info.core_components().contains(&CoreComponent::Cm) {
                return (info.node_id, info.node_type);
            }
        }
    }

    ("cm".to_string(), "cm".to_string())
}
