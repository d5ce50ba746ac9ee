//! Update manager implementation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use corral_core::{
    CertificateChainInfo, CertificateInfo, DesiredNodeState, DesiredStatus, ErrorInfo,
    InstallCertStatus, InstanceStatus, ItemType, NodeInfo, SubjectId, UnitConfigFile,
    UnitConfigStatus, UnitStatus, UpdateItemInfo, UpdateItemStatus, UpdateState,
};
use corral_launcher::RunRequest;
use corral_state::{PersistedUpdate, StateStore};

/// Image manager facade.
#[async_trait]
pub trait ItemInstaller: Send + Sync {
    async fn install_items(
        &self,
        items: Vec<UpdateItemInfo>,
        chains: Vec<CertificateChainInfo>,
    ) -> Vec<UpdateItemStatus>;

    fn remove_item(&self, item_id: &str) -> Result<(), ErrorInfo>;

    fn item_statuses(&self) -> Result<Vec<UpdateItemStatus>, ErrorInfo>;
}

/// Unit config facade.
#[async_trait]
pub trait UnitConfigHandler: Send + Sync {
    async fn check_unit_config(&self, config: &UnitConfigFile) -> Result<(), ErrorInfo>;
    async fn update_unit_config(&self, config: UnitConfigFile) -> Result<(), ErrorInfo>;
    fn status(&self) -> UnitConfigStatus;
}

/// Launcher facade.
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    async fn run_instances(&self, request: RunRequest) -> Result<Vec<InstanceStatus>, ErrorInfo>;
    fn instance_statuses(&self) -> Vec<InstanceStatus>;
}

/// Node view + desired-node-state application (IAM collaborator).
pub trait NodeRegistry: Send + Sync {
    fn nodes(&self) -> Vec<NodeInfo>;
    fn set_node_state(&self, node_id: &str, state: DesiredNodeState) -> Result<(), ErrorInfo>;
}

/// Unit subject source (IAM collaborator).
pub trait IdentProvider: Send + Sync {
    fn unit_subjects(&self) -> Vec<SubjectId>;
}

/// Certificate installation (IAM collaborator).
#[async_trait]
pub trait CertHandler: Send + Sync {
    async fn install_certificates(&self, certs: &[CertificateInfo]) -> Vec<InstallCertStatus>;
}

/// Cloud-side unit status transmission.
#[async_trait]
pub trait StatusSender: Send + Sync {
    async fn send_unit_status(&self, status: &UnitStatus) -> Result<(), ErrorInfo>;
}

enum Event {
    Desired(DesiredStatus),
    CloudConnected,
    CloudDisconnected,
    InstallAllowed,
    ItemsChanged(Vec<UpdateItemStatus>),
    InstancesChanged(Vec<InstanceStatus>),
    NodeChanged(NodeInfo),
    ConfigChanged,
    SubjectsChanged,
}

struct Machine {
    update_state: UpdateState,
    desired: Option<DesiredStatus>,
    connected: bool,
    /// Delta sections accumulated while disconnected; superseded by the
    /// full status sent on reconnect.
    pending: UnitStatus,
}

/// The top-level reconciler.
pub struct UpdateManager {
    store: StateStore,
    config: Arc<dyn UnitConfigHandler>,
    installer: Arc<dyn ItemInstaller>,
    launcher: Arc<dyn InstanceLauncher>,
    nodes: Arc<dyn NodeRegistry>,
    idents: Arc<dyn IdentProvider>,
    certs: Arc<dyn CertHandler>,
    sender: Arc<dyn StatusSender>,
    auto_install: bool,
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    machine: Mutex<Machine>,
}

impl UpdateManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StateStore,
        config: Arc<dyn UnitConfigHandler>,
        installer: Arc<dyn ItemInstaller>,
        launcher: Arc<dyn InstanceLauncher>,
        nodes: Arc<dyn NodeRegistry>,
        idents: Arc<dyn IdentProvider>,
        certs: Arc<dyn CertHandler>,
        sender: Arc<dyn StatusSender>,
        auto_install: bool,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);

        Arc::new(Self {
            store,
            config,
            installer,
            launcher,
            nodes,
            idents,
            certs,
            sender,
            auto_install,
            tx,
            rx: Mutex::new(Some(rx)),
            machine: Mutex::new(Machine {
                update_state: UpdateState::None,
                desired: None,
                connected: false,
                pending: UnitStatus { is_delta: true, ..UnitStatus::default() },
            }),
        })
    }

    // ── Entry points (all funnel into the mailbox) ─────────────────

    pub fn handle_desired_status(&self, desired: DesiredStatus) {
        self.post(Event::Desired(desired));
    }

    pub fn on_connect(&self) {
        self.post(Event::CloudConnected);
    }

    pub fn on_disconnect(&self) {
        self.post(Event::CloudDisconnected);
    }

    /// Cloud confirmed a pending update may install.
    pub fn allow_install(&self) {
        self.post(Event::InstallAllowed);
    }

    pub fn on_item_statuses(&self, statuses: Vec<UpdateItemStatus>) {
        self.post(Event::ItemsChanged(statuses));
    }

    pub fn on_instances_changed(&self, statuses: Vec<InstanceStatus>) {
        self.post(Event::InstancesChanged(statuses));
    }

    pub fn on_node_info_changed(&self, info: NodeInfo) {
        self.post(Event::NodeChanged(info));
    }

    pub fn on_unit_config_changed(&self) {
        self.post(Event::ConfigChanged);
    }

    /// IAM reported a change of the unit's subject list.
    pub fn on_subjects_changed(&self) {
        self.post(Event::SubjectsChanged);
    }

    /// Current pipeline stage.
    pub fn update_state(&self) -> UpdateState {
        self.machine.lock().unwrap().update_state
    }

    /// The single consumer task. Resumes a persisted, unfinished update
    /// before draining the mailbox.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("update manager already running");

        self.resume_persisted();

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { return };
                    self.process(event).await;
                }
                _ = shutdown.changed() => {
                    debug!("update manager stopped");
                    return;
                }
            }
        }
    }

    // ── Event processing ───────────────────────────────────────────

    fn post(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            warn!("update manager mailbox full, event dropped");
        }
    }

    fn resume_persisted(&self) {
        match self.store.get_update() {
            Ok(Some(persisted)) => {
                let mut machine = self.machine.lock().unwrap();
                machine.desired = Some(persisted.desired.clone());
                machine.update_state = persisted.state;
                drop(machine);

                if persisted.state != UpdateState::None {
                    info!(state = ?persisted.state, "resuming unfinished update");
                    self.post(Event::Desired(persisted.desired));
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to load persisted update state"),
        }
    }

    async fn process(&self, event: Event) {
        match event {
            Event::Desired(desired) => self.process_desired(desired).await,
            Event::CloudConnected => {
                self.machine.lock().unwrap().connected = true;
                info!("cloud connected");
                self.send_full_status().await;
            }
            Event::CloudDisconnected => {
                info!("cloud disconnected");
                self.machine.lock().unwrap().connected = false;
            }
            Event::InstallAllowed => {
                let resume = {
                    let machine = self.machine.lock().unwrap();
                    (machine.update_state == UpdateState::Pending)
                        .then(|| machine.desired.clone())
                        .flatten()
                };

                match resume {
                    Some(desired) => self.continue_install(desired).await,
                    None => debug!("install allowed with no pending update"),
                }
            }
            Event::ItemsChanged(statuses) => {
                self.emit_delta(UnitStatus {
                    is_delta: true,
                    update_items: Some(statuses),
                    ..UnitStatus::default()
                })
                .await;
            }
            Event::InstancesChanged(_) => {
                // Report the full aggregated view so each identity appears
                // exactly once.
                self.emit_delta(UnitStatus {
                    is_delta: true,
                    instances: Some(self.launcher.instance_statuses()),
                    ..UnitStatus::default()
                })
                .await;
            }
            Event::NodeChanged(_) => {
                self.emit_delta(UnitStatus {
                    is_delta: true,
                    nodes: Some(self.nodes.nodes()),
                    ..UnitStatus::default()
                })
                .await;
            }
            Event::ConfigChanged => {
                self.emit_delta(UnitStatus {
                    is_delta: true,
                    unit_config: Some(vec![self.config.status()]),
                    ..UnitStatus::default()
                })
                .await;
            }
            Event::SubjectsChanged => {
                self.emit_delta(UnitStatus {
                    is_delta: true,
                    unit_subjects: Some(self.idents.unit_subjects()),
                    ..UnitStatus::default()
                })
                .await;
            }
        }
    }

    async fn process_desired(&self, desired: DesiredStatus) {
        // Re-ingesting an already-applied desired status is a no-op.
        {
            let machine = self.machine.lock().unwrap();
            if machine.update_state == UpdateState::None
                && machine.desired.as_ref() == Some(&desired)
            {
                info!("desired status already applied");
                return;
            }
        }

        info!(
            items = desired.update_items.len(),
            instances = desired.instances.len(),
            "desired status received"
        );

        self.apply_node_states(&desired);

        self.transition(UpdateState::Downloading, &desired);

        let statuses = self
            .installer
            .install_items(desired.update_items.clone(), desired.certificate_chains.clone())
            .await;
        debug!(count = statuses.len(), "items acquired");

        self.transition(UpdateState::Pending, &desired);

        if self.auto_install {
            self.continue_install(desired).await;
        } else {
            info!("update pending cloud confirmation");
        }
    }

    /// Pending → Installing → Launching → Finalizing → None.
    async fn continue_install(&self, desired: DesiredStatus) {
        self.transition(UpdateState::Installing, &desired);

        if let Some(config) = &desired.unit_config {
            // Every node pre-validates its slice before anything is applied.
            match self.config.check_unit_config(config).await {
                Ok(()) => {
                    if let Err(e) = self.config.update_unit_config(config.clone()).await {
                        warn!(error = %e, "unit config update rejected");
                    }
                }
                // AlreadyExist just means this revision was applied before.
                Err(e) => warn!(error = %e, "unit config check failed"),
            }
        }

        let cert_statuses = if desired.certificates.is_empty() {
            Vec::new()
        } else {
            self.certs.install_certificates(&desired.certificates).await
        };

        self.remove_undesired_items(&desired);

        self.transition(UpdateState::Launching, &desired);

        let run = RunRequest {
            services: items_of(&desired, ItemType::Service),
            layers: items_of(&desired, ItemType::Layer),
            instances: desired.instances.clone(),
            force_restart: false,
        };

        let instances = match self.launcher.run_instances(run).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "launcher failed");
                self.launcher.instance_statuses()
            }
        };

        self.transition(UpdateState::Finalizing, &desired);

        let mut delta = UnitStatus {
            is_delta: true,
            unit_config: Some(vec![self.config.status()]),
            update_items: self.installer.item_statuses().ok(),
            instances: Some(instances),
            ..UnitStatus::default()
        };
        if !cert_statuses.is_empty() {
            delta.certificates = Some(cert_statuses);
        }
        self.emit_delta(delta).await;

        self.transition(UpdateState::None, &desired);
        info!("update finished");
    }

    fn apply_node_states(&self, desired: &DesiredStatus) {
        for node in &desired.nodes {
            if let Err(e) = self.nodes.set_node_state(&node.node_id, node.state) {
                warn!(node_id = %node.node_id, error = %e, "failed to apply node state");
            }
        }
    }

    fn remove_undesired_items(&self, desired: &DesiredStatus) {
        let stored = match self.installer.item_statuses() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "failed to list stored items");
                return;
            }
        };

        for status in stored {
            let still_desired = desired
                .update_items
                .iter()
                .any(|item| item.item_id == status.item_id);
            if still_desired {
                continue;
            }

            if let Err(e) = self.installer.remove_item(&status.item_id) {
                warn!(item_id = %status.item_id, error = %e, "failed to remove item");
            }
        }
    }

    fn transition(&self, state: UpdateState, desired: &DesiredStatus) {
        debug!(?state, "update state");

        {
            let mut machine = self.machine.lock().unwrap();
            machine.update_state = state;
            machine.desired = Some(desired.clone());
        }

        if let Err(e) = self.store.put_update(&PersistedUpdate {
            desired: desired.clone(),
            state,
        }) {
            warn!(error = %e, "failed to persist update state");
        }
    }

    // ── Status emission ────────────────────────────────────────────

    async fn send_full_status(&self) {
        let status = UnitStatus {
            is_delta: false,
            unit_config: Some(vec![self.config.status()]),
            nodes: Some(self.nodes.nodes()),
            update_items: self.installer.item_statuses().ok(),
            instances: Some(self.launcher.instance_statuses()),
            unit_subjects: Some(self.idents.unit_subjects()),
            certificates: None,
        };

        if let Err(e) = self.sender.send_unit_status(&status).await {
            warn!(error = %e, "failed to send full unit status");
            return;
        }

        // The full report supersedes any buffered delta.
        self.machine.lock().unwrap().pending =
            UnitStatus { is_delta: true, ..UnitStatus::default() };
    }

    /// Send a delta while connected; otherwise coalesce it into the
    /// pending buffer, newest section wins.
    async fn emit_delta(&self, delta: UnitStatus) {
        let to_send = {
            let mut machine = self.machine.lock().unwrap();

            merge_delta(&mut machine.pending, delta);

            if !machine.connected {
                return;
            }

            let pending = machine.pending.clone();
            machine.pending = UnitStatus { is_delta: true, ..UnitStatus::default() };
            pending
        };

        if to_send.is_empty() {
            return;
        }

        if let Err(e) = self.sender.send_unit_status(&to_send).await {
            warn!(error = %e, "failed to send unit status delta");
            // Put the sections back for the next emission.
            let mut machine = self.machine.lock().unwrap();
            let buffered = std::mem::replace(&mut machine.pending, to_send);
            let restored = &mut machine.pending;
            merge_delta(restored, buffered);
        }
    }
}

fn merge_delta(into: &mut UnitStatus, from: UnitStatus) {
    if from.unit_config.is_some() {
        into.unit_config = from.unit_config;
    }
    if from.nodes.is_some() {
        into.nodes = from.nodes;
    }
    if from.update_items.is_some() {
        into.update_items = from.update_items;
    }
    if from.instances.is_some() {
        into.instances = from.instances;
    }
    if from.unit_subjects.is_some() {
        into.unit_subjects = from.unit_subjects;
    }
    if from.certificates.is_some() {
        into.certificates = from.certificates;
    }
}

fn items_of(desired: &DesiredStatus, item_type: ItemType) -> Vec<UpdateItemInfo> {
    desired
        .update_items
        .iter()
        .filter(|item| item.item_type == item_type)
        .cloned()
        .collect()
}
