//! Launcher — reconciles desired instances against the unit.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use corral_core::{
    ErrorInfo, ErrorKind, InstanceIdent, InstanceInfo, InstanceState, InstanceStatus,
    NetworkParameters, NodeId, StatusReason, UpdateItemInfo,
};
use corral_state::{PlacementRecord, StateStore};

use crate::error::LauncherResult;
use crate::placement::{NodeView, compute_placement, rank_candidates};

/// One instance start order for an SM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub ident: InstanceIdent,
    pub version: String,
    pub priority: u64,
    pub labels: Vec<String>,
    /// Filled in at the transport edge once the placement node is known.
    pub network: Option<NetworkParameters>,
}

/// One environment variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVarInfo {
    pub name: String,
    pub value: String,
}

/// Instance selector for environment overrides; `None` matches any.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub item_id: Option<String>,
    pub subject_id: Option<String>,
    pub instance: Option<u32>,
}

impl InstanceFilter {
    pub fn matches(&self, ident: &InstanceIdent) -> bool {
        self.item_id.as_deref().is_none_or(|v| v == ident.item_id)
            && self.subject_id.as_deref().is_none_or(|v| v == ident.subject_id)
            && self.instance.is_none_or(|v| v == ident.instance)
    }
}

/// Environment override with an optional time-to-live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVarsInstanceInfo {
    pub filter: InstanceFilter,
    pub variables: Vec<EnvVarInfo>,
    pub ttl_secs: Option<u64>,
}

/// Desired run set handed down by the update manager.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub services: Vec<UpdateItemInfo>,
    pub layers: Vec<UpdateItemInfo>,
    pub instances: Vec<InstanceInfo>,
    pub force_restart: bool,
}

/// Start/stop/env RPC surface, implemented by the SM controller.
#[async_trait]
pub trait InstanceRunner: Send + Sync {
    async fn start_instances(
        &self,
        node_id: &str,
        services: &[UpdateItemInfo],
        layers: &[UpdateItemInfo],
        instances: &[StartRequest],
        force_restart: bool,
    ) -> Result<(), ErrorInfo>;

    async fn stop_instances(
        &self,
        node_id: &str,
        instances: &[InstanceIdent],
    ) -> Result<(), ErrorInfo>;

    async fn override_env_vars(
        &self,
        node_id: &str,
        overrides: &[EnvVarsInstanceInfo],
    ) -> Result<(), ErrorInfo>;
}

/// Scheduler view of the unit's nodes, merged by the daemon from the
/// node info provider and the unit config.
pub trait NodeCatalog: Send + Sync {
    fn nodes(&self) -> Vec<NodeView>;
}

/// Receives batched instance status changes.
pub trait InstanceStatusListener: Send + Sync {
    fn on_instances_changed(&self, statuses: &[InstanceStatus]);
}

struct ActiveOverride {
    info: EnvVarsInstanceInfo,
    expires_at: Option<Instant>,
}

/// The instance scheduler.
pub struct Launcher {
    store: StateStore,
    runner: Arc<dyn InstanceRunner>,
    catalog: Arc<dyn NodeCatalog>,
    statuses: Mutex<HashMap<InstanceIdent, InstanceStatus>>,
    listeners: Mutex<Vec<Arc<dyn InstanceStatusListener>>>,
    /// Latest un-reconciled request; newer requests coalesce over older.
    pending: Mutex<Option<RunRequest>>,
    reconcile_lock: tokio::sync::Mutex<()>,
    env_overrides: Mutex<Vec<ActiveOverride>>,
    default_env_ttl: Duration,
}

impl Launcher {
    pub fn new(
        store: StateStore,
        runner: Arc<dyn InstanceRunner>,
        catalog: Arc<dyn NodeCatalog>,
        default_env_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runner,
            catalog,
            statuses: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            reconcile_lock: tokio::sync::Mutex::new(()),
            env_overrides: Mutex::new(Vec::new()),
            default_env_ttl,
        })
    }

    /// Subscribe to batched instance status changes.
    pub fn subscribe(&self, listener: Arc<dyn InstanceStatusListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Reconcile the desired instance set.
    ///
    /// Requests are serialised; bursts coalesce so only the newest request
    /// is reconciled. Placement failures surface per instance as
    /// `InstanceState::Failed`, never as a launcher-wide error.
    pub async fn run_instances(&self, request: RunRequest) -> LauncherResult<Vec<InstanceStatus>> {
        *self.pending.lock().unwrap() = Some(request);

        let _guard = self.reconcile_lock.lock().await;

        let Some(request) = self.pending.lock().unwrap().take() else {
            // A newer request already covered this one.
            return Ok(self.instance_statuses());
        };

        self.reconcile(request).await
    }

    /// Cached status of every known instance.
    pub fn instance_statuses(&self) -> Vec<InstanceStatus> {
        self.statuses.lock().unwrap().values().cloned().collect()
    }

    /// SM-side status ingress: overwrites the cached `(node, state)` pair
    /// per identity and fans the batch out to listeners.
    pub fn on_instances_status(&self, statuses: Vec<InstanceStatus>) {
        if statuses.is_empty() {
            return;
        }

        {
            let mut cache = self.statuses.lock().unwrap();
            for status in &statuses {
                cache.insert(status.ident.clone(), status.clone());
            }
        }

        self.notify(&statuses);
    }

    /// Apply environment overrides to matching placed instances and
    /// dispatch them per node. Overrides revert silently on TTL expiry.
    pub async fn override_env_vars(
        &self,
        overrides: Vec<EnvVarsInstanceInfo>,
    ) -> LauncherResult<()> {
        {
            let mut active = self.env_overrides.lock().unwrap();
            for info in &overrides {
                let ttl = info.ttl_secs.map(Duration::from_secs).unwrap_or(self.default_env_ttl);
                active.push(ActiveOverride {
                    info: info.clone(),
                    expires_at: Some(Instant::now() + ttl),
                });
            }
        }

        self.dispatch_env_overrides().await;
        Ok(())
    }

    /// Background TTL sweep for environment overrides.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let expired = {
                        let mut active = self.env_overrides.lock().unwrap();
                        let before = active.len();
                        active.retain(|o| o.expires_at.is_none_or(|t| t > Instant::now()));
                        before - active.len()
                    };

                    if expired > 0 {
                        debug!(expired, "environment overrides expired");
                        self.dispatch_env_overrides().await;
                    }
                }
                _ = shutdown.changed() => {
                    debug!("launcher stopped");
                    return;
                }
            }
        }
    }

    // ── Reconciliation ─────────────────────────────────────────────

    async fn reconcile(&self, request: RunRequest) -> LauncherResult<Vec<InstanceStatus>> {
        info!(
            instances = request.instances.len(),
            force_restart = request.force_restart,
            "reconcile instances"
        );

        let nodes = self.catalog.nodes();
        let current: HashMap<InstanceIdent, PlacementRecord> = self
            .store
            .list_placements()?
            .into_iter()
            .map(|record| (record.ident.clone(), record))
            .collect();

        let excluded: HashMap<InstanceIdent, HashSet<NodeId>> = HashMap::new();
        let plan = compute_placement(
            &request.instances,
            &current,
            &nodes,
            request.force_restart,
            &excluded,
        );

        let mut changed = Vec::new();

        self.stop_removed(&plan.stop).await?;

        // Capacity used this round: keeps claim their slot first.
        let mut used: HashMap<String, u32> = HashMap::new();
        for assignment in &plan.keep {
            *used.entry(assignment.node_id.clone()).or_insert(0) += 1;
        }

        for assignment in &plan.start {
            let info = find_instance_info(&request.instances, &assignment.ident);
            let status = self
                .start_with_retries(&request, assignment, info, &nodes, &mut used)
                .await?;
            changed.push(status);
        }

        for ident in &plan.unplaced {
            changed.push(self.failed_status(
                ident,
                &request,
                ErrorInfo::new(ErrorKind::NotFound, "no suitable node"),
            ));
        }

        {
            let mut cache = self.statuses.lock().unwrap();
            for status in &changed {
                cache.insert(status.ident.clone(), status.clone());
            }
        }

        if !changed.is_empty() {
            self.notify(&changed);
        }

        Ok(self.instance_statuses())
    }

    /// Try the ranked candidates for one instance until a start succeeds
    /// or the list is exhausted. Exhaustion is a per-instance `Failed`
    /// status carrying the last underlying error.
    async fn start_with_retries(
        &self,
        request: &RunRequest,
        assignment: &crate::placement::Assignment,
        info: Option<&InstanceInfo>,
        nodes: &[NodeView],
        used: &mut HashMap<String, u32>,
    ) -> LauncherResult<InstanceStatus> {
        let ident = &assignment.ident;
        let labels = info.map(|i| i.labels.clone()).unwrap_or_default();
        let previous = assignment.prev_node_id.as_deref();

        // Force restart: stop the old copy before starting again.
        if request.force_restart {
            if let Some(prev) = previous {
                if let Err(e) = self.runner.stop_instances(prev, &[ident.clone()]).await {
                    warn!(%ident, node_id = %prev, error = %e, "stop before restart failed");
                }
            }
        }

        let start_request = StartRequest {
            ident: ident.clone(),
            version: item_version(&request.services, &ident.item_id),
            priority: info.map(|i| i.priority).unwrap_or(0),
            labels: labels.clone(),
            network: None,
        };

        let services = services_for(&request.services, &ident.item_id);
        let mut excluded = HashSet::new();
        let mut last_error: Option<ErrorInfo> = None;

        loop {
            let borrowed: HashMap<&str, u32> =
                used.iter().map(|(k, v)| (k.as_str(), *v)).collect();
            let candidates = rank_candidates(nodes, &labels, previous, &borrowed, &excluded);

            let Some(node_id) = candidates.first().cloned() else {
                let error = last_error.unwrap_or_else(|| {
                    ErrorInfo::new(ErrorKind::NotFound, "no suitable node")
                });
                warn!(%ident, error = %error, "instance placement exhausted");
                return Ok(self.failed_status(ident, request, error));
            };

            match self
                .runner
                .start_instances(
                    &node_id,
                    &services,
                    &request.layers,
                    std::slice::from_ref(&start_request),
                    request.force_restart,
                )
                .await
            {
                Ok(()) => {
                    *used.entry(node_id.clone()).or_insert(0) += 1;

                    self.store.put_placement(&PlacementRecord {
                        ident: ident.clone(),
                        node_id: node_id.clone(),
                        prev_node_id: assignment.prev_node_id.clone(),
                    })?;

                    debug!(%ident, %node_id, "instance started");

                    return Ok(InstanceStatus {
                        ident: ident.clone(),
                        version: start_request.version.clone(),
                        node_id,
                        state: InstanceState::Activating,
                        reason: StatusReason::Update,
                        state_checksum: None,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(%ident, %node_id, error = %e, "start failed, trying next candidate");
                    excluded.insert(node_id);
                    last_error = Some(e);
                }
            }
        }
    }

    async fn stop_removed(&self, stops: &[(NodeId, InstanceIdent)]) -> LauncherResult<()> {
        let mut by_node: HashMap<&NodeId, Vec<InstanceIdent>> = HashMap::new();
        for (node_id, ident) in stops {
            by_node.entry(node_id).or_default().push(ident.clone());
        }

        for (node_id, idents) in by_node {
            if let Err(e) = self.runner.stop_instances(node_id, &idents).await {
                // The node may be offline; the placement is removed anyway
                // since the instance is no longer desired.
                warn!(%node_id, error = %e, "stop failed");
            }

            for ident in &idents {
                self.store.delete_placement(ident)?;
                self.statuses.lock().unwrap().remove(ident);
                debug!(%ident, %node_id, "instance stopped");
            }
        }

        Ok(())
    }

    fn failed_status(
        &self,
        ident: &InstanceIdent,
        request: &RunRequest,
        error: ErrorInfo,
    ) -> InstanceStatus {
        InstanceStatus {
            ident: ident.clone(),
            version: item_version(&request.services, &ident.item_id),
            node_id: String::new(),
            state: InstanceState::Failed,
            reason: StatusReason::Update,
            state_checksum: None,
            error: Some(error),
        }
    }

    async fn dispatch_env_overrides(&self) {
        let active: Vec<EnvVarsInstanceInfo> = self
            .env_overrides
            .lock()
            .unwrap()
            .iter()
            .map(|o| o.info.clone())
            .collect();

        let placements = match self.store.list_placements() {
            Ok(placements) => placements,
            Err(e) => {
                warn!(error = %e, "failed to list placements for env overrides");
                return;
            }
        };

        let mut nodes: HashMap<NodeId, Vec<EnvVarsInstanceInfo>> = HashMap::new();
        for placement in &placements {
            let entry = nodes.entry(placement.node_id.clone()).or_default();
            for over in active.iter().filter(|o| o.filter.matches(&placement.ident)) {
                if !entry.contains(over) {
                    entry.push(over.clone());
                }
            }
        }

        for (node_id, overrides) in nodes {
            if let Err(e) = self.runner.override_env_vars(&node_id, &overrides).await {
                warn!(%node_id, error = %e, "env override dispatch failed");
            }
        }
    }

    fn notify(&self, statuses: &[InstanceStatus]) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_instances_changed(statuses);
        }
    }
}

fn find_instance_info<'a>(
    instances: &'a [InstanceInfo],
    ident: &InstanceIdent,
) -> Option<&'a InstanceInfo> {
    instances
        .iter()
        .find(|i| i.item_id == ident.item_id && i.subject_id == ident.subject_id)
}

fn item_version(services: &[UpdateItemInfo], item_id: &str) -> String {
    services
        .iter()
        .find(|s| s.item_id == item_id)
        .map(|s| s.version.clone())
        .unwrap_or_default()
}

fn services_for(services: &[UpdateItemInfo], item_id: &str) -> Vec<UpdateItemInfo> {
    services
        .iter()
        .filter(|s| s.item_id == item_id)
        .cloned()
        .collect()
}
