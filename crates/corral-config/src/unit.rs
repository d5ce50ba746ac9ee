//! Unit config implementation.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use corral_core::{
    ConfigState, ErrorInfo, NodeConfig, NodeConfigStatus, NodeId, NodeType, UnitConfigFile,
    UnitConfigStatus, version,
};

use crate::error::{ConfigError, ConfigResult};

/// Per-node config sync surface, implemented by the SM controller.
#[async_trait]
pub trait NodeConfigController: Send + Sync {
    /// Ask a node to pre-validate its config slice.
    async fn check_node_config(
        &self,
        node_id: &str,
        version: &str,
        config: &NodeConfig,
    ) -> Result<(), ErrorInfo>;

    /// Apply a config slice on a node.
    async fn set_node_config(
        &self,
        node_id: &str,
        version: &str,
        config: &NodeConfig,
    ) -> Result<(), ErrorInfo>;

    /// Last reported config status of every known node.
    async fn node_config_statuses(&self) -> Result<Vec<NodeConfigStatus>, ErrorInfo>;
}

/// Local subscriber to the current node's config slice.
pub trait NodeConfigChangeListener: Send + Sync {
    fn on_node_config_changed(&self, config: &NodeConfig);
}

struct Inner {
    config: UnitConfigFile,
    state: ConfigState,
    error: Option<ErrorInfo>,
}

/// The CM's authoritative unit config.
pub struct UnitConfig {
    path: PathBuf,
    current_node_id: NodeId,
    current_node_type: NodeType,
    controller: Arc<dyn NodeConfigController>,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Arc<dyn NodeConfigChangeListener>>>,
}

impl UnitConfig {
    /// Load the config file. A missing file is `Absent` at version
    /// `0.0.0`; a file that fails to parse is `Failed` with the parse
    /// error recorded.
    pub fn load(
        path: &Path,
        current_node_id: impl Into<NodeId>,
        current_node_type: impl Into<NodeType>,
        controller: Arc<dyn NodeConfigController>,
    ) -> Self {
        let inner = match std::fs::read_to_string(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no unit config installed yet");
                Inner {
                    config: UnitConfigFile::default(),
                    state: ConfigState::Absent,
                    error: None,
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read unit config");
                Inner {
                    config: UnitConfigFile::default(),
                    state: ConfigState::Failed,
                    error: Some(ErrorInfo::new(corral_core::ErrorKind::Runtime, e.to_string())),
                }
            }
            Ok(content) => match serde_json::from_str::<UnitConfigFile>(&content) {
                Ok(config) => {
                    info!(version = %config.version, "unit config loaded");
                    Inner { config, state: ConfigState::Installed, error: None }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse unit config");
                    Inner {
                        config: UnitConfigFile::default(),
                        state: ConfigState::Failed,
                        error: Some(ErrorInfo::new(
                            corral_core::ErrorKind::InvalidArgument,
                            e.to_string(),
                        )),
                    }
                }
            },
        };

        Self {
            path: path.to_path_buf(),
            current_node_id: current_node_id.into(),
            current_node_type: current_node_type.into(),
            controller,
            inner: Mutex::new(inner),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Current status for unit status reporting.
    pub fn status(&self) -> UnitConfigStatus {
        let inner = self.inner.lock().unwrap();
        UnitConfigStatus {
            version: inner.config.version.clone(),
            state: inner.state,
            error: inner.error.clone(),
        }
    }

    /// Installed version.
    pub fn version(&self) -> String {
        self.inner.lock().unwrap().config.version.clone()
    }

    /// Validate a candidate: monotonic version, then every node whose
    /// reported version differs pre-validates its slice.
    pub async fn check_unit_config(&self, candidate: &UnitConfigFile) -> ConfigResult<()> {
        debug!(version = %candidate.version, "check unit config");

        self.check_version(&candidate.version)?;

        let statuses = self
            .controller
            .node_config_statuses()
            .await
            .map_err(ConfigError::Controller)?;

        for status in &statuses {
            if status.version == candidate.version && status.error.is_none() {
                continue;
            }

            let config = find_node_config(&status.node_id, &status.node_type, candidate)
                .unwrap_or_else(|| {
                    warn!(node_id = %status.node_id, "no node config in candidate");
                    NodeConfig {
                        node_id: Some(status.node_id.clone()),
                        node_type: None,
                        priority: 0,
                        labels: Vec::new(),
                        alert_rules: None,
                        resource_ratios: None,
                    }
                });

            self.controller
                .check_node_config(&status.node_id, &candidate.version, &config)
                .await
                .map_err(|error| ConfigError::NodeRejected {
                    node_id: status.node_id.clone(),
                    error,
                })?;
        }

        Ok(())
    }

    /// Apply a candidate: rewrite the file atomically, install the value,
    /// push per-node slices, notify local listeners for the current node.
    pub async fn update_unit_config(&self, candidate: UnitConfigFile) -> ConfigResult<()> {
        debug!(version = %candidate.version, "update unit config");

        self.check_version(&candidate.version)?;

        self.write_atomically(&candidate)?;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.config = candidate.clone();
            inner.state = ConfigState::Installed;
            inner.error = None;
        }

        info!(version = %candidate.version, "unit config installed");

        let statuses = self
            .controller
            .node_config_statuses()
            .await
            .map_err(ConfigError::Controller)?;

        for status in &statuses {
            if status.version == candidate.version && status.error.is_none() {
                continue;
            }

            self.push_node_config(&status.node_id, &status.node_type, &candidate)
                .await;
        }

        Ok(())
    }

    /// Config slice for a node: exact id match wins, else first type
    /// match, else `NotFound`.
    pub fn node_config(&self, node_id: &str, node_type: &str) -> ConfigResult<NodeConfig> {
        let inner = self.inner.lock().unwrap();
        find_node_config(node_id, node_type, &inner.config)
            .ok_or_else(|| ConfigError::NotFound(node_id.to_string()))
    }

    /// Config slice of the node this daemon runs on.
    pub fn current_node_config(&self) -> ConfigResult<NodeConfig> {
        self.node_config(&self.current_node_id, &self.current_node_type)
    }

    /// Subscribe to changes of the current node's slice.
    pub fn subscribe_node_config_change(&self, listener: Arc<dyn NodeConfigChangeListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// A node reported its config status. A stale version or an error
    /// triggers a proactive re-push of the current config (self-healing).
    pub async fn on_node_config_status(&self, status: &NodeConfigStatus) {
        debug!(
            node_id = %status.node_id,
            version = %status.version,
            error = ?status.error,
            "node config status"
        );

        let current = {
            let inner = self.inner.lock().unwrap();
            if inner.state != ConfigState::Installed {
                return;
            }
            if status.version == inner.config.version && status.error.is_none() {
                return;
            }
            inner.config.clone()
        };

        self.push_node_config(&status.node_id, &status.node_type, &current)
            .await;
    }

    async fn push_node_config(&self, node_id: &str, node_type: &str, config: &UnitConfigFile) {
        let node_config = match find_node_config(node_id, node_type, config) {
            Some(config) => config,
            None => {
                warn!(%node_id, "no node config to push");
                return;
            }
        };

        if let Err(e) = self
            .controller
            .set_node_config(node_id, &config.version, &node_config)
            .await
        {
            // The node will report a stale status and be retried then.
            warn!(%node_id, error = %e, "failed to set node config");
            return;
        }

        if node_id == self.current_node_id {
            self.notify_listeners(&node_config);
        }
    }

    fn check_version(&self, candidate: &str) -> ConfigResult<()> {
        let inner = self.inner.lock().unwrap();

        if inner.state == ConfigState::Failed {
            // The installed config is unusable; accept any valid candidate.
            warn!(error = ?inner.error, "skipping version check, installed config failed");
            return Ok(());
        }

        match version::compare(candidate, &inner.config.version)? {
            Ordering::Equal => Err(ConfigError::AlreadyInstalled(candidate.to_string())),
            Ordering::Less => Err(ConfigError::WrongVersion {
                candidate: candidate.to_string(),
                installed: inner.config.version.clone(),
            }),
            Ordering::Greater => Ok(()),
        }
    }

    fn write_atomically(&self, config: &UnitConfigFile) -> ConfigResult<()> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(config)?)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn notify_listeners(&self, config: &NodeConfig) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_node_config_changed(config);
        }
    }
}

/// Node-config lookup: exact `node_id` match wins, else first `node_type`
/// match, else none.
fn find_node_config(
    node_id: &str,
    node_type: &str,
    config: &UnitConfigFile,
) -> Option<NodeConfig> {
    config
        .nodes
        .iter()
        .find(|n| n.node_id.as_deref() == Some(node_id))
        .or_else(|| {
            config
                .nodes
                .iter()
                .find(|n| n.node_type.as_deref() == Some(node_type))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::ErrorKind;

    /// Controller that records calls and answers from a canned status list.
    struct RecordingController {
        statuses: Mutex<Vec<NodeConfigStatus>>,
        checks: Mutex<Vec<(String, String)>>,
        sets: Mutex<Vec<(String, String)>>,
        reject: Option<String>,
    }

    impl RecordingController {
        fn new(statuses: Vec<NodeConfigStatus>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses),
                checks: Mutex::new(Vec::new()),
                sets: Mutex::new(Vec::new()),
                reject: None,
            })
        }

        fn rejecting(statuses: Vec<NodeConfigStatus>, node_id: &str) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses),
                checks: Mutex::new(Vec::new()),
                sets: Mutex::new(Vec::new()),
                reject: Some(node_id.to_string()),
            })
        }

        fn checks(&self) -> Vec<(String, String)> {
            self.checks.lock().unwrap().clone()
        }

        fn sets(&self) -> Vec<(String, String)> {
            self.sets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NodeConfigController for RecordingController {
        async fn check_node_config(
            &self,
            node_id: &str,
            version: &str,
            _config: &NodeConfig,
        ) -> Result<(), ErrorInfo> {
            if self.reject.as_deref() == Some(node_id) {
                return Err(ErrorInfo::new(ErrorKind::Failed, "resource missing"));
            }
            self.checks
                .lock()
                .unwrap()
                .push((node_id.to_string(), version.to_string()));
            Ok(())
        }

        async fn set_node_config(
            &self,
            node_id: &str,
            version: &str,
            _config: &NodeConfig,
        ) -> Result<(), ErrorInfo> {
            self.sets
                .lock()
                .unwrap()
                .push((node_id.to_string(), version.to_string()));
            Ok(())
        }

        async fn node_config_statuses(&self) -> Result<Vec<NodeConfigStatus>, ErrorInfo> {
            Ok(self.statuses.lock().unwrap().clone())
        }
    }

    struct RecordingListener {
        configs: Mutex<Vec<NodeConfig>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self { configs: Mutex::new(Vec::new()) })
        }
    }

    impl NodeConfigChangeListener for RecordingListener {
        fn on_node_config_changed(&self, config: &NodeConfig) {
            self.configs.lock().unwrap().push(config.clone());
        }
    }

    fn status(node_id: &str, version: &str) -> NodeConfigStatus {
        NodeConfigStatus {
            node_id: node_id.to_string(),
            node_type: "gateway".to_string(),
            version: version.to_string(),
            error: None,
        }
    }

    fn config_with_nodes(version: &str, node_ids: &[&str]) -> UnitConfigFile {
        UnitConfigFile {
            version: version.to_string(),
            format_version: "1".to_string(),
            nodes: node_ids
                .iter()
                .map(|id| NodeConfig {
                    node_id: Some(id.to_string()),
                    node_type: None,
                    priority: 0,
                    labels: Vec::new(),
                    alert_rules: None,
                    resource_ratios: None,
                })
                .collect(),
        }
    }

    fn write_config(dir: &tempfile::TempDir, config: &UnitConfigFile) -> PathBuf {
        let path = dir.path().join("unit_config.json");
        std::fs::write(&path, serde_json::to_vec(config).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn absent_file_is_absent_at_zero_version() {
        let dir = tempfile::tempdir().unwrap();
        let controller = RecordingController::new(Vec::new());
        let unit = UnitConfig::load(
            &dir.path().join("missing.json"),
            "node1",
            "gateway",
            controller,
        );

        let status = unit.status();
        assert_eq!(status.state, ConfigState::Absent);
        assert_eq!(status.version, "0.0.0");
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn broken_file_is_failed_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit_config.json");
        std::fs::write(&path, "{ broken").unwrap();

        let controller = RecordingController::new(Vec::new());
        let unit = UnitConfig::load(&path, "node1", "gateway", controller);

        let status = unit.status();
        assert_eq!(status.state, ConfigState::Failed);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn upgrade_checks_each_stale_node_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &config_with_nodes("1.0.0", &["node1", "node2"]));

        let controller = RecordingController::new(vec![
            status("node1", "1.0.0"),
            status("node2", "1.0.0"),
        ]);
        let unit = UnitConfig::load(&path, "node1", "gateway", controller.clone());

        unit.check_unit_config(&config_with_nodes("2.0.0", &["node1", "node2"]))
            .await
            .unwrap();

        assert_eq!(
            controller.checks(),
            vec![
                ("node1".to_string(), "2.0.0".to_string()),
                ("node2".to_string(), "2.0.0".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn update_rewrites_file_pushes_nodes_and_notifies_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &config_with_nodes("1.0.0", &["node1", "node2"]));

        let controller = RecordingController::new(vec![
            status("node1", "1.0.0"),
            status("node2", "1.0.0"),
        ]);
        let unit = UnitConfig::load(&path, "node1", "gateway", controller.clone());

        let listener = RecordingListener::new();
        unit.subscribe_node_config_change(listener.clone());

        unit.update_unit_config(config_with_nodes("2.0.0", &["node1", "node2"]))
            .await
            .unwrap();

        // Fan-out in reported-status order.
        assert_eq!(
            controller.sets(),
            vec![
                ("node1".to_string(), "2.0.0".to_string()),
                ("node2".to_string(), "2.0.0".to_string()),
            ]
        );

        // Local listeners only for the current node (node1).
        assert_eq!(listener.configs.lock().unwrap().len(), 1);

        // File rewritten.
        let on_disk: UnitConfigFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.version, "2.0.0");
        assert_eq!(unit.version(), "2.0.0");
    }

    #[tokio::test]
    async fn update_skips_nodes_already_at_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &config_with_nodes("1.0.0", &["node1", "node2"]));

        let controller = RecordingController::new(vec![
            status("node1", "2.0.0"),
            status("node2", "1.0.0"),
        ]);
        let unit = UnitConfig::load(&path, "node1", "gateway", controller.clone());

        unit.update_unit_config(config_with_nodes("2.0.0", &["node1", "node2"]))
            .await
            .unwrap();

        assert_eq!(controller.sets(), vec![("node2".to_string(), "2.0.0".to_string())]);
    }

    #[tokio::test]
    async fn equal_and_lower_versions_do_not_mutate() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &config_with_nodes("2.0.0", &["node1"]));

        let controller = RecordingController::new(vec![status("node1", "2.0.0")]);
        let unit = UnitConfig::load(&path, "node1", "gateway", controller.clone());

        let equal = unit.update_unit_config(config_with_nodes("2.0.0", &["node1"])).await;
        assert!(matches!(equal, Err(ConfigError::AlreadyInstalled(_))));

        let lower = unit.update_unit_config(config_with_nodes("1.5.0", &["node1"])).await;
        assert!(matches!(lower, Err(ConfigError::WrongVersion { .. })));

        // No pushes, no file change.
        assert!(controller.sets().is_empty());
        assert_eq!(unit.version(), "2.0.0");
        let on_disk: UnitConfigFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.version, "2.0.0");
    }

    #[tokio::test]
    async fn check_surfaces_node_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &config_with_nodes("1.0.0", &["node1"]));

        let controller = RecordingController::rejecting(vec![status("node1", "1.0.0")], "node1");
        let unit = UnitConfig::load(&path, "node1", "gateway", controller);

        let result = unit.check_unit_config(&config_with_nodes("2.0.0", &["node1"])).await;
        assert!(matches!(result, Err(ConfigError::NodeRejected { .. })));
    }

    #[tokio::test]
    async fn node_config_lookup_prefers_id_over_type() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_nodes("1.0.0", &["node1"]);
        config.nodes.push(NodeConfig {
            node_id: None,
            node_type: Some("gateway".to_string()),
            priority: 9,
            labels: Vec::new(),
            alert_rules: None,
            resource_ratios: None,
        });
        let path = write_config(&dir, &config);

        let controller = RecordingController::new(Vec::new());
        let unit = UnitConfig::load(&path, "node1", "gateway", controller);

        // Exact id match.
        let by_id = unit.node_config("node1", "gateway").unwrap();
        assert_eq!(by_id.node_id.as_deref(), Some("node1"));

        // Fallback to type.
        let by_type = unit.node_config("node9", "gateway").unwrap();
        assert_eq!(by_type.priority, 9);

        // Neither.
        assert!(matches!(
            unit.node_config("node9", "telemetry"),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stale_status_triggers_self_healing_push() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &config_with_nodes("2.0.0", &["node1", "node2"]));

        let controller = RecordingController::new(Vec::new());
        let unit = UnitConfig::load(&path, "node1", "gateway", controller.clone());

        // Up-to-date status: nothing happens.
        unit.on_node_config_status(&status("node2", "2.0.0")).await;
        assert!(controller.sets().is_empty());

        // Stale status: current config is re-pushed.
        unit.on_node_config_status(&status("node2", "1.0.0")).await;
        assert_eq!(controller.sets(), vec![("node2".to_string(), "2.0.0".to_string())]);
    }

    #[tokio::test]
    async fn failed_config_accepts_any_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit_config.json");
        std::fs::write(&path, "garbage").unwrap();

        let controller = RecordingController::new(Vec::new());
        let unit = UnitConfig::load(&path, "node1", "gateway", controller);

        unit.update_unit_config(config_with_nodes("0.0.1", &["node1"]))
            .await
            .unwrap();
        assert_eq!(unit.status().state, ConfigState::Installed);
    }
}
