//! SM controller implementation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use corral_config::NodeConfigController;
use corral_core::limits::MONITORING_SAMPLE_WINDOW;
use corral_core::monitoring::{MonitoringSample, NodeMonitoringData};
use corral_core::{
    Alert, ErrorInfo, InstanceIdent, InstanceStatus, NodeConfig, NodeConfigStatus, NodeId,
    NodeType, UpdateItemInfo,
};
use corral_launcher::{EnvVarsInstanceInfo, InstanceRunner, StartRequest};

use crate::error::{SmError, SmResult};
use crate::retry::{RetryPolicy, is_transient};

/// Per-node RPC surface, implemented by the transport layer over the
/// mutually-authenticated SM stream.
#[async_trait]
pub trait SmClient: Send + Sync {
    async fn check_node_config(&self, version: &str, config: &NodeConfig)
    -> Result<(), ErrorInfo>;

    async fn set_node_config(&self, version: &str, config: &NodeConfig) -> Result<(), ErrorInfo>;

    async fn start_instances(
        &self,
        services: &[UpdateItemInfo],
        layers: &[UpdateItemInfo],
        instances: &[StartRequest],
        force_restart: bool,
    ) -> Result<(), ErrorInfo>;

    async fn stop_instances(&self, instances: &[InstanceIdent]) -> Result<(), ErrorInfo>;

    async fn override_env_vars(
        &self,
        overrides: &[EnvVarsInstanceInfo],
    ) -> Result<(), ErrorInfo>;
}

/// One chunk of a shipped log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogChunk {
    pub node_id: NodeId,
    pub source: Option<InstanceIdent>,
    pub part: u32,
    pub part_count: u32,
    pub content: String,
}

/// SM → CM stream observer. Every callback is snapshot-then-invoke.
pub trait SmIngressObserver: Send + Sync {
    fn on_instances_status(&self, _node_id: &str, _statuses: &[InstanceStatus]) {}
    fn on_monitoring(&self, _data: &NodeMonitoringData) {}
    fn on_alert(&self, _alert: &Alert) {}
    fn on_node_config_status(&self, _status: &NodeConfigStatus) {}
    fn on_log(&self, _chunk: &LogChunk) {}
    /// A node rotated one of its IAM-issued certificates.
    fn on_cert_changed(&self, _node_id: &str, _cert_type: &str) {}
}

/// Connection lifecycle observer (feeds the node info provider).
pub trait SmConnectionObserver: Send + Sync {
    fn on_sm_connected(&self, node_id: &str, node_type: &str);
    fn on_sm_heartbeat(&self, node_id: &str);
    fn on_sm_disconnected(&self, node_id: &str);
}

struct NodeLink {
    node_id: NodeId,
    client: Arc<dyn SmClient>,
    node_type: NodeType,
    config_status: Option<NodeConfigStatus>,
    monitoring: Vec<MonitoringSample>,
}

/// Multiplexes per-node SM clients behind one controller.
pub struct SmController {
    retry: RetryPolicy,
    /// Connected nodes in connect order; fan-outs iterate this order.
    links: Mutex<Vec<NodeLink>>,
    ingress: Mutex<Vec<Arc<dyn SmIngressObserver>>>,
    connection: Mutex<Vec<Arc<dyn SmConnectionObserver>>>,
}

impl SmController {
    pub fn new(retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            retry,
            links: Mutex::new(Vec::new()),
            ingress: Mutex::new(Vec::new()),
            connection: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to the SM → CM data streams.
    pub fn subscribe_ingress(&self, observer: Arc<dyn SmIngressObserver>) {
        self.ingress.lock().unwrap().push(observer);
    }

    /// Subscribe to connection transitions and heartbeats.
    pub fn subscribe_connection(&self, observer: Arc<dyn SmConnectionObserver>) {
        self.connection.lock().unwrap().push(observer);
    }

    // ── Transport ingress ──────────────────────────────────────────

    /// A node's SM stream came up.
    pub fn on_sm_connected(
        &self,
        node_id: &str,
        node_type: &str,
        client: Arc<dyn SmClient>,
    ) {
        info!(%node_id, %node_type, "sm connected");

        {
            let mut links = self.links.lock().unwrap();
            links.retain(|link| link.node_id != node_id);
            links.push(NodeLink {
                node_id: node_id.to_string(),
                client,
                node_type: node_type.to_string(),
                config_status: None,
                monitoring: Vec::new(),
            });
        }

        for observer in self.connection_observers() {
            observer.on_sm_connected(node_id, node_type);
        }
    }

    /// A node's SM stream closed. The link is dropped; cached monitoring
    /// goes with it, persisted placements stay.
    pub fn on_sm_disconnected(&self, node_id: &str) {
        info!(%node_id, "sm disconnected");

        self.links.lock().unwrap().retain(|link| link.node_id != node_id);

        for observer in self.connection_observers() {
            observer.on_sm_disconnected(node_id);
        }
    }

    /// Instance status stream.
    pub fn on_instances_status(&self, node_id: &str, statuses: Vec<InstanceStatus>) {
        debug!(%node_id, count = statuses.len(), "instance statuses received");
        self.heartbeat(node_id);

        for observer in self.ingress_observers() {
            observer.on_instances_status(node_id, &statuses);
        }
    }

    /// Monitoring stream; samples also feed the per-node average window.
    pub fn on_monitoring(&self, data: NodeMonitoringData) {
        self.heartbeat(&data.node_id);

        {
            let mut links = self.links.lock().unwrap();
            if let Some(link) = links.iter_mut().find(|l| l.node_id == data.node_id) {
                if link.monitoring.len() >= MONITORING_SAMPLE_WINDOW {
                    link.monitoring.remove(0);
                }
                link.monitoring.push(data.sample.clone());
            }
        }

        for observer in self.ingress_observers() {
            observer.on_monitoring(&data);
        }
    }

    /// Alert stream.
    pub fn on_alert(&self, node_id: &str, alert: Alert) {
        self.heartbeat(node_id);

        for observer in self.ingress_observers() {
            observer.on_alert(&alert);
        }
    }

    /// Node config status stream.
    pub fn on_node_config_status(&self, status: NodeConfigStatus) {
        debug!(node_id = %status.node_id, version = %status.version, "node config status");
        self.heartbeat(&status.node_id);

        if let Some(link) = self
            .links
            .lock()
            .unwrap()
            .iter_mut()
            .find(|l| l.node_id == status.node_id)
        {
            link.config_status = Some(status.clone());
        }

        for observer in self.ingress_observers() {
            observer.on_node_config_status(&status);
        }
    }

    /// Log stream.
    pub fn on_log(&self, chunk: LogChunk) {
        self.heartbeat(&chunk.node_id);

        for observer in self.ingress_observers() {
            observer.on_log(&chunk);
        }
    }

    /// Certificate rotation notification.
    pub fn on_cert_changed(&self, node_id: &str, cert_type: &str) {
        debug!(%node_id, %cert_type, "certificate changed");
        self.heartbeat(node_id);

        for observer in self.ingress_observers() {
            observer.on_cert_changed(node_id, cert_type);
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Mean of the last monitoring window received from a node.
    pub fn average_monitoring(&self, node_id: &str) -> SmResult<MonitoringSample> {
        let links = self.links.lock().unwrap();
        let link = links
            .iter()
            .find(|l| l.node_id == node_id)
            .ok_or_else(|| SmError::NotConnected(node_id.to_string()))?;

        average(&link.monitoring)
            .ok_or_else(|| SmError::NotConnected(format!("{node_id}: no monitoring yet")))
    }

    /// Connected node ids.
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.links.lock().unwrap().iter().map(|l| l.node_id.clone()).collect()
    }

    // ── Outbound RPC with retry ────────────────────────────────────

    async fn with_client<F, Fut>(&self, node_id: &str, call: F) -> SmResult<()>
    where
        F: Fn(Arc<dyn SmClient>) -> Fut,
        Fut: Future<Output = Result<(), ErrorInfo>>,
    {
        let client = {
            let links = self.links.lock().unwrap();
            links
                .iter()
                .find(|l| l.node_id == node_id)
                .map(|link| link.client.clone())
                .ok_or_else(|| SmError::NotConnected(node_id.to_string()))?
        };

        let mut attempt = 0;
        loop {
            match call(client.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if !is_transient(&e) => return Err(SmError::Rejected(e)),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retry.attempts {
                        return Err(SmError::Exhausted { attempts: attempt, error: e });
                    }

                    let delay = self.retry.delay(attempt - 1);
                    warn!(%node_id, error = %e, ?delay, attempt, "sm rpc failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn heartbeat(&self, node_id: &str) {
        for observer in self.connection_observers() {
            observer.on_sm_heartbeat(node_id);
        }
    }

    fn ingress_observers(&self) -> Vec<Arc<dyn SmIngressObserver>> {
        self.ingress.lock().unwrap().clone()
    }

    fn connection_observers(&self) -> Vec<Arc<dyn SmConnectionObserver>> {
        self.connection.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeConfigController for SmController {
    async fn check_node_config(
        &self,
        node_id: &str,
        version: &str,
        config: &NodeConfig,
    ) -> Result<(), ErrorInfo> {
        self.with_client(node_id, |client| {
            let version = version.to_string();
            let config = config.clone();
            async move { client.check_node_config(&version, &config).await }
        })
        .await
        .map_err(|e| e.to_info())
    }

    async fn set_node_config(
        &self,
        node_id: &str,
        version: &str,
        config: &NodeConfig,
    ) -> Result<(), ErrorInfo> {
        self.with_client(node_id, |client| {
            let version = version.to_string();
            let config = config.clone();
            async move { client.set_node_config(&version, &config).await }
        })
        .await
        .map_err(|e| e.to_info())
    }

    async fn node_config_statuses(&self) -> Result<Vec<NodeConfigStatus>, ErrorInfo> {
        let links = self.links.lock().unwrap();
        Ok(links
            .iter()
            .map(|link| {
                link.config_status.clone().unwrap_or_else(|| NodeConfigStatus {
                    node_id: link.node_id.clone(),
                    node_type: link.node_type.clone(),
                    version: "0.0.0".to_string(),
                    error: None,
                })
            })
            .collect())
    }
}

#[async_trait]
impl InstanceRunner for SmController {
    async fn start_instances(
        &self,
        node_id: &str,
        services: &[UpdateItemInfo],
        layers: &[UpdateItemInfo],
        instances: &[StartRequest],
        force_restart: bool,
    ) -> Result<(), ErrorInfo> {
        self.with_client(node_id, |client| {
            let services = services.to_vec();
            let layers = layers.to_vec();
            let instances = instances.to_vec();
            async move {
                client
                    .start_instances(&services, &layers, &instances, force_restart)
                    .await
            }
        })
        .await
        .map_err(|e| e.to_info())
    }

    async fn stop_instances(
        &self,
        node_id: &str,
        instances: &[InstanceIdent],
    ) -> Result<(), ErrorInfo> {
        self.with_client(node_id, |client| {
            let instances = instances.to_vec();
            async move { client.stop_instances(&instances).await }
        })
        .await
        .map_err(|e| e.to_info())
    }

    async fn override_env_vars(
        &self,
        node_id: &str,
        overrides: &[EnvVarsInstanceInfo],
    ) -> Result<(), ErrorInfo> {
        self.with_client(node_id, |client| {
            let overrides = overrides.to_vec();
            async move { client.override_env_vars(&overrides).await }
        })
        .await
        .map_err(|e| e.to_info())
    }
}

fn average(samples: &[MonitoringSample]) -> Option<MonitoringSample> {
    if samples.is_empty() {
        return None;
    }

    let n = samples.len() as u64;
    Some(MonitoringSample {
        timestamp_ms: samples.last().unwrap().timestamp_ms,
        cpu: samples.iter().map(|s| s.cpu).sum::<f64>() / n as f64,
        ram: samples.iter().map(|s| s.ram).sum::<u64>() / n,
        partitions: Vec::new(),
        download: samples.iter().map(|s| s.download).sum::<u64>() / n,
        upload: samples.iter().map(|s| s.upload).sum::<u64>() / n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Client that fails the first `fail_first` calls with the given kind.
    struct FlakyClient {
        calls: AtomicUsize,
        fail_first: usize,
        kind: ErrorKind,
    }

    impl FlakyClient {
        fn new(fail_first: usize, kind: ErrorKind) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail_first, kind })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn answer(&self) -> Result<(), ErrorInfo> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(ErrorInfo::new(self.kind, "induced"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SmClient for FlakyClient {
        async fn check_node_config(
            &self,
            _version: &str,
            _config: &NodeConfig,
        ) -> Result<(), ErrorInfo> {
            self.answer()
        }

        async fn set_node_config(
            &self,
            _version: &str,
            _config: &NodeConfig,
        ) -> Result<(), ErrorInfo> {
            self.answer()
        }

        async fn start_instances(
            &self,
            _services: &[UpdateItemInfo],
            _layers: &[UpdateItemInfo],
            _instances: &[StartRequest],
            _force_restart: bool,
        ) -> Result<(), ErrorInfo> {
            self.answer()
        }

        async fn stop_instances(&self, _instances: &[InstanceIdent]) -> Result<(), ErrorInfo> {
            self.answer()
        }

        async fn override_env_vars(
            &self,
            _overrides: &[EnvVarsInstanceInfo],
        ) -> Result<(), ErrorInfo> {
            self.answer()
        }
    }

    fn node_config() -> NodeConfig {
        NodeConfig {
            node_id: Some("node1".to_string()),
            node_type: None,
            priority: 0,
            labels: Vec::new(),
            alert_rules: None,
            resource_ratios: None,
        }
    }

    fn sample(ts: u64, cpu: f64) -> MonitoringSample {
        MonitoringSample {
            timestamp_ms: ts,
            cpu,
            ram: 100,
            partitions: Vec::new(),
            download: 0,
            upload: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_success() {
        let controller = SmController::new(RetryPolicy::default());
        let client = FlakyClient::new(2, ErrorKind::Timeout);
        controller.on_sm_connected("node1", "gateway", client.clone());

        controller
            .set_node_config("node1", "1.0.0", &node_config())
            .await
            .unwrap();

        assert_eq!(client.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_with_last_error() {
        let controller = SmController::new(RetryPolicy::default());
        let client = FlakyClient::new(usize::MAX, ErrorKind::Timeout);
        controller.on_sm_connected("node1", "gateway", client.clone());

        let result = controller.set_node_config("node1", "1.0.0", &node_config()).await;

        let error = result.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(client.calls(), RetryPolicy::default().attempts);
    }

    #[tokio::test]
    async fn final_errors_do_not_retry() {
        let controller = SmController::new(RetryPolicy::default());
        let client = FlakyClient::new(usize::MAX, ErrorKind::InvalidArgument);
        controller.on_sm_connected("node1", "gateway", client.clone());

        let result = controller.check_node_config("node1", "1.0.0", &node_config()).await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidArgument);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn disconnected_node_is_not_found() {
        let controller = SmController::new(RetryPolicy::default());
        let client = FlakyClient::new(0, ErrorKind::Timeout);

        controller.on_sm_connected("node1", "gateway", client);
        controller.on_sm_disconnected("node1");

        let result = controller.set_node_config("node1", "1.0.0", &node_config()).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::NotFound);
        assert!(controller.connected_nodes().is_empty());
    }

    #[tokio::test]
    async fn statuses_default_until_reported() {
        let controller = SmController::new(RetryPolicy::default());
        controller.on_sm_connected("node1", "gateway", FlakyClient::new(0, ErrorKind::Timeout));

        let statuses = controller.node_config_statuses().await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].version, "0.0.0");

        controller.on_node_config_status(NodeConfigStatus {
            node_id: "node1".to_string(),
            node_type: "gateway".to_string(),
            version: "2.0.0".to_string(),
            error: None,
        });

        let statuses = controller.node_config_statuses().await.unwrap();
        assert_eq!(statuses[0].version, "2.0.0");
    }

    #[tokio::test]
    async fn monitoring_feeds_average_window() {
        let controller = SmController::new(RetryPolicy::default());
        controller.on_sm_connected("node1", "gateway", FlakyClient::new(0, ErrorKind::Timeout));

        for (ts, cpu) in [(1000, 10.0), (2000, 20.0), (3000, 30.0)] {
            controller.on_monitoring(NodeMonitoringData {
                node_id: "node1".to_string(),
                sample: sample(ts, cpu),
                instances: Vec::new(),
            });
        }

        let avg = controller.average_monitoring("node1").unwrap();
        assert_eq!(avg.cpu, 20.0);

        assert!(matches!(
            controller.average_monitoring("node2"),
            Err(SmError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn ingress_fans_out_to_observers() {
        #[derive(Default)]
        struct Recording {
            statuses: Mutex<usize>,
            alerts: Mutex<usize>,
            configs: Mutex<usize>,
            logs: Mutex<usize>,
        }

        impl SmIngressObserver for Recording {
            fn on_instances_status(&self, _node_id: &str, statuses: &[InstanceStatus]) {
                *self.statuses.lock().unwrap() += statuses.len();
            }
            fn on_alert(&self, _alert: &Alert) {
                *self.alerts.lock().unwrap() += 1;
            }
            fn on_node_config_status(&self, _status: &NodeConfigStatus) {
                *self.configs.lock().unwrap() += 1;
            }
            fn on_log(&self, _chunk: &LogChunk) {
                *self.logs.lock().unwrap() += 1;
            }
        }

        let controller = SmController::new(RetryPolicy::default());
        let observer = Arc::new(Recording::default());
        controller.subscribe_ingress(observer.clone());

        controller.on_instances_status("node1", Vec::new());
        controller.on_alert(
            "node1",
            Alert::System(corral_core::alerts::SystemAlert {
                timestamp_ms: 1,
                node_id: "node1".to_string(),
                message: "msg".to_string(),
            }),
        );
        controller.on_node_config_status(NodeConfigStatus {
            node_id: "node1".to_string(),
            node_type: "gateway".to_string(),
            version: "1.0.0".to_string(),
            error: None,
        });
        controller.on_log(LogChunk {
            node_id: "node1".to_string(),
            source: None,
            part: 1,
            part_count: 1,
            content: "line".to_string(),
        });

        assert_eq!(*observer.alerts.lock().unwrap(), 1);
        assert_eq!(*observer.configs.lock().unwrap(), 1);
        assert_eq!(*observer.logs.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn connection_observers_see_lifecycle_and_heartbeats() {
        #[derive(Default)]
        struct Recording {
            events: Mutex<Vec<String>>,
        }

        impl SmConnectionObserver for Recording {
            fn on_sm_connected(&self, node_id: &str, _node_type: &str) {
                self.events.lock().unwrap().push(format!("connect:{node_id}"));
            }
            fn on_sm_heartbeat(&self, node_id: &str) {
                self.events.lock().unwrap().push(format!("beat:{node_id}"));
            }
            fn on_sm_disconnected(&self, node_id: &str) {
                self.events.lock().unwrap().push(format!("disconnect:{node_id}"));
            }
        }

        let controller = SmController::new(RetryPolicy::default());
        let observer = Arc::new(Recording::default());
        controller.subscribe_connection(observer.clone());

        controller.on_sm_connected("node1", "gateway", FlakyClient::new(0, ErrorKind::Timeout));
        controller.on_monitoring(NodeMonitoringData {
            node_id: "node1".to_string(),
            sample: sample(1, 1.0),
            instances: Vec::new(),
        });
        controller.on_sm_disconnected("node1");

        assert_eq!(
            *observer.events.lock().unwrap(),
            vec![
                "connect:node1".to_string(),
                "beat:node1".to_string(),
                "disconnect:node1".to_string(),
            ]
        );
    }
}
