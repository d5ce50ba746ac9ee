//! Monitoring aggregator implementation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use corral_core::limits::{MONITORING_SAMPLE_WINDOW, MONITORING_STATE_WINDOW};
use corral_core::monitoring::{
    InstanceStateRecord, MonitoringSample, NodeMonitoringData, NodeStateRecord,
};
use corral_core::{ErrorInfo, InstanceIdent, InstanceStatus, NodeId, NodeInfo};

/// Accumulated windows for one node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMonitoringWindow {
    pub node_id: NodeId,
    pub samples: Vec<MonitoringSample>,
    pub states: Vec<NodeStateRecord>,
}

/// Accumulated windows for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMonitoringWindow {
    pub ident: InstanceIdent,
    pub node_id: NodeId,
    pub samples: Vec<MonitoringSample>,
    pub states: Vec<InstanceStateRecord>,
}

/// The aggregate shipped to the cloud on each flush.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MonitoringMessage {
    pub nodes: Vec<NodeMonitoringWindow>,
    pub instances: Vec<InstanceMonitoringWindow>,
}

impl MonitoringMessage {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.instances.is_empty()
    }
}

/// Cloud-side monitoring transmission.
#[async_trait]
pub trait MonitoringSender: Send + Sync {
    async fn send_monitoring(&self, monitoring: &MonitoringMessage) -> Result<(), ErrorInfo>;
}

struct Inner {
    message: MonitoringMessage,
    is_connected: bool,
}

/// Collects per-node and per-instance usage, compresses it into send
/// windows and emits on tick.
pub struct MonitoringAggregator {
    sender: Arc<dyn MonitoringSender>,
    send_period: Duration,
    inner: Mutex<Inner>,
}

impl MonitoringAggregator {
    pub fn new(sender: Arc<dyn MonitoringSender>, send_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            sender,
            send_period,
            inner: Mutex::new(Inner {
                message: MonitoringMessage::default(),
                is_connected: false,
            }),
        })
    }

    /// SM ingress: one node sample with its instance samples attached.
    pub fn on_monitoring_received(&self, data: NodeMonitoringData) {
        let mut inner = self.inner.lock().unwrap();

        let node = node_window(&mut inner.message, &data.node_id);
        push_ring(&mut node.samples, data.sample, MONITORING_SAMPLE_WINDOW);

        for instance in data.instances {
            let window =
                instance_window(&mut inner.message, &instance.ident, &instance.node_id);
            push_ring(&mut window.samples, instance.sample, MONITORING_SAMPLE_WINDOW);
        }
    }

    /// Node transition ingress: consecutive identical states collapse; a
    /// full window drops its oldest entry.
    pub fn on_node_info_changed(&self, info: &NodeInfo) {
        let mut inner = self.inner.lock().unwrap();
        let node = node_window(&mut inner.message, &info.node_id);

        let record = NodeStateRecord {
            timestamp_ms: now_ms(),
            state: info.state,
            is_connected: info.is_connected,
        };

        if let Some(last) = node.states.last() {
            if last.state == record.state && last.is_connected == record.is_connected {
                return;
            }
        }

        push_ring(&mut node.states, record, MONITORING_STATE_WINDOW);
    }

    /// Instance transition ingress, same collapse rule as nodes.
    pub fn on_instances_changed(&self, statuses: &[InstanceStatus]) {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();

        for status in statuses {
            let window = instance_window(&mut inner.message, &status.ident, &status.node_id);

            if let Some(last) = window.states.last() {
                if last.state == status.state {
                    continue;
                }
            }

            push_ring(
                &mut window.states,
                InstanceStateRecord { timestamp_ms: now, state: status.state },
                MONITORING_STATE_WINDOW,
            );
        }
    }

    /// Transmission gate: open.
    pub fn on_connect(&self) {
        debug!("monitoring publisher connected");
        self.inner.lock().unwrap().is_connected = true;
    }

    /// Transmission gate: closed.
    pub fn on_disconnect(&self) {
        debug!("monitoring publisher disconnected");
        self.inner.lock().unwrap().is_connected = false;
    }

    /// Arithmetic mean over a node's sample window, backing the SM
    /// controller's average-monitoring query.
    pub fn average_monitoring(&self, node_id: &str) -> Option<MonitoringSample> {
        let inner = self.inner.lock().unwrap();
        let node = inner.message.nodes.iter().find(|n| n.node_id == node_id)?;
        average(&node.samples)
    }

    /// Current accumulated aggregate (snapshot).
    pub fn snapshot(&self) -> MonitoringMessage {
        self.inner.lock().unwrap().message.clone()
    }

    /// Periodic flush driver.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.send_period);

        loop {
            tokio::select! {
                _ = tick.tick() => self.flush().await,
                _ = shutdown.changed() => {
                    debug!("monitoring aggregator stopped");
                    return;
                }
            }
        }
    }

    /// Send the aggregate if connected and non-empty; windows reset on a
    /// successful send. Also called once on graceful shutdown.
    pub async fn flush(&self) {
        let message = {
            let inner = self.inner.lock().unwrap();
            if !inner.is_connected || inner.message.is_empty() {
                return;
            }
            inner.message.clone()
        };

        match self.sender.send_monitoring(&message).await {
            Ok(()) => {
                let mut inner = self.inner.lock().unwrap();
                inner.message = MonitoringMessage::default();
                debug!(
                    nodes = message.nodes.len(),
                    instances = message.instances.len(),
                    "monitoring sent"
                );
            }
            Err(e) => warn!(error = %e, "failed to send monitoring"),
        }
    }
}

fn node_window<'a>(
    message: &'a mut MonitoringMessage,
    node_id: &str,
) -> &'a mut NodeMonitoringWindow {
    if let Some(index) = message.nodes.iter().position(|n| n.node_id == node_id) {
        return &mut message.nodes[index];
    }

    message.nodes.push(NodeMonitoringWindow {
        node_id: node_id.to_string(),
        ..NodeMonitoringWindow::default()
    });
    message.nodes.last_mut().unwrap()
}

fn instance_window<'a>(
    message: &'a mut MonitoringMessage,
    ident: &InstanceIdent,
    node_id: &str,
) -> &'a mut InstanceMonitoringWindow {
    if let Some(index) = message.instances.iter().position(|i| i.ident == *ident) {
        return &mut message.instances[index];
    }

    message.instances.push(InstanceMonitoringWindow {
        ident: ident.clone(),
        node_id: node_id.to_string(),
        samples: Vec::new(),
        states: Vec::new(),
    });
    message.instances.last_mut().unwrap()
}

fn push_ring<T>(ring: &mut Vec<T>, value: T, capacity: usize) {
    if ring.len() >= capacity {
        ring.remove(0);
    }
    ring.push(value);
}

fn average(samples: &[MonitoringSample]) -> Option<MonitoringSample> {
    if samples.is_empty() {
        return None;
    }

    let n = samples.len() as u64;
    let mut avg = MonitoringSample {
        timestamp_ms: samples.last().unwrap().timestamp_ms,
        cpu: samples.iter().map(|s| s.cpu).sum::<f64>() / n as f64,
        ram: samples.iter().map(|s| s.ram).sum::<u64>() / n,
        partitions: Vec::new(),
        download: samples.iter().map(|s| s.download).sum::<u64>() / n,
        upload: samples.iter().map(|s| s.upload).sum::<u64>() / n,
    };

    // Partitions averaged by name over the samples that report them.
    let mut names: Vec<&str> = Vec::new();
    for sample in samples {
        for partition in &sample.partitions {
            if !names.contains(&partition.name.as_str()) {
                names.push(&partition.name);
            }
        }
    }

    for name in names {
        let (sum, count) = samples
            .iter()
            .flat_map(|s| s.partitions.iter())
            .filter(|p| p.name == name)
            .fold((0u64, 0u64), |(sum, count), p| (sum + p.used_size, count + 1));

        avg.partitions.push(corral_core::monitoring::PartitionUsage {
            name: name.to_string(),
            used_size: sum / count.max(1),
        });
    }

    Some(avg)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::monitoring::{InstanceMonitoringData, PartitionUsage};
    use corral_core::{InstanceState, ItemType, NodeState, OsInfo, StatusReason};

    struct RecordingSender {
        sent: Mutex<Vec<MonitoringMessage>>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()) })
        }

        fn sent(&self) -> Vec<MonitoringMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MonitoringSender for RecordingSender {
        async fn send_monitoring(&self, monitoring: &MonitoringMessage) -> Result<(), ErrorInfo> {
            self.sent.lock().unwrap().push(monitoring.clone());
            Ok(())
        }
    }

    fn sample(ts: u64, cpu: f64, ram: u64) -> MonitoringSample {
        MonitoringSample {
            timestamp_ms: ts,
            cpu,
            ram,
            partitions: Vec::new(),
            download: 0,
            upload: 0,
        }
    }

    fn ident(item: &str, index: u32) -> InstanceIdent {
        InstanceIdent {
            item_id: item.to_string(),
            subject_id: "subj1".to_string(),
            instance: index,
            item_type: ItemType::Service,
        }
    }

    fn node_data(node: &str, ts: u64, instances: &[(&str, u32)]) -> NodeMonitoringData {
        NodeMonitoringData {
            node_id: node.to_string(),
            sample: sample(ts, 10.0, 100),
            instances: instances
                .iter()
                .map(|(item, index)| InstanceMonitoringData {
                    ident: ident(item, *index),
                    node_id: node.to_string(),
                    sample: sample(ts, 1.0, 10),
                })
                .collect(),
        }
    }

    fn status(item: &str, index: u32, state: InstanceState) -> InstanceStatus {
        InstanceStatus {
            ident: ident(item, index),
            version: "1.0.0".to_string(),
            node_id: "node1".to_string(),
            state,
            reason: StatusReason::Run,
            state_checksum: None,
            error: None,
        }
    }

    fn node_info(id: &str, state: NodeState, connected: bool) -> NodeInfo {
        NodeInfo {
            node_id: id.to_string(),
            node_type: "gateway".to_string(),
            name: id.to_string(),
            cpus: Vec::new(),
            partitions: Vec::new(),
            os_info: OsInfo::default(),
            total_ram: 0,
            attrs: Vec::new(),
            provisioned: true,
            state,
            is_connected: connected,
            error: None,
        }
    }

    fn aggregator() -> (Arc<MonitoringAggregator>, Arc<RecordingSender>) {
        let sender = RecordingSender::new();
        (MonitoringAggregator::new(sender.clone(), Duration::from_secs(60)), sender)
    }

    #[tokio::test]
    async fn node_samples_accumulate_and_flush_resets() {
        let (aggregator, sender) = aggregator();
        aggregator.on_connect();

        aggregator.on_monitoring_received(node_data("node1", 1000, &[]));
        aggregator.on_monitoring_received(node_data("node1", 2000, &[]));

        aggregator.flush().await;

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].nodes.len(), 1);
        assert_eq!(sent[0].nodes[0].samples.len(), 2);

        // Windows reset after a successful send.
        assert!(aggregator.snapshot().is_empty());
    }

    #[tokio::test]
    async fn instance_samples_from_node_reports_are_all_present() {
        let (aggregator, _) = aggregator();

        aggregator.on_monitoring_received(node_data("node1", 1000, &[("svc1", 0), ("svc2", 0)]));
        aggregator.on_monitoring_received(node_data("node1", 2000, &[("svc1", 0), ("svc2", 0)]));

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.instances.len(), 2);
        assert!(snapshot.instances.iter().all(|i| i.samples.len() == 2));
    }

    #[tokio::test]
    async fn sample_window_drops_oldest() {
        let (aggregator, _) = aggregator();

        for ts in 0..(MONITORING_SAMPLE_WINDOW as u64 + 5) {
            aggregator.on_monitoring_received(node_data("node1", ts, &[]));
        }

        let snapshot = aggregator.snapshot();
        let samples = &snapshot.nodes[0].samples;
        assert_eq!(samples.len(), MONITORING_SAMPLE_WINDOW);
        assert_eq!(samples[0].timestamp_ms, 5);
    }

    #[tokio::test]
    async fn consecutive_identical_instance_states_collapse() {
        let (aggregator, _) = aggregator();

        // Four consecutive Active reports, then a transition sequence.
        for _ in 0..4 {
            aggregator.on_instances_changed(&[status("svc1", 0, InstanceState::Active)]);
        }
        for state in [
            InstanceState::Activating,
            InstanceState::Active,
            InstanceState::Inactive,
            InstanceState::Failed,
        ] {
            aggregator.on_instances_changed(&[status("svc1", 0, state)]);
        }

        let snapshot = aggregator.snapshot();
        let states: Vec<InstanceState> =
            snapshot.instances[0].states.iter().map(|r| r.state).collect();

        // One entry per transition; the window of four dropped the initial
        // collapsed Active.
        assert_eq!(
            states,
            vec![
                InstanceState::Activating,
                InstanceState::Active,
                InstanceState::Inactive,
                InstanceState::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn node_state_transitions_collapse() {
        let (aggregator, _) = aggregator();

        aggregator.on_node_info_changed(&node_info("node1", NodeState::Provisioned, true));
        aggregator.on_node_info_changed(&node_info("node1", NodeState::Provisioned, true));
        aggregator.on_node_info_changed(&node_info("node1", NodeState::Error, false));

        let snapshot = aggregator.snapshot();
        let states = &snapshot.nodes[0].states;
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].state, NodeState::Provisioned);
        assert_eq!(states[1].state, NodeState::Error);
    }

    #[tokio::test]
    async fn average_is_arithmetic_mean() {
        let (aggregator, _) = aggregator();

        for (ts, cpu, ram) in [(1000, 10.0, 100), (2000, 20.0, 200), (3000, 30.0, 300)] {
            let mut data = node_data("node1", ts, &[]);
            data.sample = MonitoringSample {
                timestamp_ms: ts,
                cpu,
                ram,
                partitions: vec![PartitionUsage { name: "storage".to_string(), used_size: ram }],
                download: 0,
                upload: 0,
            };
            aggregator.on_monitoring_received(data);
        }

        let avg = aggregator.average_monitoring("node1").unwrap();
        assert_eq!(avg.cpu, 20.0);
        assert_eq!(avg.ram, 200);
        assert_eq!(avg.partitions[0].used_size, 200);

        assert!(aggregator.average_monitoring("node9").is_none());
    }

    #[tokio::test]
    async fn disconnected_flush_is_a_no_op() {
        let (aggregator, sender) = aggregator();

        aggregator.on_monitoring_received(node_data("node1", 1000, &[]));
        aggregator.flush().await;
        assert!(sender.sent().is_empty());
        assert!(!aggregator.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_periodically() {
        let sender = RecordingSender::new();
        let aggregator = MonitoringAggregator::new(sender.clone(), Duration::from_secs(30));
        aggregator.on_connect();
        aggregator.on_monitoring_received(node_data("node1", 1000, &[]));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(aggregator.clone().run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(31)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(sender.sent().len(), 1);
    }
}
