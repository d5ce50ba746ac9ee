//! Alert aggregator implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use corral_core::limits::{ALERT_ITEMS_COUNT, ALERTS_CACHE_SIZE};
use corral_core::{Alert, AlertTag, ErrorInfo};

/// Cloud-side alert transmission, implemented by the communication layer.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send_alerts(&self, alerts: &[Alert]) -> Result<(), ErrorInfo>;
}

/// Local subscriber, notified synchronously for its tags. Must not
/// re-enter the aggregator.
pub trait AlertsListener: Send + Sync {
    fn on_alert_received(&self, alert: &Alert);
}

struct Inner {
    cache: Vec<Alert>,
    is_connected: bool,
    skipped: usize,
    duplicated: usize,
}

/// De-duplicates, batches and forwards alerts.
pub struct AlertAggregator {
    sender: Arc<dyn AlertSender>,
    send_period: Duration,
    inner: Mutex<Inner>,
    listeners: Mutex<HashMap<AlertTag, Vec<Arc<dyn AlertsListener>>>>,
}

impl AlertAggregator {
    pub fn new(sender: Arc<dyn AlertSender>, send_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            sender,
            send_period,
            inner: Mutex::new(Inner {
                cache: Vec::new(),
                is_connected: false,
                skipped: 0,
                duplicated: 0,
            }),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Ingest one alert, from SM ingress or a local component.
    ///
    /// Listeners subscribed to the alert's tag are notified first; then
    /// the alert is cached unless it duplicates an existing entry
    /// (equality ignoring the timestamp). A full cache drops the incoming
    /// alert and counts it as skipped.
    pub fn report_alert(&self, alert: Alert) {
        self.notify(&alert);

        let mut inner = self.inner.lock().unwrap();

        if inner.cache.iter().any(|a| a.eq_ignoring_timestamp(&alert)) {
            inner.duplicated += 1;
            return;
        }

        if inner.cache.len() >= ALERTS_CACHE_SIZE {
            inner.skipped += 1;
            return;
        }

        inner.cache.push(alert);
    }

    /// Subscribe a listener to a set of tags.
    pub fn subscribe(&self, tags: &[AlertTag], listener: Arc<dyn AlertsListener>) {
        let mut listeners = self.listeners.lock().unwrap();
        for tag in tags {
            let entry = listeners.entry(*tag).or_default();
            if !entry.iter().any(|l| Arc::ptr_eq(l, &listener)) {
                entry.push(listener.clone());
            }
        }
    }

    /// Drop a listener from every tag.
    pub fn unsubscribe(&self, listener: &Arc<dyn AlertsListener>) {
        let mut listeners = self.listeners.lock().unwrap();
        for entry in listeners.values_mut() {
            entry.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    /// Transmission gate: open.
    pub fn on_connect(&self) {
        debug!("alert publisher connected");
        self.inner.lock().unwrap().is_connected = true;
    }

    /// Transmission gate: closed. Alerts keep accumulating.
    pub fn on_disconnect(&self) {
        debug!("alert publisher disconnected");
        self.inner.lock().unwrap().is_connected = false;
    }

    /// Alerts dropped because the cache was full since the last flush.
    pub fn skipped_count(&self) -> usize {
        self.inner.lock().unwrap().skipped
    }

    /// Duplicates absorbed since the last flush.
    pub fn duplicated_count(&self) -> usize {
        self.inner.lock().unwrap().duplicated
    }

    /// Periodic flush driver.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.send_period);

        loop {
            tokio::select! {
                _ = tick.tick() => self.flush().await,
                _ = shutdown.changed() => {
                    debug!("alert aggregator stopped");
                    return;
                }
            }
        }
    }

    /// Drain the cache in packages of at most
    /// [`ALERT_ITEMS_COUNT`] while connected. Entries are
    /// removed only after the sender accepted them. Also called once on
    /// graceful shutdown.
    pub async fn flush(&self) {
        loop {
            let package = {
                let mut inner = self.inner.lock().unwrap();

                if inner.skipped > 0 {
                    warn!(count = inner.skipped, "alerts skipped, cache full");
                    inner.skipped = 0;
                }
                if inner.duplicated > 0 {
                    warn!(count = inner.duplicated, "duplicated alerts absorbed");
                    inner.duplicated = 0;
                }

                if !inner.is_connected || inner.cache.is_empty() {
                    return;
                }

                let count = inner.cache.len().min(ALERT_ITEMS_COUNT);
                inner.cache[..count].to_vec()
            };

            match self.sender.send_alerts(&package).await {
                Ok(()) => {
                    let mut inner = self.inner.lock().unwrap();
                    let accepted = package.len().min(inner.cache.len());
                    inner.cache.drain(..accepted);
                    debug!(count = package.len(), "alert package sent");
                }
                Err(e) => {
                    warn!(error = %e, "failed to send alerts");
                    return;
                }
            }
        }
    }

    fn notify(&self, alert: &Alert) {
        let listeners = {
            let registry = self.listeners.lock().unwrap();
            registry.get(&alert.tag()).cloned().unwrap_or_default()
        };

        for listener in listeners {
            listener.on_alert_received(alert);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::alerts::{CoreAlert, SystemAlert};
    use corral_core::{CoreComponent, ErrorKind};

    /// Sender recording every package; can be told to fail.
    struct RecordingSender {
        packages: Mutex<Vec<Vec<Alert>>>,
        fail: Mutex<bool>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self { packages: Mutex::new(Vec::new()), fail: Mutex::new(false) })
        }

        fn packages(&self) -> Vec<Vec<Alert>> {
            self.packages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlertSender for RecordingSender {
        async fn send_alerts(&self, alerts: &[Alert]) -> Result<(), ErrorInfo> {
            if *self.fail.lock().unwrap() {
                return Err(ErrorInfo::new(ErrorKind::Timeout, "link down"));
            }
            self.packages.lock().unwrap().push(alerts.to_vec());
            Ok(())
        }
    }

    fn system_alert(ts: u64, node: &str, msg: &str) -> Alert {
        Alert::System(SystemAlert {
            timestamp_ms: ts,
            node_id: node.to_string(),
            message: msg.to_string(),
        })
    }

    fn core_alert(ts: u64, node: &str, msg: &str) -> Alert {
        Alert::Core(CoreAlert {
            timestamp_ms: ts,
            node_id: node.to_string(),
            component: CoreComponent::Sm,
            message: msg.to_string(),
        })
    }

    #[tokio::test]
    async fn duplicates_collapse_to_unique_payloads() {
        let sender = RecordingSender::new();
        let aggregator = AlertAggregator::new(sender.clone(), Duration::from_secs(10));
        aggregator.on_connect();

        // Same system alert at four timestamps.
        for offset in 0..4 {
            aggregator.report_alert(system_alert(1000 + offset * 1000, "node1", "msg1"));
        }
        // Same core alert twice.
        for offset in 0..2 {
            aggregator.report_alert(core_alert(1000 + offset * 1000, "node1", "msg2"));
        }
        // Distinct core alert on another node.
        aggregator.report_alert(core_alert(3000, "node2", "msg3"));

        assert_eq!(aggregator.duplicated_count(), 4);

        aggregator.flush().await;

        let packages = sender.packages();
        assert_eq!(packages.len(), 1);
        // Exactly one per unique (tag, node, message).
        assert_eq!(packages[0].len(), 3);
    }

    #[tokio::test]
    async fn cache_never_holds_equal_entries() {
        let sender = RecordingSender::new();
        let aggregator = AlertAggregator::new(sender, Duration::from_secs(10));

        for i in 0..10u64 {
            aggregator.report_alert(system_alert(i, "node1", "same"));
            aggregator.report_alert(system_alert(i, "node1", "other"));
        }

        let inner = aggregator.inner.lock().unwrap();
        for (i, a) in inner.cache.iter().enumerate() {
            for b in &inner.cache[i + 1..] {
                assert!(!a.eq_ignoring_timestamp(b));
            }
        }
        assert_eq!(inner.cache.len(), 2);
    }

    #[tokio::test]
    async fn overflow_skips_incoming_and_drains_in_packages() {
        let sender = RecordingSender::new();
        let aggregator = AlertAggregator::new(sender.clone(), Duration::from_secs(10));

        // Fill the cache with distinct alerts, then one more.
        for i in 0..ALERTS_CACHE_SIZE as u64 {
            aggregator.report_alert(core_alert(i, "node1", &format!("msg{i}")));
        }
        aggregator.report_alert(core_alert(99, "node1", "one too many"));

        assert_eq!(aggregator.skipped_count(), 1);
        assert_eq!(aggregator.duplicated_count(), 0);

        aggregator.on_connect();
        aggregator.flush().await;

        let packages = sender.packages();
        // 32 alerts in chunks of at most ALERT_ITEMS_COUNT.
        let sizes: Vec<usize> = packages.iter().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![10, 10, 10, 2]);
        assert!(packages.iter().all(|p| p.len() <= ALERT_ITEMS_COUNT));

        // The first 32 alerts survived; the 33rd was dropped.
        let all: Vec<Alert> = packages.into_iter().flatten().collect();
        assert_eq!(all[0], core_alert(0, "node1", "msg0"));
        assert!(!all.iter().any(|a| a.eq_ignoring_timestamp(&core_alert(99, "node1", "one too many"))));
    }

    #[tokio::test]
    async fn nothing_is_sent_while_disconnected() {
        let sender = RecordingSender::new();
        let aggregator = AlertAggregator::new(sender.clone(), Duration::from_secs(10));

        aggregator.report_alert(system_alert(1, "node1", "msg"));
        aggregator.flush().await;
        assert!(sender.packages().is_empty());

        aggregator.on_connect();
        aggregator.flush().await;
        assert_eq!(sender.packages().len(), 1);
    }

    #[tokio::test]
    async fn send_failure_keeps_cache() {
        let sender = RecordingSender::new();
        let aggregator = AlertAggregator::new(sender.clone(), Duration::from_secs(10));
        aggregator.on_connect();

        aggregator.report_alert(system_alert(1, "node1", "msg"));

        *sender.fail.lock().unwrap() = true;
        aggregator.flush().await;
        assert!(sender.packages().is_empty());

        *sender.fail.lock().unwrap() = false;
        aggregator.flush().await;
        assert_eq!(sender.packages().len(), 1);
    }

    #[tokio::test]
    async fn listeners_fan_out_by_tag() {
        struct Recording(Mutex<Vec<Alert>>);
        impl AlertsListener for Recording {
            fn on_alert_received(&self, alert: &Alert) {
                self.0.lock().unwrap().push(alert.clone());
            }
        }

        let aggregator = AlertAggregator::new(RecordingSender::new(), Duration::from_secs(10));

        let system_only = Arc::new(Recording(Mutex::new(Vec::new())));
        aggregator.subscribe(&[AlertTag::System], system_only.clone());

        let both = Arc::new(Recording(Mutex::new(Vec::new())));
        aggregator.subscribe(&[AlertTag::System, AlertTag::Core], both.clone());

        aggregator.report_alert(system_alert(1, "node1", "sys"));
        aggregator.report_alert(core_alert(2, "node1", "core"));

        assert_eq!(system_only.0.lock().unwrap().len(), 1);
        assert_eq!(both.0.lock().unwrap().len(), 2);

        // Duplicates still reach listeners.
        aggregator.report_alert(system_alert(9, "node1", "sys"));
        assert_eq!(system_only.0.lock().unwrap().len(), 2);

        let listener: Arc<dyn AlertsListener> = system_only.clone();
        aggregator.unsubscribe(&listener);
        aggregator.report_alert(system_alert(10, "node1", "after"));
        assert_eq!(system_only.0.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_drives_periodic_flush() {
        let sender = RecordingSender::new();
        let aggregator = AlertAggregator::new(sender.clone(), Duration::from_secs(5));
        aggregator.on_connect();
        aggregator.report_alert(system_alert(1, "node1", "msg"));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(aggregator.clone().run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(6)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(sender.packages().len(), 1);
    }
}
