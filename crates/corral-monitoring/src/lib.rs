//! corral-monitoring — resource usage aggregation.
//!
//! Per-node and per-instance samples accumulate into fixed-size ring
//! windows; node and instance state transitions are recorded alongside,
//! with consecutive identical states collapsed. A timer flushes the
//! aggregate to the cloud sender while connected; windows reset after a
//! successful send.

pub mod aggregator;

pub use aggregator::{
    InstanceMonitoringWindow, MonitoringAggregator, MonitoringMessage, MonitoringSender,
    NodeMonitoringWindow,
};
