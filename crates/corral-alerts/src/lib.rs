//! corral-alerts — alert aggregation and forwarding.
//!
//! Alerts from SM ingress and local components funnel through one
//! aggregator: local subscribers are notified by tag, duplicates
//! (equality ignoring the timestamp) are counted and dropped, and the
//! bounded cache is flushed to the cloud sender in fixed-size packages on
//! a timer — only while connected.

pub mod aggregator;

pub use aggregator::{AlertAggregator, AlertSender, AlertsListener};
