//! corral-updates — the unit's top-level reconcile loop.
//!
//! The update manager ingests `DesiredStatus` from the cloud and drives
//! the unit config, image manager and launcher through a persisted state
//! machine:
//!
//! ```text
//! None → Downloading → Pending → Installing → Launching → Finalizing → None
//! ```
//!
//! Every entry point (desired status, cloud connect, component status
//! change) funnels into one mailbox consumed by a single task — the
//! subsystem is deliberately single-threaded on its state. `UnitStatus`
//! is emitted full on cloud connect and as deltas on component changes
//! while connected; nothing is sent while disconnected.

pub mod manager;

pub use manager::{
    CertHandler, IdentProvider, InstanceLauncher, ItemInstaller, NodeRegistry, StatusSender,
    UnitConfigHandler, UpdateManager,
};
