//! corral-core — shared domain model for the corral edge management core.
//!
//! Every subsystem crate speaks in these value types: node facts, instance
//! identities, update items, the cloud-facing `DesiredStatus`/`UnitStatus`
//! pair, alert variants, and monitoring samples. Cross-subsystem references
//! are by stable identifier (`NodeId`, `InstanceIdent`, item id + digest),
//! never by pointer.
//!
//! The crate also carries the shared [`ErrorKind`] vocabulary and the
//! daemon configuration file model.

pub mod alerts;
pub mod cloud;
pub mod config;
pub mod error;
pub mod limits;
pub mod monitoring;
pub mod network;
pub mod types;
pub mod version;

pub use alerts::{Alert, AlertTag};
pub use cloud::*;
pub use config::CmConfig;
pub use error::{ErrorInfo, ErrorKind};
pub use network::{FirewallRule, NetworkParameters};
pub use types::*;
