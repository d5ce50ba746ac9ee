//! corral-state — embedded state store for the CM daemon.
//!
//! Backed by [redb](https://docs.rs/redb). Holds everything that must
//! survive a daemon restart: node rows, instance placements, the last
//! desired status with its update stage, image-store index entries and
//! network leases. All values are JSON-serialized into redb's `&[u8]`
//! value columns; composite string keys enable prefix scans.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and is handed to every subsystem that persists.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
