//! corrald — assembly of the communication manager daemon.
//!
//! The binary itself is thin: parse the CLI, load the config file,
//! initialise tracing, build the [`Core`] and wait for SIGTERM. All the
//! behaviour lives in the subsystem crates; this crate contributes the
//! wiring (listener adapters between subsystems), local collaborator
//! implementations (HTTP/file downloader, IAM node file source) and the
//! attachment points for the external transports (cloud link, SM link).

pub mod collab;
pub mod core;
pub mod glue;

pub use core::Core;
