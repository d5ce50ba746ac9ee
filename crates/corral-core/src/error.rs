//! Shared error vocabulary.
//!
//! Each subsystem crate defines its own `thiserror` enum; at the public
//! boundary every error maps onto one of the kinds below so that status
//! payloads (`UnitStatus`, `NodeConfigStatus`, `InstanceStatus`, …) carry a
//! uniform `{kind, message}` pair the cloud can act on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of an error at a subsystem boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExist,
    InvalidArgument,
    NoMemory,
    NoSpace,
    Timeout,
    WrongState,
    Failed,
    NotSupported,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExist => "already exist",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NoMemory => "no memory",
            ErrorKind::NoSpace => "no space",
            ErrorKind::Timeout => "timeout",
            ErrorKind::WrongState => "wrong state",
            ErrorKind::Failed => "failed",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::Runtime => "runtime",
        };
        f.write_str(s)
    }
}

/// Serializable error payload attached to status reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
