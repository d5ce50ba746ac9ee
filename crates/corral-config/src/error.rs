//! Unit config error types.

use thiserror::Error;

use corral_core::{ErrorInfo, ErrorKind};

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Candidate version equals the installed one.
    #[error("version {0} already installed")]
    AlreadyInstalled(String),

    /// Candidate version is lower than the installed one.
    #[error("version {candidate} is behind installed {installed}")]
    WrongVersion { candidate: String, installed: String },

    #[error("no node config for {0}")]
    NotFound(String),

    #[error("invalid version: {0}")]
    InvalidVersion(#[from] corral_core::version::VersionError),

    #[error("node {node_id} rejected config: {error}")]
    NodeRejected { node_id: String, error: ErrorInfo },

    #[error("controller error: {0}")]
    Controller(ErrorInfo),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::AlreadyInstalled(_) => ErrorKind::AlreadyExist,
            ConfigError::WrongVersion { .. } => ErrorKind::WrongState,
            ConfigError::NotFound(_) => ErrorKind::NotFound,
            ConfigError::InvalidVersion(_) => ErrorKind::InvalidArgument,
            ConfigError::NodeRejected { error, .. } | ConfigError::Controller(error) => error.kind,
            ConfigError::Io(_) | ConfigError::Serde(_) => ErrorKind::Runtime,
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.kind(), self.to_string())
    }
}
