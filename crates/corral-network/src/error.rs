//! Network manager error types.

use thiserror::Error;

use corral_core::{ErrorInfo, ErrorKind};
use corral_state::StateError;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("lease not found: {0}")]
    NotFound(String),

    #[error("address pool exhausted for network {0}")]
    PoolExhausted(String),

    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("dns controller error: {0}")]
    Dns(ErrorInfo),

    #[error("storage error: {0}")]
    Storage(#[from] StateError),
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::NotFound(_) => ErrorKind::NotFound,
            NetworkError::PoolExhausted(_) => ErrorKind::NoMemory,
            NetworkError::InvalidSubnet(_) => ErrorKind::InvalidArgument,
            NetworkError::Dns(e) => e.kind,
            NetworkError::Storage(e) => e.kind(),
        }
    }
}
