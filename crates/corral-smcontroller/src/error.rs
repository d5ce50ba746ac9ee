//! SM controller error types.

use thiserror::Error;

use corral_core::{ErrorInfo, ErrorKind};

pub type SmResult<T> = Result<T, SmError>;

#[derive(Debug, Error)]
pub enum SmError {
    #[error("node not connected: {0}")]
    NotConnected(String),

    #[error("rpc failed after {attempts} attempts: {error}")]
    Exhausted { attempts: usize, error: ErrorInfo },

    #[error("rpc rejected: {0}")]
    Rejected(ErrorInfo),
}

impl SmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SmError::NotConnected(_) => ErrorKind::NotFound,
            SmError::Exhausted { error, .. } | SmError::Rejected(error) => error.kind,
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.kind(), self.to_string())
    }
}
