//! Node subsystem error types.

use thiserror::Error;

use corral_core::ErrorKind;
use corral_state::StateError;

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("wrong state: {0}")]
    WrongState(String),

    #[error("storage error: {0}")]
    Storage(#[from] StateError),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::NotFound(_) => ErrorKind::NotFound,
            NodeError::WrongState(_) => ErrorKind::WrongState,
            NodeError::Storage(e) => e.kind(),
        }
    }
}
