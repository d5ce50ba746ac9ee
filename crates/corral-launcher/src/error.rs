//! Launcher error types.

use thiserror::Error;

use corral_core::{ErrorInfo, ErrorKind};
use corral_state::StateError;

pub type LauncherResult<T> = Result<T, LauncherError>;

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("runner error: {0}")]
    Runner(ErrorInfo),

    #[error("storage error: {0}")]
    Storage(#[from] StateError),
}

impl LauncherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LauncherError::NotFound(_) => ErrorKind::NotFound,
            LauncherError::Runner(e) => e.kind,
            LauncherError::Storage(e) => e.kind(),
        }
    }
}
