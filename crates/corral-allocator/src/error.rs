//! Allocator error types.

use thiserror::Error;

use corral_core::ErrorKind;

pub type AllocatorResult<T> = Result<T, AllocatorError>;

#[derive(Debug, Error)]
pub enum AllocatorError {
    /// Allocator quota exhausted and own outdated items could not cover it.
    #[error("allocator limit exceeded: {0}")]
    NoMemory(String),

    /// Partition out of space even after eviction.
    #[error("not enough space: {0}")]
    NoSpace(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("item removal failed: {0}")]
    Remove(String),
}

impl AllocatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocatorError::NoMemory(_) => ErrorKind::NoMemory,
            AllocatorError::NoSpace(_) => ErrorKind::NoSpace,
            AllocatorError::NotFound(_) => ErrorKind::NotFound,
            AllocatorError::Io(_) | AllocatorError::Remove(_) => ErrorKind::Runtime,
        }
    }
}
