//! Image manager error types.

use thiserror::Error;

use corral_allocator::AllocatorError;
use corral_core::{ErrorInfo, ErrorKind};
use corral_state::StateError;

pub type ImageResult<T> = Result<T, ImageError>;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("item not found: {0}")]
    NotFound(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("download failed: {0}")]
    Download(ErrorInfo),

    #[error("decrypt failed: {0}")]
    Decrypt(ErrorInfo),

    #[error("signature verification failed: {0}")]
    Verify(ErrorInfo),

    #[error("unpack failed: {0}")]
    Unpack(ErrorInfo),

    #[error("space allocation failed: {0}")]
    Space(#[from] AllocatorError),

    #[error("storage error: {0}")]
    Storage(#[from] StateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImageError::NotFound(_) => ErrorKind::NotFound,
            ImageError::InvalidDigest(_) | ImageError::DigestMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            ImageError::Download(e)
            | ImageError::Decrypt(e)
            | ImageError::Verify(e)
            | ImageError::Unpack(e) => e.kind,
            ImageError::Space(e) => e.kind(),
            ImageError::Storage(e) => e.kind(),
            ImageError::Io(_) => ErrorKind::Runtime,
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.kind(), self.to_string())
    }
}
