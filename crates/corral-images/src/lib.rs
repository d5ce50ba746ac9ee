//! corral-images — the content-addressed image store.
//!
//! Owns the on-disk blob tree, drives parallel downloads through the
//! [`Downloader`] seam, validates each artifact (digest check, CMS
//! envelope decrypt, signature verify), deduplicates blobs by digest and
//! answers reverse queries (`digest → local URL`).
//!
//! Per-item installs are serialised so two desired-status revisions
//! cannot race on the same item; across items a small worker pool
//! parallelises the pipeline. The previously installed version of an item
//! is demoted to `Cached` and promised to the space allocator for LRU
//! eviction.

pub mod digest;
pub mod error;
pub mod manager;
pub mod remover;

pub use error::{ImageError, ImageResult};
pub use manager::{
    Downloader, ImageCrypto, ImageManager, ImageUnpacker, ItemStatusListener,
};
pub use remover::StoredItemRemover;
