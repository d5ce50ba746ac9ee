//! Eviction hook handed to the space allocator.
//!
//! The allocator calls back with a composite `"{item_id}:{version}"` id
//! when it needs the bytes of a cached item version. Blobs are
//! reference-counted across item versions: a blob disappears only when
//! the last row referencing its digest goes.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use corral_allocator::{AllocatorError, AllocatorResult, ItemRemover};
use corral_state::{StateStore, StoredItem};

/// Removes a stored item version from disk and the index.
pub struct StoredItemRemover {
    store: StateStore,
    storage_root: PathBuf,
}

impl StoredItemRemover {
    pub fn new(store: StateStore, storage_root: &Path) -> Self {
        Self { store, storage_root: storage_root.to_path_buf() }
    }

    /// Delete the version row and any blobs only it references.
    /// Returns the bytes freed.
    pub fn remove_version(&self, item_id: &str, version: &str) -> AllocatorResult<u64> {
        let item = self
            .store
            .get_item(item_id, version)
            .map_err(|e| AllocatorError::Remove(e.to_string()))?
            .ok_or_else(|| {
                AllocatorError::NotFound(format!("stored item {item_id}:{version}"))
            })?;

        self.store
            .delete_item(item_id, version)
            .map_err(|e| AllocatorError::Remove(e.to_string()))?;

        let freed = self.sweep_orphan_blobs(&item)?;

        debug!(%item_id, %version, freed, "stored item removed");
        Ok(freed)
    }

    /// Remove blobs of `item` that no remaining row references.
    fn sweep_orphan_blobs(&self, item: &StoredItem) -> AllocatorResult<u64> {
        let remaining = self
            .store
            .list_items()
            .map_err(|e| AllocatorError::Remove(e.to_string()))?;

        let mut freed = 0;
        for image in &item.images {
            let still_referenced = remaining
                .iter()
                .any(|row| row.images.iter().any(|i| i.digest == image.digest));
            if still_referenced {
                continue;
            }

            let path = blob_path(&self.storage_root, &image.digest);
            if path.exists() {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!(digest = %image.digest, error = %e, "failed to remove blob");
                    continue;
                }
            }
            freed += image.size;
        }

        Ok(freed)
    }
}

impl ItemRemover for StoredItemRemover {
    fn remove_item(&self, id: &str) -> AllocatorResult<u64> {
        let (item_id, version) = id
            .split_once(':')
            .ok_or_else(|| AllocatorError::NotFound(format!("malformed item id {id}")))?;
        self.remove_version(item_id, version)
    }
}

/// On-disk location of a blob: `<root>/blobs/<algo>/<hex>`.
pub fn blob_path(storage_root: &Path, digest: &str) -> PathBuf {
    match digest.split_once(':') {
        Some((algo, hex)) => storage_root.join("blobs").join(algo).join(hex),
        None => storage_root.join("blobs").join(digest),
    }
}
