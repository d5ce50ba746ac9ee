//! Image manager — install pipeline and store queries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use corral_allocator::SpaceAllocator;
use corral_core::{
    CertificateChainInfo, DecryptInfo, ErrorInfo, ImageInfo, ImageState, ImageStatus, SignInfo,
    UpdateItemInfo, UpdateItemStatus,
};
use corral_state::{StateStore, StoredImage, StoredItem, item_key};

use crate::digest;
use crate::error::{ImageError, ImageResult};
use crate::remover::{StoredItemRemover, blob_path};

/// Fetches an image payload. Retries and backoff are this contract's
/// responsibility, not the caller's.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, urls: &[String], dest: &Path) -> Result<(), ErrorInfo>;
}

/// CMS envelope and signature operations, delegated to the crypto
/// collaborator.
#[async_trait]
pub trait ImageCrypto: Send + Sync {
    /// Unwrap the `EnvelopedData` payload at `src` into `dest`.
    async fn decrypt(&self, src: &Path, dest: &Path, info: &DecryptInfo) -> Result<(), ErrorInfo>;

    /// Verify the detached signature against the supplied chains.
    async fn verify(
        &self,
        path: &Path,
        info: &SignInfo,
        chains: &[CertificateChainInfo],
    ) -> Result<(), ErrorInfo>;
}

/// Unpacks an image archive; returns the unpacked size in bytes.
#[async_trait]
pub trait ImageUnpacker: Send + Sync {
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<u64, ErrorInfo>;
}

/// Receives item status updates as installs progress.
pub trait ItemStatusListener: Send + Sync {
    fn on_item_status_changed(&self, status: &UpdateItemStatus);
}

/// The content-addressed image store.
pub struct ImageManager {
    storage_root: PathBuf,
    download_dir: PathBuf,
    store: StateStore,
    allocator: SpaceAllocator,
    remover: Arc<StoredItemRemover>,
    downloader: Arc<dyn Downloader>,
    crypto: Arc<dyn ImageCrypto>,
    unpacker: Arc<dyn ImageUnpacker>,
    workers: usize,
    item_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    listeners: Mutex<Vec<Arc<dyn ItemStatusListener>>>,
}

impl ImageManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage_root: &Path,
        store: StateStore,
        allocator: SpaceAllocator,
        remover: Arc<StoredItemRemover>,
        downloader: Arc<dyn Downloader>,
        crypto: Arc<dyn ImageCrypto>,
        unpacker: Arc<dyn ImageUnpacker>,
        workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage_root: storage_root.to_path_buf(),
            download_dir: storage_root.join("downloads"),
            store,
            allocator,
            remover,
            downloader,
            crypto,
            unpacker,
            workers: workers.max(1),
            item_locks: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to item status changes.
    pub fn subscribe(&self, listener: Arc<dyn ItemStatusListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Install every item of a desired status. Items run through a worker
    /// pool; the per-item path is serialised. Failures are embedded in the
    /// returned statuses, never raised as a manager-wide error.
    pub async fn install_items(
        self: Arc<Self>,
        items: Vec<UpdateItemInfo>,
        chains: Vec<CertificateChainInfo>,
    ) -> Vec<UpdateItemStatus> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let chains = Arc::new(chains);
        let mut tasks = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let manager = self.clone();
            let semaphore = semaphore.clone();
            let chains = chains.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let status = manager.install_item(item, &chains).await;
                (index, status)
            });
        }

        let mut statuses: Vec<(usize, UpdateItemStatus)> = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(entry) => statuses.push(entry),
                Err(e) => warn!(error = %e, "install task panicked"),
            }
        }
        statuses.sort_by_key(|(index, _)| *index);

        let statuses: Vec<UpdateItemStatus> =
            statuses.into_iter().map(|(_, status)| status).collect();

        for status in &statuses {
            self.notify(status);
        }

        statuses
    }

    /// Remove every stored version of an item.
    pub fn remove_item(&self, item_id: &str) -> ImageResult<()> {
        let versions = self.store.list_item_versions(item_id)?;
        if versions.is_empty() {
            return Err(ImageError::NotFound(item_id.to_string()));
        }

        for row in versions {
            // Withdraw any eviction promise before removing by hand.
            self.allocator
                .restore_outdated_item(&item_key(&row.item_id, &row.version));

            match self.remover.remove_version(&row.item_id, &row.version) {
                Ok(freed) => self.allocator.free_space(freed),
                Err(e) => warn!(item_id = %row.item_id, version = %row.version, error = %e,
                    "failed to remove stored item"),
            }
        }

        info!(%item_id, "item removed");
        Ok(())
    }

    /// Statuses of every stored item version.
    pub fn item_statuses(&self) -> ImageResult<Vec<UpdateItemStatus>> {
        Ok(self
            .store
            .list_items()?
            .iter()
            .map(Self::status_from_row)
            .collect())
    }

    /// Local URL of a blob, if present.
    pub fn image_url(&self, image_digest: &str) -> Option<String> {
        let path = blob_path(&self.storage_root, image_digest);
        path.exists()
            .then(|| format!("file://{}", path.display()))
    }

    /// Periodic cleanup of cached versions that outlived `max_age`.
    pub async fn run(
        self: Arc<Self>,
        max_age: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(max_age.max(std::time::Duration::from_secs(1)));

        loop {
            tokio::select! {
                _ = tick.tick() => self.remove_outdated(max_age),
                _ = shutdown.changed() => {
                    debug!("image manager stopped");
                    return;
                }
            }
        }
    }

    /// Remove cached versions whose demotion is older than `max_age`.
    fn remove_outdated(&self, max_age: std::time::Duration) {
        let rows = match self.store.list_items() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to list items for cleanup");
                return;
            }
        };

        let now = now_ms();
        for row in rows {
            if row.state != ImageState::Cached {
                continue;
            }
            if now.saturating_sub(row.timestamp_ms) <= max_age.as_millis() as u64 {
                continue;
            }

            self.allocator.restore_outdated_item(&row.table_key());

            match self.remover.remove_version(&row.item_id, &row.version) {
                Ok(freed) => {
                    self.allocator.free_space(freed);
                    info!(item_id = %row.item_id, version = %row.version, freed,
                        "outdated cached version removed");
                }
                Err(e) => warn!(item_id = %row.item_id, version = %row.version, error = %e,
                    "failed to remove outdated version"),
            }
        }
    }

    // ── Install pipeline ───────────────────────────────────────────

    async fn install_item(
        &self,
        item: UpdateItemInfo,
        chains: &[CertificateChainInfo],
    ) -> UpdateItemStatus {
        let lock = self.item_lock(&item.item_id);
        let _guard = lock.lock().await;

        debug!(item_id = %item.item_id, version = %item.version, "install item");

        match self.try_reuse_stored(&item) {
            Ok(Some(status)) => return status,
            Ok(None) => {}
            Err(e) => return Self::error_status(&item, &e),
        }

        let mut images = Vec::new();
        let mut total_size = 0u64;
        let mut failure: Option<ImageError> = None;

        for image in &item.images {
            match self.install_image(image, chains).await {
                Ok(size) => {
                    total_size += size;
                    images.push(StoredImage {
                        image_id: image.image_id.clone(),
                        digest: image.digest.clone(),
                        size,
                        state: ImageState::Installed,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(
                        item_id = %item.item_id,
                        image_id = %image.image_id,
                        error = %e,
                        "image install failed"
                    );
                    images.push(StoredImage {
                        image_id: image.image_id.clone(),
                        digest: image.digest.clone(),
                        size: 0,
                        state: ImageState::Error,
                        error: Some(e.to_info()),
                    });
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            let mut status = Self::error_status(&item, &e);
            status.images = images
                .iter()
                .map(|i| ImageStatus {
                    image_id: i.image_id.clone(),
                    state: i.state,
                    error: i.error.clone(),
                })
                .collect();
            return status;
        }

        let row = StoredItem {
            item_id: item.item_id.clone(),
            version: item.version.clone(),
            state: ImageState::Installed,
            total_size,
            images,
            timestamp_ms: now_ms(),
            error: None,
        };

        if let Err(e) = self.commit_install(&row) {
            return Self::error_status(&item, &e);
        }

        info!(item_id = %item.item_id, version = %item.version, total_size, "item installed");
        Self::status_from_row(&row)
    }

    /// Idempotence: a matching stored version is reused instead of
    /// reinstalled; a matching cached version is resurrected.
    fn try_reuse_stored(&self, item: &UpdateItemInfo) -> ImageResult<Option<UpdateItemStatus>> {
        let Some(existing) = self.store.get_item(&item.item_id, &item.version)? else {
            return Ok(None);
        };

        let digests_match = existing.images.len() == item.images.len()
            && item
                .images
                .iter()
                .all(|i| existing.images.iter().any(|e| e.digest == i.digest));
        if !digests_match {
            return Ok(None);
        }

        match existing.state {
            ImageState::Installed => {
                debug!(item_id = %item.item_id, version = %item.version, "already installed");
                Ok(Some(Self::status_from_row(&existing)))
            }
            ImageState::Cached => {
                debug!(item_id = %item.item_id, version = %item.version, "resurrecting cached version");

                self.allocator
                    .restore_outdated_item(&existing.table_key());

                let mut promoted = existing;
                promoted.state = ImageState::Installed;
                promoted.timestamp_ms = now_ms();
                self.commit_install(&promoted)?;

                Ok(Some(Self::status_from_row(&promoted)))
            }
            _ => Ok(None),
        }
    }

    /// Write the installed row and demote any other installed version of
    /// the same item to `Cached`. At most one version of an item is
    /// `Installed` at any moment.
    fn commit_install(&self, row: &StoredItem) -> ImageResult<()> {
        for mut other in self.store.list_item_versions(&row.item_id)? {
            if other.version == row.version || other.state != ImageState::Installed {
                continue;
            }

            other.state = ImageState::Cached;
            other.timestamp_ms = now_ms();
            self.store.put_item(&other)?;

            if let Err(e) = self
                .allocator
                .add_outdated_item(&other.table_key(), other.timestamp_ms)
            {
                warn!(key = %other.table_key(), error = %e, "failed to register outdated item");
            }

            debug!(item_id = %other.item_id, version = %other.version, "version demoted to cached");
        }

        self.store.put_item(row)?;
        Ok(())
    }

    async fn install_image(
        &self,
        image: &ImageInfo,
        chains: &[CertificateChainInfo],
    ) -> ImageResult<u64> {
        let blob = blob_path(&self.storage_root, &image.digest);
        digest::split(&image.digest)?;

        // Serialise per digest so concurrent items sharing a blob don't
        // both download it.
        let blob_lock = self.item_lock(&format!("blob:{}", image.digest));
        let _blob_guard = blob_lock.lock().await;

        if blob.exists() {
            // Deduplicated: another item version already brought this blob.
            debug!(digest = %image.digest, "blob already present");
            return Ok(self.known_blob_size(&image.digest));
        }

        // Compressed download + unpacked copy both need room until the
        // reservation is resized to the real unpacked size.
        let mut reservation = self.allocator.allocate_space(image.size * 2)?;

        std::fs::create_dir_all(&self.download_dir)?;
        let (_, hex) = digest::split(&image.digest)?;
        let download_path = self.download_dir.join(format!("{hex}.enc"));
        let decrypted_path = self.download_dir.join(format!("{hex}.dec"));

        let result = self
            .fetch_and_unpack(image, chains, &download_path, &decrypted_path, &blob)
            .await;

        let _ = std::fs::remove_file(&download_path);
        let _ = std::fs::remove_file(&decrypted_path);

        match result {
            Ok(unpacked_size) => {
                reservation.resize(unpacked_size);
                reservation.accept()?;
                Ok(unpacked_size)
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&blob);
                // Reservation dropped here refunds the charge.
                Err(e)
            }
        }
    }

    async fn fetch_and_unpack(
        &self,
        image: &ImageInfo,
        chains: &[CertificateChainInfo],
        download_path: &Path,
        decrypted_path: &Path,
        blob: &Path,
    ) -> ImageResult<u64> {
        self.downloader
            .download(&image.urls, download_path)
            .await
            .map_err(ImageError::Download)?;

        let actual = digest::file_digest(download_path)?;
        if actual != image.digest {
            return Err(ImageError::DigestMismatch {
                expected: image.digest.clone(),
                actual,
            });
        }

        self.crypto
            .decrypt(download_path, decrypted_path, &image.decrypt_info)
            .await
            .map_err(ImageError::Decrypt)?;

        self.crypto
            .verify(decrypted_path, &image.sign_info, chains)
            .await
            .map_err(ImageError::Verify)?;

        if let Some(parent) = blob.parent() {
            std::fs::create_dir_all(parent)?;
        }

        self.unpacker
            .unpack(decrypted_path, blob)
            .await
            .map_err(ImageError::Unpack)
    }

    fn known_blob_size(&self, image_digest: &str) -> u64 {
        self.store
            .list_items()
            .unwrap_or_default()
            .iter()
            .flat_map(|row| row.images.iter())
            .find(|i| i.digest == image_digest)
            .map(|i| i.size)
            .unwrap_or(0)
    }

    fn item_lock(&self, item_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.item_locks
            .lock()
            .unwrap()
            .entry(item_id.to_string())
            .or_default()
            .clone()
    }

    fn status_from_row(row: &StoredItem) -> UpdateItemStatus {
        UpdateItemStatus {
            item_id: row.item_id.clone(),
            version: row.version.clone(),
            state: row.state,
            images: row
                .images
                .iter()
                .map(|i| ImageStatus {
                    image_id: i.image_id.clone(),
                    state: i.state,
                    error: i.error.clone(),
                })
                .collect(),
            error: row.error.clone(),
        }
    }

    fn error_status(item: &UpdateItemInfo, error: &ImageError) -> UpdateItemStatus {
        UpdateItemStatus {
            item_id: item.item_id.clone(),
            version: item.version.clone(),
            state: ImageState::Error,
            images: Vec::new(),
            error: Some(error.to_info()),
        }
    }

    fn notify(&self, status: &UpdateItemStatus) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_item_status_changed(status);
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
