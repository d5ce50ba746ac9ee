//! Space manager, per-subsystem allocators and scoped reservations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use corral_core::limits::MAX_OUTDATED_ITEMS;

use crate::error::{AllocatorError, AllocatorResult};
use crate::fs::FsStats;

/// Deletes an evictable item on the allocator's behalf.
///
/// Returns the number of bytes the removal freed.
pub trait ItemRemover: Send + Sync {
    fn remove_item(&self, id: &str) -> AllocatorResult<u64>;
}

/// An item its owner no longer needs, promised to the partition for
/// eviction when space runs short.
struct OutdatedEntry {
    id: String,
    timestamp_ms: u64,
    remover: Arc<dyn ItemRemover>,
    owner: Weak<AllocatorInner>,
}

/// Refund to apply to an owner's quota once the partition lock is dropped.
type Refund = (Weak<AllocatorInner>, u64);

struct PartitionState {
    available_size: u64,
    allocation_count: usize,
    allocator_count: usize,
    /// Sum of allocator limits, percent of the partition. Capped at 100.
    limit_percent: u64,
    outdated: Vec<OutdatedEntry>,
}

/// One record per mount point, shared by every allocator on it.
struct Partition {
    mount_point: PathBuf,
    total_size: u64,
    state: Mutex<PartitionState>,
}

impl Partition {
    fn allocate(&self, size: u64, fs: &dyn FsStats) -> (AllocatorResult<()>, Vec<Refund>) {
        let mut refunds = Vec::new();
        let mut state = self.state.lock().unwrap();

        if state.allocation_count == 0 {
            match fs.available_size(&self.mount_point) {
                Ok(available) => state.available_size = available,
                Err(e) => return (Err(e.into()), refunds),
            }
        }

        if size > state.available_size {
            if state.outdated.is_empty() {
                return (
                    Err(AllocatorError::NoSpace(format!(
                        "need {size} B on {}",
                        self.mount_point.display()
                    ))),
                    refunds,
                );
            }

            let needed = size - state.available_size;
            let (freed, result) = Self::evict(&mut state, needed, None, &mut refunds);
            state.available_size += freed;
            if let Err(e) = result {
                return (Err(e), refunds);
            }

            if size > state.available_size {
                return (
                    Err(AllocatorError::NoSpace(format!(
                        "need {size} B on {} after eviction",
                        self.mount_point.display()
                    ))),
                    refunds,
                );
            }
        }

        state.available_size -= size;
        state.allocation_count += 1;

        (Ok(()), refunds)
    }

    fn free(&self, size: u64) {
        let mut state = self.state.lock().unwrap();
        if state.allocation_count == 0 {
            return;
        }
        state.available_size += size;
    }

    fn done(&self) -> AllocatorResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.allocation_count == 0 {
            return Err(AllocatorError::NotFound("no allocation in progress".into()));
        }
        state.allocation_count -= 1;
        Ok(())
    }

    /// Evict outdated items oldest-first until `needed` bytes are freed or
    /// the candidate list is exhausted. With `owner` set, only that
    /// allocator's items are candidates (quota pressure); otherwise any
    /// item on the partition may go (partition pressure).
    ///
    /// Called under the partition lock; owner refunds are collected, not
    /// applied, to keep the allocator → partition lock order. Returns the
    /// freed bytes alongside the first removal error — bytes freed before
    /// a failure stay freed.
    fn evict(
        state: &mut PartitionState,
        needed: u64,
        owner: Option<&Arc<AllocatorInner>>,
        refunds: &mut Vec<Refund>,
    ) -> (u64, AllocatorResult<()>) {
        state.outdated.sort_by_key(|item| item.timestamp_ms);

        let mut freed = 0u64;
        let mut kept = Vec::new();
        let mut failure = None;

        for item in std::mem::take(&mut state.outdated) {
            let eligible = match owner {
                Some(owner) => item
                    .owner
                    .upgrade()
                    .is_some_and(|o| Arc::ptr_eq(&o, owner)),
                None => true,
            };

            if failure.is_some() || !eligible || freed >= needed {
                kept.push(item);
                continue;
            }

            match item.remover.remove_item(&item.id) {
                Ok(size) => {
                    debug!(id = %item.id, size, "evicted outdated item");
                    refunds.push((item.owner.clone(), size));
                    freed += size;
                }
                Err(e) => {
                    failure = Some(e);
                    kept.push(item);
                }
            }
        }

        state.outdated = kept;
        (freed, failure.map_or(Ok(()), Err))
    }

    /// Evict only `owner`'s items; credits the partition with the freed
    /// bytes and returns them so the owner can shrink its own charge.
    /// The collected refunds are dropped: the caller adjusts its own
    /// charge from the return value (and holds its own lock already).
    fn evict_owned(
        &self,
        owner: &Arc<AllocatorInner>,
        needed: u64,
    ) -> AllocatorResult<u64> {
        let mut refunds = Vec::new();
        let mut state = self.state.lock().unwrap();

        let owns_any = state.outdated.iter().any(|item| {
            item.owner.upgrade().is_some_and(|o| Arc::ptr_eq(&o, owner))
        });
        if !owns_any {
            return Err(AllocatorError::NoMemory("no evictable items".into()));
        }

        let (freed, result) = Self::evict(&mut state, needed, Some(owner), &mut refunds);
        state.available_size += freed;
        result.map(|_| freed)
    }

    fn add_outdated(&self, entry: OutdatedEntry) -> (AllocatorResult<()>, Vec<Refund>) {
        let mut refunds = Vec::new();
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state.outdated.iter_mut().find(|i| i.id == entry.id) {
            *existing = entry;
            return (Ok(()), refunds);
        }

        if state.outdated.len() >= MAX_OUTDATED_ITEMS {
            // List full: the oldest promise is called in immediately.
            state.outdated.sort_by_key(|item| item.timestamp_ms);
            let oldest = state.outdated.remove(0);

            match oldest.remover.remove_item(&oldest.id) {
                Ok(size) => {
                    refunds.push((oldest.owner.clone(), size));
                    state.available_size += size;
                }
                Err(e) => return (Err(e), refunds),
            }
        }

        state.outdated.push(entry);
        (Ok(()), refunds)
    }

    fn restore_outdated(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.outdated.retain(|item| item.id != id);
    }
}

struct AllocatorState {
    allocated_size: u64,
    allocation_count: usize,
}

struct AllocatorInner {
    path: PathBuf,
    fs: Arc<dyn FsStats>,
    partition: Arc<Partition>,
    remover: Option<Arc<dyn ItemRemover>>,
    /// Byte quota derived from the limit percentage; 0 = unlimited.
    size_limit: u64,
    state: Mutex<AllocatorState>,
}

impl AllocatorInner {
    fn allocate_quota(self: &Arc<Self>, size: u64) -> AllocatorResult<()> {
        if self.size_limit == 0 {
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();

        if state.allocation_count == 0 {
            state.allocated_size = self.fs.dir_size(&self.path)?;
        }

        if state.allocated_size + size > self.size_limit {
            let needed = state.allocated_size + size - self.size_limit;
            let freed = self.partition.evict_owned(self, needed)?;
            state.allocated_size = state.allocated_size.saturating_sub(freed);

            if state.allocated_size + size > self.size_limit {
                return Err(AllocatorError::NoMemory(format!(
                    "quota {} B exceeded for {}",
                    self.size_limit,
                    self.path.display()
                )));
            }
        }

        state.allocated_size += size;
        state.allocation_count += 1;

        Ok(())
    }

    fn quota_free(&self, size: u64) {
        if self.size_limit == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.allocation_count > 0 {
            state.allocated_size = state.allocated_size.saturating_sub(size);
        }
    }

    fn quota_done(&self) -> AllocatorResult<()> {
        if self.size_limit == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        if state.allocation_count == 0 {
            return Err(AllocatorError::NotFound("no allocation in progress".into()));
        }
        state.allocation_count -= 1;
        Ok(())
    }

    fn free(&self, size: u64) {
        self.quota_free(size);
        self.partition.free(size);
    }

    fn done(&self) -> AllocatorResult<()> {
        self.quota_done()?;
        self.partition.done()
    }
}

fn apply_refunds(refunds: Vec<Refund>) {
    for (owner, size) in refunds {
        if let Some(owner) = owner.upgrade() {
            owner.quota_free(size);
        }
    }
}

/// Process-wide partition registry. Construct once, inject everywhere.
pub struct SpaceManager {
    fs: Arc<dyn FsStats>,
    partitions: Mutex<HashMap<PathBuf, Arc<Partition>>>,
}

impl SpaceManager {
    pub fn new(fs: Arc<dyn FsStats>) -> Arc<Self> {
        Arc::new(Self { fs, partitions: Mutex::new(HashMap::new()) })
    }

    /// Create an allocator rooted at `path`.
    ///
    /// `limit_percent` (0–100) carves a quota out of the partition for
    /// this allocator; 0 means no dedicated quota. The per-partition sum
    /// of limits may not exceed 100.
    pub fn allocator(
        self: &Arc<Self>,
        path: &Path,
        limit_percent: u8,
        remover: Option<Arc<dyn ItemRemover>>,
    ) -> AllocatorResult<SpaceAllocator> {
        std::fs::create_dir_all(path)?;

        let mount = self.fs.mount_point(path)?;

        let partition = {
            let mut partitions = self.partitions.lock().unwrap();
            match partitions.get(&mount) {
                Some(partition) => partition.clone(),
                None => {
                    let total_size = self.fs.total_size(&mount)?;
                    let partition = Arc::new(Partition {
                        mount_point: mount.clone(),
                        total_size,
                        state: Mutex::new(PartitionState {
                            available_size: 0,
                            allocation_count: 0,
                            allocator_count: 0,
                            limit_percent: 0,
                            outdated: Vec::new(),
                        }),
                    });
                    partitions.insert(mount.clone(), partition.clone());
                    partition
                }
            }
        };

        {
            let mut state = partition.state.lock().unwrap();
            if state.limit_percent + u64::from(limit_percent) > 100 {
                return Err(AllocatorError::NoMemory(format!(
                    "partition limit exceeded on {}",
                    mount.display()
                )));
            }
            state.limit_percent += u64::from(limit_percent);
            state.allocator_count += 1;
        }

        let size_limit = partition.total_size * u64::from(limit_percent) / 100;

        debug!(
            path = %path.display(),
            mount = %mount.display(),
            limit_percent,
            size_limit,
            "space allocator created"
        );

        Ok(SpaceAllocator {
            inner: Arc::new(AllocatorInner {
                path: path.to_path_buf(),
                fs: self.fs.clone(),
                partition,
                remover,
                size_limit,
                state: Mutex::new(AllocatorState { allocated_size: 0, allocation_count: 0 }),
            }),
            limit_percent,
        })
    }
}

/// One subsystem's handle onto its partition.
pub struct SpaceAllocator {
    inner: Arc<AllocatorInner>,
    limit_percent: u8,
}

impl SpaceAllocator {
    /// Reserve `size` bytes, evicting outdated items if necessary.
    ///
    /// The returned reservation refunds the bytes on drop unless
    /// [`SpaceReservation::accept`]ed.
    pub fn allocate_space(&self, size: u64) -> AllocatorResult<SpaceReservation> {
        self.inner.allocate_quota(size)?;

        let (result, refunds) = self.inner.partition.allocate(size, self.inner.fs.as_ref());
        apply_refunds(refunds);

        if let Err(e) = result {
            self.inner.quota_free(size);
            let _ = self.inner.quota_done();
            return Err(e);
        }

        Ok(SpaceReservation { size, inner: self.inner.clone(), settled: false })
    }

    /// Unconditional refund for bytes erased outside the reservation
    /// protocol.
    pub fn free_space(&self, size: u64) {
        self.inner.free(size);
    }

    /// Promise the partition it may delete `id` (through the registered
    /// remover) when space is short.
    pub fn add_outdated_item(&self, id: &str, timestamp_ms: u64) -> AllocatorResult<()> {
        let remover = self
            .inner
            .remover
            .clone()
            .ok_or_else(|| AllocatorError::NotFound("no item remover registered".into()))?;

        let (result, refunds) = self.inner.partition.add_outdated(OutdatedEntry {
            id: id.to_string(),
            timestamp_ms,
            remover,
            owner: Arc::downgrade(&self.inner),
        });
        apply_refunds(refunds);
        result
    }

    /// Withdraw an eviction promise.
    pub fn restore_outdated_item(&self, id: &str) {
        self.inner.partition.restore_outdated(id);
    }
}

impl Drop for SpaceAllocator {
    fn drop(&mut self) {
        let mut state = self.inner.partition.state.lock().unwrap();
        state.limit_percent = state.limit_percent.saturating_sub(u64::from(self.limit_percent));
        state.allocator_count = state.allocator_count.saturating_sub(1);
    }
}

/// A pending space charge with a scoped lifetime.
///
/// Dropping the reservation refunds the bytes; `accept` makes the charge
/// permanent; `release` refunds explicitly.
pub struct SpaceReservation {
    size: u64,
    inner: Arc<AllocatorInner>,
    settled: bool,
}

impl SpaceReservation {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Adjust the reserved size before settling (e.g. once the real
    /// unpacked size is known).
    pub fn resize(&mut self, size: u64) {
        self.size = size;
    }

    /// Commit the charge.
    pub fn accept(mut self) -> AllocatorResult<()> {
        self.settled = true;
        self.inner.done()
    }

    /// Refund the charge.
    pub fn release(mut self) -> AllocatorResult<()> {
        self.settled = true;
        self.inner.free(self.size);
        self.inner.done()
    }
}

impl Drop for SpaceReservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.inner.free(self.size);
        if let Err(e) = self.inner.done() {
            warn!(error = %e, "unbalanced space reservation on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed-geometry fake filesystem.
    struct FakeFs {
        total: u64,
        available: AtomicU64,
        dir: AtomicU64,
    }

    impl FakeFs {
        fn new(total: u64, available: u64) -> Arc<Self> {
            Arc::new(Self {
                total,
                available: AtomicU64::new(available),
                dir: AtomicU64::new(0),
            })
        }
    }

    impl FsStats for FakeFs {
        fn mount_point(&self, _path: &Path) -> io::Result<PathBuf> {
            Ok(PathBuf::from("/mnt/fake"))
        }

        fn total_size(&self, _mount: &Path) -> io::Result<u64> {
            Ok(self.total)
        }

        fn available_size(&self, _mount: &Path) -> io::Result<u64> {
            Ok(self.available.load(Ordering::SeqCst))
        }

        fn dir_size(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.dir.load(Ordering::SeqCst))
        }
    }

    /// Remover that frees a fixed size per item and records removals.
    struct FakeRemover {
        item_size: u64,
        removed: Mutex<Vec<String>>,
    }

    impl FakeRemover {
        fn new(item_size: u64) -> Arc<Self> {
            Arc::new(Self { item_size, removed: Mutex::new(Vec::new()) })
        }

        fn removed(&self) -> Vec<String> {
            self.removed.lock().unwrap().clone()
        }
    }

    impl ItemRemover for FakeRemover {
        fn remove_item(&self, id: &str) -> AllocatorResult<u64> {
            self.removed.lock().unwrap().push(id.to_string());
            Ok(self.item_size)
        }
    }

    fn tmp_path() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn allocate_within_free_space_succeeds() {
        let dir = tmp_path();
        let manager = SpaceManager::new(FakeFs::new(1000, 500));
        let allocator = manager.allocator(dir.path(), 0, None).unwrap();

        let reservation = allocator.allocate_space(300).unwrap();
        assert_eq!(reservation.size(), 300);
        reservation.accept().unwrap();
    }

    #[test]
    fn allocate_beyond_free_space_without_outdated_items_fails() {
        let dir = tmp_path();
        let manager = SpaceManager::new(FakeFs::new(1000, 100));
        let allocator = manager.allocator(dir.path(), 0, None).unwrap();

        assert!(matches!(
            allocator.allocate_space(200),
            Err(AllocatorError::NoSpace(_))
        ));
    }

    #[test]
    fn eviction_covers_exactly_free_plus_oldest() {
        // Free 100 + one outdated item worth 100 == request 200.
        let dir = tmp_path();
        let manager = SpaceManager::new(FakeFs::new(1000, 100));
        let remover = FakeRemover::new(100);
        let allocator = manager.allocator(dir.path(), 0, Some(remover.clone())).unwrap();

        allocator.add_outdated_item("old", 1000).unwrap();
        allocator.add_outdated_item("newer", 2000).unwrap();

        let reservation = allocator.allocate_space(200).unwrap();
        // Only the oldest item was removed.
        assert_eq!(remover.removed(), vec!["old".to_string()]);
        reservation.accept().unwrap();
    }

    #[test]
    fn eviction_exhausted_returns_no_space() {
        // Free 100 + both items (200) < request 400.
        let dir = tmp_path();
        let manager = SpaceManager::new(FakeFs::new(1000, 100));
        let remover = FakeRemover::new(100);
        let allocator = manager.allocator(dir.path(), 0, Some(remover.clone())).unwrap();

        allocator.add_outdated_item("a", 1000).unwrap();
        allocator.add_outdated_item("b", 2000).unwrap();

        assert!(matches!(
            allocator.allocate_space(400),
            Err(AllocatorError::NoSpace(_))
        ));
        // Eviction side effects stand even though the request failed.
        assert_eq!(remover.removed().len(), 2);
    }

    #[test]
    fn eviction_is_oldest_first() {
        let dir = tmp_path();
        let manager = SpaceManager::new(FakeFs::new(1000, 0));
        let remover = FakeRemover::new(100);
        let allocator = manager.allocator(dir.path(), 0, Some(remover.clone())).unwrap();

        allocator.add_outdated_item("c", 3000).unwrap();
        allocator.add_outdated_item("a", 1000).unwrap();
        allocator.add_outdated_item("b", 2000).unwrap();

        let _reservation = allocator.allocate_space(200).unwrap();
        assert_eq!(remover.removed(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn restore_withdraws_eviction_promise() {
        let dir = tmp_path();
        let manager = SpaceManager::new(FakeFs::new(1000, 100));
        let remover = FakeRemover::new(100);
        let allocator = manager.allocator(dir.path(), 0, Some(remover.clone())).unwrap();

        allocator.add_outdated_item("only", 1000).unwrap();
        allocator.restore_outdated_item("only");

        assert!(matches!(
            allocator.allocate_space(200),
            Err(AllocatorError::NoSpace(_))
        ));
        assert!(remover.removed().is_empty());
    }

    #[test]
    fn dropped_reservation_refunds_space() {
        let dir = tmp_path();
        let manager = SpaceManager::new(FakeFs::new(1000, 300));
        let allocator = manager.allocator(dir.path(), 0, None).unwrap();

        {
            let _reservation = allocator.allocate_space(300).unwrap();
            // Nothing left while the reservation is alive.
            assert!(allocator.allocate_space(1).is_err());
        }

        // Refunded on drop.
        let reservation = allocator.allocate_space(300).unwrap();
        reservation.release().unwrap();
    }

    #[test]
    fn quota_pressure_only_evicts_own_items() {
        let dir_a = tmp_path();
        let dir_b = tmp_path();
        let fs = FakeFs::new(1000, 1000);
        let manager = SpaceManager::new(fs);

        let remover_a = FakeRemover::new(50);
        let remover_b = FakeRemover::new(50);

        // Allocator A gets 10% of 1000 B = 100 B quota.
        let alloc_a = manager.allocator(dir_a.path(), 10, Some(remover_a.clone())).unwrap();
        let alloc_b = manager.allocator(dir_b.path(), 0, Some(remover_b.clone())).unwrap();

        alloc_b.add_outdated_item("b-item", 500).unwrap();
        alloc_a.add_outdated_item("a-item", 1000).unwrap();

        // 60 + 60 exceeds A's 100 B quota; only A's item may be evicted.
        let first = alloc_a.allocate_space(60).unwrap();
        let second = alloc_a.allocate_space(60).unwrap();

        assert_eq!(remover_a.removed(), vec!["a-item".to_string()]);
        assert!(remover_b.removed().is_empty());

        first.accept().unwrap();
        second.accept().unwrap();
    }

    #[test]
    fn quota_exhausted_without_own_items_is_no_memory() {
        let dir = tmp_path();
        let manager = SpaceManager::new(FakeFs::new(1000, 1000));
        let allocator = manager.allocator(dir.path(), 10, None).unwrap();

        let _first = allocator.allocate_space(80).unwrap();
        assert!(matches!(
            allocator.allocate_space(80),
            Err(AllocatorError::NoMemory(_))
        ));
    }

    #[test]
    fn partition_limits_cannot_exceed_hundred_percent() {
        let dir_a = tmp_path();
        let dir_b = tmp_path();
        let manager = SpaceManager::new(FakeFs::new(1000, 1000));

        let _a = manager.allocator(dir_a.path(), 70, None).unwrap();
        assert!(matches!(
            manager.allocator(dir_b.path(), 40, None),
            Err(AllocatorError::NoMemory(_))
        ));
    }

    #[test]
    fn outdated_item_is_replaced_by_id() {
        let dir = tmp_path();
        let manager = SpaceManager::new(FakeFs::new(1000, 0));
        let remover = FakeRemover::new(100);
        let allocator = manager.allocator(dir.path(), 0, Some(remover.clone())).unwrap();

        allocator.add_outdated_item("x", 1000).unwrap();
        allocator.add_outdated_item("x", 9000).unwrap();
        allocator.add_outdated_item("y", 5000).unwrap();

        // "y" (ts 5000) is now older than "x" (ts 9000).
        let _reservation = allocator.allocate_space(100).unwrap();
        assert_eq!(remover.removed(), vec!["y".to_string()]);
    }

    #[test]
    fn add_outdated_without_remover_fails() {
        let dir = tmp_path();
        let manager = SpaceManager::new(FakeFs::new(1000, 1000));
        let allocator = manager.allocator(dir.path(), 0, None).unwrap();

        assert!(matches!(
            allocator.add_outdated_item("x", 1000),
            Err(AllocatorError::NotFound(_))
        ));
    }
}
