//! Buffer Hash & Lookup — find-or-create buffer keyed by
//! `(target, byte-range)`, with a per-bucket spinlock.
//!
//! The bucket-mixing and miss/hit protocol follow XFS's `pb_hash`/
//! `_pagebuf_find`; the partitioned structure (one `parking_lot` lock
//! per bucket instead of one lock guarding the whole cache) keeps
//! lookups for unrelated keys from contending with each other.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::object::{Buffer, BufferFlags, BufferKey};
use super::{AlignmentPolicy, BufferError, DeviceTarget};
use crate::block_io::BlockIoPort;
use crate::common::ByteOffset;
use crate::page_store::{GfpHint, PageIndex, PAGE_SIZE};

pub const DEFAULT_BUCKET_COUNT: usize = 256;

/// Flags a caller passes to `find`/`get`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupFlags {
    pub read: bool,
    pub async_io: bool,
    pub trylock: bool,
}

struct Bucket {
    lock: Mutex<VecDeque<Arc<Buffer>>>,
}

/// A fixed-size array of hash buckets indexing the buffers of one or more
/// [`DeviceTarget`]s.
pub struct BufferCache {
    buckets: Vec<Bucket>,
    mask: usize,
}

/// Bucket index mixing, ported from the original's `pb_hash`: fold the
/// device id and the sector-shifted offset in 8-bit slices.
fn bucket_index(device_id: u32, offset: ByteOffset, sector_shift: u32, bucket_count: usize) -> usize {
    let mut hash = (device_id as u64) ^ (offset >> sector_shift);
    let mut folded: u64 = 0;
    while hash != 0 {
        folded ^= hash & 0xFF;
        hash >>= 8;
    }
    (folded as usize) & (bucket_count - 1)
}

impl BufferCache {
    pub fn new() -> Self {
        Self::with_bucket_count(DEFAULT_BUCKET_COUNT)
    }

    pub fn with_bucket_count(bucket_count: usize) -> Self {
        assert!(bucket_count.is_power_of_two(), "bucket count must be a power of two");
        let buckets = (0..bucket_count).map(|_| Bucket { lock: Mutex::new(VecDeque::new()) }).collect();
        BufferCache { buckets, mask: bucket_count - 1 }
    }

    fn bucket_for(&self, target: &DeviceTarget, offset: ByteOffset) -> &Bucket {
        let idx = bucket_index(target.device_id, offset, target.sector_shift, self.mask + 1);
        &self.buckets[idx]
    }

    /// `find`: look in the cache only; never read; never create.
    pub fn find(&self, target: &DeviceTarget, offset: ByteOffset, length: usize) -> Option<Arc<Buffer>> {
        let bucket = self.bucket_for(target, offset);
        let list = bucket.lock.lock();
        list.iter()
            .find(|b| !b.flags.contains(BufferFlags::STALE) && b.offset == offset && b.length == length)
            .cloned()
    }

    /// `find_or_create`: walks the bucket skipping stale entries;
    /// on hit, moves the entry to the front and tries its semaphore
    /// without sleeping (honoring `TRYLOCK`); on miss, links a freshly
    /// constructed buffer at the bucket head.
    async fn find_or_create(
        &self,
        target: Arc<DeviceTarget>,
        offset: ByteOffset,
        length: usize,
        desired_count: usize,
        flags: LookupFlags,
    ) -> Result<Arc<Buffer>, BufferError> {
        let bucket = self.bucket_for(&target, offset);
        let hit = {
            let mut list = bucket.lock.lock();
            list.iter()
                .position(|b| !b.flags.contains(BufferFlags::STALE) && b.offset == offset && b.length == length)
                .map(|pos| {
                    let found = list.remove(pos).unwrap();
                    list.push_front(found.clone());
                    found
                })
        };
        if let Some(found) = hit {
            found.hold();
            if found.trylock() {
                return Ok(found);
            }
            if flags.trylock {
                self.release(&target, &found);
                return Err(BufferError::WouldBlock);
            }
            // The bucket spinlock was already dropped before this point,
            // so waiting here cannot deadlock against the owner
            // releasing the buffer's semaphore.
            found.lock().await;
            return Ok(found);
        }
        let buffer = Buffer::new(target, offset, length, desired_count);
        buffer.hold();
        let acquired = buffer.trylock();
        debug_assert!(acquired, "a freshly created buffer's semaphore must be uncontended");
        buffer.target.index.insert(buffer.offset, buffer.length as u64);
        let mut list = bucket.lock.lock();
        list.push_front(buffer.clone());
        Ok(buffer)
    }

    /// `get`: find-or-create, ensure backing pages exist, then if
    /// `READ` start I/O (synchronously unless `ASYNC`).
    pub async fn get(
        &self,
        target: Arc<DeviceTarget>,
        offset: ByteOffset,
        length: usize,
        flags: LookupFlags,
        block_io: &dyn BlockIoPort,
    ) -> Result<Arc<Buffer>, BufferError> {
        let _span = tracing::debug_span!("buffer_get", device = target.device_id, offset, length).entered();
        let buffer = self.find_or_create(target, offset, length, length, flags).await?;
        if buffer.pages().is_empty() && !buffer.has_standalone_memory() {
            self.allocate_pages(&buffer)?;
        }
        if flags.read {
            buffer.flags.set(BufferFlags::READ);
            if flags.async_io {
                // Fire-and-forget: completion is observed via the
                // buffer's iodone callback or a later `iowait`.
                let _ = buffer.iorequest(block_io, crate::block_io::IoOp::Read);
            } else {
                buffer.iorequest(block_io, crate::block_io::IoOp::Read)?;
            }
        }
        Ok(buffer)
    }

    /// `lookup_skeletal`: allocate without pages, for clients that
    /// will attach externally owned memory.
    pub async fn lookup_skeletal(&self, target: Arc<DeviceTarget>, offset: ByteOffset, length: usize) -> Arc<Buffer> {
        self.find_or_create(target, offset, length, length, LookupFlags::default())
            .await
            .expect("skeletal lookup never fails: it allocates no pages and never I/Os")
    }

    /// `get_no_daddr`: a standalone buffer with heap memory sized
    /// to at most 128 KiB, aligned to the target's sector mask.
    pub fn get_no_daddr(&self, target: Arc<DeviceTarget>, length: usize) -> Result<Arc<Buffer>, BufferError> {
        const MAX_STANDALONE: usize = 128 * 1024;
        if length > MAX_STANDALONE {
            return Err(BufferError::OutOfMemory);
        }
        let aligned = (length as u64 + target.sector_mask) & !target.sector_mask;
        let buffer = Buffer::new(target, 0, length, length);
        buffer.associate_memory(vec![0u8; aligned as usize]);
        // Freshly constructed buffers start unlocked (`Buffer::new` never
        // auto-acquires the semaphore); `find_or_create`'s miss path locks
        // explicitly so callers always get a locked buffer back, and this
        // standalone path does the same for consistency.
        let acquired = buffer.trylock();
        debug_assert!(acquired, "a freshly created standalone buffer's semaphore must be uncontended");
        Ok(buffer)
    }

    /// Allocates backing pages for a buffer, retrying a bounded number of
    /// times with a cooperative yield on allocation pressure.
    fn allocate_pages(&self, buffer: &Buffer) -> Result<(), BufferError> {
        const MAX_RETRIES: u32 = 8;
        let page_count = (buffer.length + PAGE_SIZE - 1) / PAGE_SIZE;
        let aspace = buffer.target.device_id;
        let base_index: PageIndex = buffer.offset / PAGE_SIZE as u64;
        let mut pages = Vec::with_capacity(page_count);
        for i in 0..page_count {
            let mut attempt = 0;
            loop {
                match buffer.target.page_store.find_or_create_page(aspace, base_index + i as u64, GfpHint::Wait) {
                    Ok(page) => {
                        pages.push(page);
                        break;
                    }
                    Err(_) if attempt < MAX_RETRIES => {
                        attempt += 1;
                        std::thread::yield_now();
                    }
                    Err(_) => return Err(BufferError::OutOfMemory),
                }
            }
        }
        buffer.attach_pages(pages);
        Ok(())
    }

    /// Drops a caller's reference to `buffer` and, if that was the last
    /// one and the buffer isn't sitting on the delwri queue, removes it
    /// from the cache. This is the counterpart clients of `get`/
    /// `find_or_create` should call instead of `Buffer::rele` directly,
    /// so a buffer's refcount reaching zero actually clears it out of
    /// the hash instead of leaking the bucket slot forever.
    pub fn release(&self, target: &DeviceTarget, buffer: &Arc<Buffer>) {
        if buffer.rele() {
            self.evict(target, buffer);
        }
    }

    /// Removes a buffer from its bucket entirely (used when a reference
    /// count drops to zero and the buffer is not delwri-queued).
    pub fn evict(&self, target: &DeviceTarget, buffer: &Arc<Buffer>) {
        tracing::trace!(device = target.device_id, offset = buffer.offset, "buffer_evict");
        let bucket = self.bucket_for(target, buffer.offset);
        let mut list = bucket.lock.lock();
        list.retain(|b| !Arc::ptr_eq(b, buffer));
        drop(list);
        target.index.remove(buffer.offset);
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::MemoryBlockDevice;
    use crate::page_store::MemoryPageStore;

    fn setup() -> (Arc<DeviceTarget>, BufferCache, MemoryBlockDevice) {
        let store = Arc::new(MemoryPageStore::new());
        let target = Arc::new(DeviceTarget::new(0, store, AlignmentPolicy::Any));
        (target, BufferCache::new(), MemoryBlockDevice::new(4096))
    }

    #[tokio::test]
    async fn find_or_create_returns_identical_buffer_for_same_key() {
        let (target, cache, device) = setup();
        let b1 = cache
            .get(target.clone(), 8192, 4096, LookupFlags::default(), &device)
            .await
            .unwrap();
        b1.unlock();
        let b2 = cache
            .get(target.clone(), 8192, 4096, LookupFlags::default(), &device)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&b1, &b2));
        assert_eq!(b1.ref_count(), 2);
        b2.unlock();
        assert!(b1.rele());
        assert!(!b2.rele());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_for_same_key_creates_exactly_one_buffer() {
        let store = Arc::new(MemoryPageStore::new());
        let target = Arc::new(DeviceTarget::new(0, store, AlignmentPolicy::Any));
        let cache = Arc::new(BufferCache::new());
        let device = Arc::new(MemoryBlockDevice::new(4096));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let target = target.clone();
            let device = device.clone();
            handles.push(tokio::spawn(async move {
                let buf = cache.get(target, 8192, 4096, LookupFlags::default(), device.as_ref()).await.unwrap();
                // Each task releases the lock immediately so the next
                // waiter in line can make progress; the race under test
                // is over identity/refcount, not serialized access.
                buf.unlock();
                buf
            }));
        }
        let mut buffers = Vec::new();
        for h in handles {
            buffers.push(h.await.unwrap());
        }
        for b in &buffers {
            assert!(Arc::ptr_eq(b, &buffers[0]), "every concurrent get must return the same buffer object");
        }
        assert_eq!(buffers[0].ref_count(), 8);
        for b in &buffers {
            b.rele();
        }
        assert_eq!(buffers[0].ref_count(), 0);
    }

    #[tokio::test]
    async fn find_without_prior_get_returns_none() {
        let (target, cache, _device) = setup();
        assert!(cache.find(&target, 0, 4096).is_none());
    }

    #[tokio::test]
    async fn get_registers_buffer_in_target_index_and_evict_removes_it() {
        let (target, cache, device) = setup();
        let buf = cache.get(target.clone(), 4096, 4096, LookupFlags::default(), &device).await.unwrap();
        assert_eq!(target.index.get(4096), Some(4096));
        buf.unlock();
        cache.evict(&target, &buf);
        assert_eq!(target.index.get(4096), None);
    }

    #[test]
    fn bucket_index_is_deterministic_and_in_range() {
        for off in [0u64, 4096, 8192, 1 << 20] {
            let idx = bucket_index(3, off, 9, 256);
            assert!(idx < 256);
            assert_eq!(idx, bucket_index(3, off, 9, 256));
        }
    }
}
