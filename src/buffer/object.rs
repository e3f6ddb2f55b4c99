//! The Buffer Object.

use parking_lot::Mutex as PlMutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{AlignmentPolicy, BufferError, DeviceTarget};
use crate::block_io::{BlockIoPort, IoError, IoOp, IoRequest};
use crate::common::{BlockNumber, ByteOffset};
use crate::page_store::{GfpHint, PageHandle, PAGE_SIZE};

/// The `(target, file-offset, length)` fingerprint used as the cache's
/// hash key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub device_id: u32,
    pub offset: ByteOffset,
    pub length: usize,
}

/// Bit flags over a [`Buffer`]. Represented as a raw `AtomicU32`
/// rather than a guard-scoped type because flags are read and mutated
/// independently from the buffer's exclusive lock (e.g. the hash bucket
/// spinlock flips `STALE` without taking the buffer semaphore).
pub struct BufferFlags(AtomicU32);

impl BufferFlags {
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const ASYNC: u32 = 1 << 2;
    pub const PARTIAL: u32 = 1 << 3;
    pub const DELWRI: u32 = 1 << 4;
    pub const STALE: u32 = 1 << 5;
    pub const MAPPED: u32 = 1 << 6;
    pub const LOCKABLE: u32 = 1 << 7;
    pub const HOLD: u32 = 1 << 8;
    pub const DONE: u32 = 1 << 9;
    pub const TRYLOCK: u32 = 1 << 10;

    fn new(bits: u32) -> Self {
        BufferFlags(AtomicU32::new(bits))
    }

    pub fn bits(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn contains(&self, mask: u32) -> bool {
        self.bits() & mask == mask
    }

    pub fn set(&self, mask: u32) {
        self.0.fetch_or(mask, Ordering::AcqRel);
    }

    pub fn clear(&self, mask: u32) {
        self.0.fetch_and(!mask, Ordering::AcqRel);
    }

    /// A buffer marked stale clears all flags except the mapping/lockable
    /// bits.
    pub fn mark_stale(&self) {
        let keep = self.bits() & (Self::MAPPED | Self::LOCKABLE);
        self.0.store(keep | Self::STALE, Ordering::Release);
    }
}

/// A binary semaphore with manual lock/unlock (not RAII-scoped), since the
/// buffer's owner holds it across calls spanning a transaction, not a
/// single borrow.
struct BinarySemaphore(AtomicBool);

impl BinarySemaphore {
    fn new() -> Self {
        BinarySemaphore(AtomicBool::new(false))
    }

    fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        let was_held = self.0.swap(false, Ordering::Release);
        debug_assert!(was_held, "release on a buffer semaphore that was not held");
    }

    fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// An aggregated, multi-page buffer covering a contiguous byte range of a
/// [`DeviceTarget`].
pub struct Buffer {
    pub target: Arc<DeviceTarget>,
    pub offset: ByteOffset,
    pub length: usize,
    pub desired_count: usize,
    pub blkno: BlockNumber,
    pub flags: BufferFlags,

    pages: PlMutex<Vec<PageHandle>>,
    /// Caller-supplied memory attached via `associate_memory`/`get_no_daddr`,
    /// used instead of page-store-backed pages when present.
    standalone: PlMutex<Option<Vec<u8>>>,

    ref_count: AtomicI64,
    pin_count: AtomicI64,
    pin_waiters: Notify,

    /// Binary semaphore enforcing exclusive ownership while `LOCKABLE` is
    /// set. Manual lock/unlock discipline, matching
    /// the original's semaphore: the owner may hold it across multiple
    /// calls spanning a transaction's lifetime, not just one scope.
    sema: BinarySemaphore,

    error: AtomicI32,
    outstanding_io: AtomicI64,

    iodone: PlMutex<Option<Box<dyn Fn(&Buffer) + Send + Sync>>>,
}

impl Buffer {
    pub fn new(target: Arc<DeviceTarget>, offset: ByteOffset, length: usize, desired_count: usize) -> Arc<Buffer> {
        let blkno = target.blkno_of(offset);
        Arc::new(Buffer {
            target,
            offset,
            length,
            desired_count,
            blkno,
            flags: BufferFlags::new(BufferFlags::LOCKABLE),
            pages: PlMutex::new(Vec::new()),
            standalone: PlMutex::new(None),
            ref_count: AtomicI64::new(0),
            pin_count: AtomicI64::new(0),
            pin_waiters: Notify::new(),
            sema: BinarySemaphore::new(),
            error: AtomicI32::new(0),
            outstanding_io: AtomicI64::new(0),
            iodone: PlMutex::new(None),
        })
    }

    pub fn key(&self) -> BufferKey {
        BufferKey { device_id: self.target.device_id, offset: self.offset, length: self.length }
    }

    // ---------------------------------------------------------------
    // Reference counting
    // ---------------------------------------------------------------

    pub fn hold(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a reference. Returns `true` if this was the last
    /// reference and the buffer is not pinned to a delwri queue, meaning
    /// the caller (the cache) should free it.
    pub fn rele(&self) -> bool {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "rele on buffer with zero references");
        prev == 1 && !self.flags.contains(BufferFlags::DELWRI)
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------
    // Pinning
    // ---------------------------------------------------------------

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin on buffer with zero pin count");
        if prev == 1 {
            self.pin_waiters.notify_waiters();
        }
    }

    pub fn pin_count(&self) -> i64 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Blocks until the pin count is zero. While waiting, periodically
    /// prods the device's queues forward to avoid starvation.
    pub async fn wait_unpin(&self, block_io: &dyn BlockIoPort) {
        while self.pin_count() > 0 {
            block_io.flush_queues();
            let notified = self.pin_waiters.notified();
            if self.pin_count() == 0 {
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
            }
        }
    }

    // ---------------------------------------------------------------
    // Exclusive ownership (binary semaphore)
    // ---------------------------------------------------------------

    /// Acquires the buffer's semaphore without sleeping. Returns `false`
    /// if it is already held.
    pub fn trylock(&self) -> bool {
        self.sema.try_acquire()
    }

    /// Acquires the buffer's semaphore, sleeping if necessary.
    pub async fn lock(&self) {
        while !self.sema.try_acquire() {
            tokio::task::yield_now().await;
        }
    }

    /// Releases the buffer's semaphore. Caller must hold it.
    pub fn unlock(&self) {
        self.sema.release();
    }

    /// Peeks at whether the semaphore is currently held, without
    /// acquiring or releasing it.
    pub fn is_locked(&self) -> bool {
        self.sema.is_held()
    }

    // ---------------------------------------------------------------
    // Backing memory
    // ---------------------------------------------------------------

    pub fn attach_pages(&self, pages: Vec<PageHandle>) {
        *self.pages.lock() = pages;
    }

    pub fn pages(&self) -> Vec<PageHandle> {
        self.pages.lock().clone()
    }

    /// `associate_memory`: attach caller-supplied memory as the
    /// backing store and mark the buffer mapped.
    pub fn associate_memory(&self, data: Vec<u8>) {
        *self.standalone.lock() = Some(data);
        self.flags.set(BufferFlags::MAPPED);
    }

    pub fn has_standalone_memory(&self) -> bool {
        self.standalone.lock().is_some()
    }

    // ---------------------------------------------------------------
    // iomove: READ / WRITE / ZERO over backing pages, page by page.
    // ---------------------------------------------------------------

    pub fn iomove(&self, offset: usize, data: IoMoveOp<'_>) {
        if let Some(standalone) = self.standalone.lock().as_mut() {
            apply_iomove_to_slice(standalone, offset, data);
            return;
        }
        let pages = self.pages.lock();
        let mut remaining_offset = offset;
        let mut data = data;
        for page in pages.iter() {
            let page_start = remaining_offset;
            if page_start >= PAGE_SIZE {
                remaining_offset -= PAGE_SIZE;
                continue;
            }
            let avail = PAGE_SIZE - page_start;
            let take = data.len().min(avail);
            if take == 0 {
                break;
            }
            match &mut data {
                IoMoveOp::Read(out) => {
                    let (head, tail) = std::mem::take(out).split_at_mut(take);
                    self.target.page_store.read(page, page_start, head);
                    *out = tail;
                }
                IoMoveOp::Write(input) => {
                    let (head, tail) = std::mem::take(input).split_at(take);
                    self.target.page_store.write(page, page_start, head);
                    *input = tail;
                }
                IoMoveOp::Zero(remaining) => {
                    let zeros = vec![0u8; take];
                    self.target.page_store.write(page, page_start, &zeros);
                    *remaining -= take;
                }
            }
            remaining_offset = 0;
            if data.len() == 0 {
                break;
            }
        }
    }

    // ---------------------------------------------------------------
    // I/O submission
    // ---------------------------------------------------------------

    pub fn latch_error(&self, err: bool) {
        self.error.store(if err { 1 } else { 0 }, Ordering::Release);
    }

    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::Acquire) != 0
    }

    pub fn set_iodone(&self, cb: Box<dyn Fn(&Buffer) + Send + Sync>) {
        *self.iodone.lock() = Some(cb);
    }

    fn run_iodone(&self) {
        if let Some(cb) = self.iodone.lock().as_ref() {
            cb(self);
        }
    }

    /// Submits I/O synchronously, assuming the buffer is well-formed.
    /// Breaks the request up per the target's alignment policy and waits for completion of every submission.
    pub fn iorequest(&self, block_io: &dyn BlockIoPort, op: IoOp) -> Result<(), BufferError> {
        let submissions = self.plan_submissions();
        self.outstanding_io.fetch_add(submissions.len() as i64, Ordering::AcqRel);

        let mut failed = false;
        for (page_index, blkno, len) in submissions {
            let mut buf = vec![0u8; len];
            if matches!(op, IoOp::Write) {
                self.iomove_into(page_index, &mut buf);
            }
            let result = block_io.submit(IoRequest { blkno, data: &mut buf, op });
            match result {
                Ok(()) => {
                    if matches!(op, IoOp::Read) {
                        self.iomove_from(page_index, &buf);
                    }
                }
                Err(IoError::DeviceFailure) | Err(IoError::OutOfRange) => failed = true,
            }
            if self.outstanding_io.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.latch_error(failed);
                self.run_iodone();
            }
        }
        if failed {
            Err(BufferError::IoError)
        } else {
            Ok(())
        }
    }

    fn iomove_into(&self, page_index: usize, out: &mut [u8]) {
        self.iomove(page_index * PAGE_SIZE, IoMoveOp::Read(out));
    }

    fn iomove_from(&self, page_index: usize, data: &[u8]) {
        self.iomove(page_index * PAGE_SIZE, IoMoveOp::Write(data));
    }

    /// Computes the per-submission (page_index, blkno, len) plan per the
    /// I/O breakup algorithm, honoring the target's alignment
    /// policy. Block-oriented devices here always submit whole pages
    /// since the crate has no smaller-than-page filesystem block concept
    /// of its own (that lives with the opaque metadata clients above it).
    fn plan_submissions(&self) -> Vec<(usize, BlockNumber, usize)> {
        let page_count = (self.length + PAGE_SIZE - 1) / PAGE_SIZE;
        let mut out = Vec::with_capacity(page_count);
        let sector_shift = self.target.sector_shift;
        for i in 0..page_count {
            let page_offset = self.offset + (i * PAGE_SIZE) as u64;
            let blkno = page_offset >> sector_shift;
            let remaining = self.length - i * PAGE_SIZE;
            let len = remaining.min(PAGE_SIZE);
            match self.target.alignment {
                AlignmentPolicy::Any => out.push((i, blkno, len)),
                AlignmentPolicy::AlignedOnly | AlignmentPolicy::SectorOnly => {
                    let sector_size = self.target.sector_size;
                    let mut done = 0;
                    while done < len {
                        let chunk = sector_size.min(len - done);
                        out.push((i, blkno + (done / sector_size) as u64, chunk));
                        done += chunk;
                    }
                }
            }
        }
        out
    }

    pub async fn iowait(&self) -> Result<(), BufferError> {
        while self.outstanding_io.load(Ordering::Acquire) > 0 {
            tokio::task::yield_now().await;
        }
        if self.has_error() {
            Err(BufferError::IoError)
        } else {
            Ok(())
        }
    }
}

/// Selects READ/WRITE/ZERO for [`Buffer::iomove`].
pub enum IoMoveOp<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
    Zero(usize),
}

impl<'a> IoMoveOp<'a> {
    fn len(&self) -> usize {
        match self {
            IoMoveOp::Read(b) => b.len(),
            IoMoveOp::Write(b) => b.len(),
            IoMoveOp::Zero(n) => *n,
        }
    }
}

fn apply_iomove_to_slice(buf: &mut [u8], offset: usize, data: IoMoveOp<'_>) {
    match data {
        IoMoveOp::Read(out) => out.copy_from_slice(&buf[offset..offset + out.len()]),
        IoMoveOp::Write(input) => buf[offset..offset + input.len()].copy_from_slice(input),
        IoMoveOp::Zero(len) => buf[offset..offset + len].fill(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::MemoryBlockDevice;
    use crate::page_store::MemoryPageStore;

    fn test_target() -> Arc<DeviceTarget> {
        Arc::new(DeviceTarget::new(0, Arc::new(MemoryPageStore::new()), AlignmentPolicy::Any))
    }

    #[test]
    fn pin_unpin_balances_to_zero() {
        let target = test_target();
        let buf = Buffer::new(target, 0, PAGE_SIZE, PAGE_SIZE);
        buf.pin();
        buf.pin();
        assert_eq!(buf.pin_count(), 2);
        buf.unpin();
        buf.unpin();
        assert_eq!(buf.pin_count(), 0);
    }

    #[test]
    fn stale_clears_flags_except_mapping_and_lockable() {
        let target = test_target();
        let buf = Buffer::new(target, 0, PAGE_SIZE, PAGE_SIZE);
        buf.flags.set(BufferFlags::MAPPED | BufferFlags::DELWRI | BufferFlags::DONE);
        buf.flags.mark_stale();
        assert!(buf.flags.contains(BufferFlags::STALE));
        assert!(buf.flags.contains(BufferFlags::MAPPED));
        assert!(buf.flags.contains(BufferFlags::LOCKABLE));
        assert!(!buf.flags.contains(BufferFlags::DELWRI));
        assert!(!buf.flags.contains(BufferFlags::DONE));
    }

    #[test]
    fn trylock_then_unlock_round_trips() {
        let target = test_target();
        let buf = Buffer::new(target, 0, PAGE_SIZE, PAGE_SIZE);
        assert!(buf.trylock());
        assert!(!buf.trylock());
        buf.unlock();
        assert!(buf.trylock());
        buf.unlock();
    }

    #[tokio::test]
    async fn iorequest_round_trips_through_device() {
        let store = Arc::new(MemoryPageStore::new());
        let target = Arc::new(DeviceTarget::new(0, store.clone(), AlignmentPolicy::Any));
        let device = MemoryBlockDevice::new(64);
        let buf = Buffer::new(target.clone(), 0, PAGE_SIZE, PAGE_SIZE);
        let page = target.page_store.find_or_create_page(0, 0, GfpHint::Wait).unwrap();
        buf.attach_pages(vec![page]);
        buf.iomove(0, IoMoveOp::Write(&[7u8; PAGE_SIZE]));
        buf.iorequest(&device, IoOp::Write).unwrap();

        let buf2 = Buffer::new(target, 0, PAGE_SIZE, PAGE_SIZE);
        let page2 = buf2.target.page_store.find_or_create_page(0, 0, GfpHint::Wait).unwrap();
        buf2.attach_pages(vec![page2]);
        buf2.iorequest(&device, IoOp::Read).unwrap();
        let mut out = vec![0u8; PAGE_SIZE];
        buf2.iomove(0, IoMoveOp::Read(&mut out));
        assert_eq!(out, vec![7u8; PAGE_SIZE]);
    }
}
