//! Buffer Log Item, modeled on XFS's `xfs_buf_log_item_t` and
//! `xfs_buf_log_format_t`.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use super::{AilLink, BUF_LOG_CHUNK, BUF_LOG_SHIFT, IovecTable, LogItem, LogItemRef, LogItemType, PushResult, TrylockResult};
use crate::ail::Ail;
use crate::buffer::{Buffer, BufferFlags, DelwriFlusher};
use crate::common::Lsn;

pub const BLI_HOLD: u32 = 0x01;
pub const BLI_DIRTY: u32 = 0x02;
pub const BLI_STALE: u32 = 0x04;
pub const BLI_LOGGED: u32 = 0x08;
pub const BLI_INODE_ALLOC_BUF: u32 = 0x10;
pub const BLI_CANCEL: u32 = 0x20;

fn bits_per_word() -> usize {
    u32::BITS as usize
}

/// In-core tracking for a dirty buffer: which 128-byte chunks are dirty,
/// recursion/reference counts, and the misc flags from `xfs_buf_item.h`.
pub struct BufferLogItem {
    buffer: Arc<Buffer>,
    flusher: Arc<DelwriFlusher>,
    ail: Arc<Ail>,
    dirty_map: parking_lot::Mutex<Vec<u32>>,
    map_size_bits: usize,
    recur: AtomicU32,
    refcount: AtomicI32,
    flags: AtomicU32,
    ail_link: AilLink,
}

impl BufferLogItem {
    /// Builds a buffer log item and wires its buffer's iodone callback to
    /// remove the item from the AIL once the write-back that logged it
    /// actually completes, mirroring `xfs_buf_iodone`. The callback holds
    /// only a `Weak` reference back to this item so the buffer's iodone
    /// slot can never keep the item (and its own `Arc<Buffer>`) alive in a
    /// cycle.
    pub fn new(buffer: Arc<Buffer>, flusher: Arc<DelwriFlusher>, ail: Arc<Ail>) -> Arc<BufferLogItem> {
        let chunk_count = (buffer.length + BUF_LOG_CHUNK - 1) / BUF_LOG_CHUNK;
        let word_count = (chunk_count + bits_per_word() - 1) / bits_per_word();
        let item = Arc::new(BufferLogItem {
            buffer: buffer.clone(),
            flusher,
            ail,
            dirty_map: parking_lot::Mutex::new(vec![0u32; word_count.max(1)]),
            map_size_bits: chunk_count,
            recur: AtomicU32::new(0),
            refcount: AtomicI32::new(0),
            flags: AtomicU32::new(0),
            ail_link: AilLink::new(),
        });

        let weak = Arc::downgrade(&item);
        buffer.set_iodone(Box::new(move |buf: &Buffer| {
            let is_writeback_completion = buf.flags.contains(BufferFlags::WRITE) && !buf.flags.contains(BufferFlags::DELWRI);
            if buf.has_error() || !is_writeback_completion {
                return;
            }
            if let Some(item) = weak.upgrade() {
                if item.ail_link.is_in_ail() {
                    let item_ref: LogItemRef = item.clone();
                    item.ail.delete(&item_ref);
                }
                item.clear_dirty_bitmap();
                item.clear_flags(BLI_DIRTY | BLI_LOGGED);
            }
        }));
        item
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn set_flags(&self, mask: u32) {
        self.flags.fetch_or(mask, Ordering::AcqRel);
    }

    pub fn clear_flags(&self, mask: u32) {
        self.flags.fetch_and(!mask, Ordering::AcqRel);
    }

    pub fn is_dirty(&self) -> bool {
        self.flags() & BLI_DIRTY != 0
    }

    pub fn hold(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the post-decrement refcount.
    pub fn unhold(&self) -> i32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn recur_incr(&self) -> u32 {
        self.recur.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn recur_decr(&self) -> u32 {
        self.recur.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    /// Marks every chunk intersecting `[first..=last]` dirty.
    pub fn log_range(&self, first: usize, last: usize) {
        let first_bit = first >> BUF_LOG_SHIFT;
        let last_bit = last >> BUF_LOG_SHIFT;
        let mut map = self.dirty_map.lock();
        for bit in first_bit..=last_bit.min(self.map_size_bits.saturating_sub(1)) {
            map[bit / bits_per_word()] |= 1 << (bit % bits_per_word());
        }
        drop(map);
        self.set_flags(BLI_DIRTY);
    }

    /// Clears the dirty bitmap entirely (used by `binval`).
    pub fn clear_dirty_bitmap(&self) {
        let mut map = self.dirty_map.lock();
        map.iter_mut().for_each(|w| *w = 0);
    }

    fn dirty_bit_ranges(&self) -> Vec<(usize, usize)> {
        let map = self.dirty_map.lock();
        let mut ranges = Vec::new();
        let mut bit = 0;
        while bit < self.map_size_bits {
            let set = (map[bit / bits_per_word()] >> (bit % bits_per_word())) & 1 != 0;
            if set {
                let start = bit;
                while bit < self.map_size_bits && (map[bit / bits_per_word()] >> (bit % bits_per_word())) & 1 != 0 {
                    bit += 1;
                }
                ranges.push((start, bit - 1));
            } else {
                bit += 1;
            }
        }
        ranges
    }

    pub fn map_size_words(&self) -> usize {
        self.dirty_map.lock().len()
    }
}

impl LogItem for BufferLogItem {
    fn item_type(&self) -> LogItemType {
        LogItemType::Buffer
    }

    fn size(&self) -> usize {
        1 + self.dirty_bit_ranges().len()
    }

    fn format(&self, iovs: &mut IovecTable) {
        let ranges = self.dirty_bit_ranges();
        let mut header = Vec::with_capacity(16 + self.map_size_words() * 4);
        header.extend_from_slice(&1u16.to_le_bytes()); // blf_type: buffer item
        header.extend_from_slice(&(16u16 + (self.map_size_words() as u16) * 4).to_le_bytes());
        header.extend_from_slice(&(self.buffer.blkno as i32).to_le_bytes());
        header.extend_from_slice(&(self.flags() as u16).to_le_bytes());
        let blocks = ((self.buffer.length + self.buffer.target.sector_size - 1) / self.buffer.target.sector_size) as u16;
        header.extend_from_slice(&blocks.to_le_bytes());
        header.extend_from_slice(&(self.map_size_words() as u32).to_le_bytes());
        for word in self.dirty_map.lock().iter() {
            header.extend_from_slice(&word.to_le_bytes());
        }
        iovs.push(header);

        for (start_bit, end_bit) in ranges {
            let first_byte = start_bit * BUF_LOG_CHUNK;
            let last_byte = ((end_bit + 1) * BUF_LOG_CHUNK).min(self.buffer.length);
            let mut region = vec![0u8; last_byte - first_byte];
            self.buffer.iomove(first_byte, crate::buffer::object::IoMoveOp::Read(&mut region));
            iovs.push(region);
        }
    }

    fn pin(&self) {
        self.buffer.pin();
    }

    fn unpin(&self, _remove: bool) {
        self.buffer.unpin();
    }

    fn trylock(&self) -> TrylockResult {
        if self.buffer.pin_count() > 0 {
            return TrylockResult::Pinned;
        }
        if self.buffer.trylock() {
            TrylockResult::Success
        } else {
            TrylockResult::Locked
        }
    }

    fn unlock(&self) {
        if self.flags() & BLI_HOLD == 0 && self.buffer.is_locked() {
            self.buffer.unlock();
        }
    }

    fn committed(&self, lsn: Lsn) -> Lsn {
        self.set_flags(BLI_LOGGED);
        *self.ail_link.lsn.lock() = lsn;
        lsn
    }

    fn push(&self) -> PushResult {
        if self.buffer.pin_count() > 0 {
            return PushResult::Pinned;
        }
        if !self.buffer.trylock() {
            return PushResult::Locked;
        }
        self.flusher.queue(self.buffer.clone());
        self.buffer.unlock();
        PushResult::Success
    }

    fn abort(&self) {
        if self.buffer.pin_count() > 0 {
            self.buffer.unpin();
        }
        self.clear_dirty_bitmap();
        self.clear_flags(BLI_DIRTY);
    }

    fn ail_link(&self) -> &AilLink {
        &self.ail_link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AlignmentPolicy, DeviceTarget, FlusherConfig};
    use crate::page_store::{MemoryPageStore, PAGE_SIZE};

    fn setup() -> (Arc<Buffer>, Arc<DelwriFlusher>, Arc<Ail>) {
        let target = Arc::new(DeviceTarget::new(0, Arc::new(MemoryPageStore::new()), AlignmentPolicy::Any));
        let buf = Buffer::new(target, 0, PAGE_SIZE, PAGE_SIZE);
        let flusher = Arc::new(DelwriFlusher::new(FlusherConfig::default()));
        (buf, flusher, Ail::new())
    }

    #[test]
    fn log_range_marks_intersecting_chunks() {
        let (buf, flusher, ail) = setup();
        let item = BufferLogItem::new(buf, flusher, ail);
        item.log_range(128, 255);
        let ranges = item.dirty_bit_ranges();
        assert_eq!(ranges, vec![(1, 1)]);
        assert!(item.is_dirty());
    }

    #[test]
    fn size_counts_header_plus_contiguous_regions() {
        let (buf, flusher, ail) = setup();
        let item = BufferLogItem::new(buf, flusher, ail);
        item.log_range(0, 127);
        item.log_range(384, 511);
        assert_eq!(item.size(), 3);
    }

    #[test]
    fn trylock_reports_pinned_before_locked() {
        let (buf, flusher, ail) = setup();
        let item = BufferLogItem::new(buf.clone(), flusher, ail);
        buf.pin();
        assert_eq!(item.trylock(), TrylockResult::Pinned);
        buf.unpin();
        assert_eq!(item.trylock(), TrylockResult::Success);
        assert_eq!(item.trylock(), TrylockResult::Locked);
    }
}
