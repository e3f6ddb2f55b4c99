//! Inode Log Item, modeled on XFS's `XFS_ILOG_*` field mask and
//! `ili_format` accounting.
//!
//! Unlike [`BufferLogItem`](super::BufferLogItem), an inode item is not
//! backed by a [`Buffer`] directly — it tracks dirty regions of an
//! opaque inode record (core, data fork, extents, b-tree root, dev,
//! uuid) that an external metadata client owns. The item only needs
//! enough state to serialize those regions and to participate in
//! pin/push.

use std::sync::atomic::{AtomicU32, Ordering};

use super::{AilLink, IovecTable, LogItem, LogItemType, PushResult, TrylockResult};
use crate::common::Lsn;

pub const ILOG_CORE: u32 = 0x001;
pub const ILOG_DDATA: u32 = 0x002;
pub const ILOG_DEXT: u32 = 0x004;
pub const ILOG_DBROOT: u32 = 0x008;
pub const ILOG_DEV: u32 = 0x010;
pub const ILOG_UUID: u32 = 0x020;
pub const ILOG_ADATA: u32 = 0x040;
pub const ILOG_AEXT: u32 = 0x080;
pub const ILOG_ABROOT: u32 = 0x100;

/// The in-core record of which inode regions are dirty and the
/// recursion counts over the inode's two locks.
pub struct InodeLogItem {
    pub inode_number: u64,
    fields: AtomicU32,
    ilock_recur: AtomicU32,
    iolock_recur: AtomicU32,
    pin_count: std::sync::atomic::AtomicI64,
    last_flush_lsn: parking_lot::Mutex<Lsn>,
    ail_link: AilLink,
}

impl InodeLogItem {
    pub fn new(inode_number: u64) -> std::sync::Arc<InodeLogItem> {
        std::sync::Arc::new(InodeLogItem {
            inode_number,
            fields: AtomicU32::new(0),
            ilock_recur: AtomicU32::new(0),
            iolock_recur: AtomicU32::new(0),
            pin_count: std::sync::atomic::AtomicI64::new(0),
            last_flush_lsn: parking_lot::Mutex::new(Lsn::ZERO),
            ail_link: AilLink::new(),
        })
    }

    pub fn fields(&self) -> u32 {
        self.fields.load(Ordering::Acquire)
    }

    /// `log_inode`: OR `fieldmask` into the dirty field set,
    /// always including `ILOG_CORE` (the original always logs the inode
    /// core alongside any other dirty region).
    pub fn log_fields(&self, fieldmask: u32) {
        self.fields.fetch_or(fieldmask | ILOG_CORE, Ordering::AcqRel);
    }

    pub fn clear_fields(&self) {
        self.fields.store(0, Ordering::Release);
    }

    pub fn ilock_incr(&self) -> u32 {
        self.ilock_recur.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn ilock_decr(&self) -> u32 {
        self.ilock_recur.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    pub fn last_flush_lsn(&self) -> Lsn {
        *self.last_flush_lsn.lock()
    }
}

impl LogItem for InodeLogItem {
    fn item_type(&self) -> LogItemType {
        LogItemType::Inode
    }

    fn size(&self) -> usize {
        let fields = self.fields();
        let mut count = 1; // core header
        for mask in [ILOG_DDATA, ILOG_DEXT, ILOG_DBROOT, ILOG_DEV, ILOG_UUID, ILOG_ADATA, ILOG_AEXT, ILOG_ABROOT] {
            if fields & mask != 0 {
                count += 1;
            }
        }
        count
    }

    fn format(&self, iovs: &mut IovecTable) {
        let fields = self.fields();
        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(&2u16.to_le_bytes()); // type: inode item
        header.extend_from_slice(&16u16.to_le_bytes());
        header.extend_from_slice(&self.inode_number.to_le_bytes());
        header.extend_from_slice(&fields.to_le_bytes());
        iovs.push(header);
        for mask in [ILOG_DDATA, ILOG_DEXT, ILOG_DBROOT, ILOG_DEV, ILOG_UUID, ILOG_ADATA, ILOG_AEXT, ILOG_ABROOT] {
            if fields & mask != 0 {
                // The opaque metadata client is responsible for supplying
                // the actual region bytes; the item only reserves the
                // iovec slot here.
                iovs.push(Vec::new());
            }
        }
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self, _remove: bool) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin on inode log item with zero pin count");
    }

    fn trylock(&self) -> TrylockResult {
        if self.pin_count.load(Ordering::Acquire) > 0 {
            return TrylockResult::Pinned;
        }
        TrylockResult::Success
    }

    fn unlock(&self) {}

    fn committed(&self, lsn: Lsn) -> Lsn {
        *self.last_flush_lsn.lock() = lsn;
        *self.ail_link.lsn.lock() = lsn;
        lsn
    }

    fn push(&self) -> PushResult {
        if self.pin_count.load(Ordering::Acquire) > 0 {
            return PushResult::Pinned;
        }
        PushResult::Success
    }

    fn abort(&self) {
        self.clear_fields();
    }

    fn ail_link(&self) -> &AilLink {
        &self.ail_link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_fields_always_includes_core() {
        let item = InodeLogItem::new(42);
        item.log_fields(ILOG_DDATA);
        assert_eq!(item.fields(), ILOG_DDATA | ILOG_CORE);
    }

    #[test]
    fn size_counts_core_plus_each_dirty_region() {
        let item = InodeLogItem::new(42);
        item.log_fields(ILOG_DDATA | ILOG_DEXT);
        assert_eq!(item.size(), 3);
    }
}
