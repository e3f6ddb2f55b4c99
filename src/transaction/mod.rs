//! Transaction — the unit of atomicity over one or more log items,
//! following XFS's `xfs_trans_t` for the reservation/commit/cancel
//! protocol.
//!
//! XFS's per-transaction item list is a linked chain of fixed-size
//! chunks, each with its own free bitmap (`xfs_log_item_chunk_t`). Here
//! it collapses to a single `parking_lot`-guarded `Vec<LogItemRef>`:
//! transactions in this crate are short-lived and hold at most a few
//! dozen items, so the chunk/bitmap scheme's only real payoff (cheap
//! removal of one item from a long-lived list) doesn't apply.

pub mod error;

pub use error::{TransactionError, TransactionResult};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::ail::Ail;
use crate::buffer::BufferFlags;
use crate::common::{Lsn, TransactionId};
use crate::log::ticket::{LogClient, Ticket};
use crate::log::{transaction_header_bytes, ForceMode, LogEngine};
use crate::log_item::buf_item::{BufferLogItem, BLI_CANCEL, BLI_HOLD, BLI_STALE};
use crate::log_item::inode_item::InodeLogItem;
use crate::log_item::{IovecTable, LogItem, LogItemRef};

pub const T_DIRTY: u32 = 0x01;
pub const T_SB_DIRTY: u32 = 0x02;
pub const T_PERM_LOG_RES: u32 = 0x04;
pub const T_SYNC: u32 = 0x08;

/// One transaction type tag, used only as the on-disk transaction
/// header's `ty` field; the crate does not
/// interpret it beyond plumbing it through to the log record.
pub const TRANS_TYPE_GENERIC: u32 = 0;

struct TransactionFlags(AtomicU32);

impl TransactionFlags {
    fn new() -> Self {
        TransactionFlags(AtomicU32::new(0))
    }
    fn set(&self, mask: u32) {
        self.0.fetch_or(mask, Ordering::AcqRel);
    }
    fn contains(&self, mask: u32) -> bool {
        self.0.load(Ordering::Acquire) & mask == mask
    }
}

/// A single transaction. Not `Clone`: committing or
/// canceling consumes it, matching the original's "a transaction handle
/// is used exactly once" discipline.
pub struct Transaction {
    id: TransactionId,
    ty: u32,
    ticket: Arc<Ticket>,
    log: LogEngine,
    ail: Arc<Ail>,
    items: parking_lot::Mutex<Vec<LogItemRef>>,
    flags: TransactionFlags,
    finished: AtomicBool,
}

impl Transaction {
    /// `xfs_trans_alloc` + `xfs_trans_reserve`: reserves log space
    /// up front so a later `commit` cannot fail for lack of room.
    pub fn alloc(
        log: &LogEngine,
        ail: &Arc<Ail>,
        ty: u32,
        reservation: usize,
        permanent: bool,
    ) -> Result<Transaction, TransactionError> {
        let ticket = log.reserve(reservation, LogClient::Transaction, permanent)?;
        let id = log.next_tid();
        let flags = TransactionFlags::new();
        if permanent {
            flags.set(T_PERM_LOG_RES);
        }
        Ok(Transaction {
            id,
            ty,
            ticket,
            log: log.clone(),
            ail: ail.clone(),
            items: parking_lot::Mutex::new(Vec::new()),
            flags,
            finished: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(T_DIRTY)
    }

    /// Joins an item to the transaction. Returns `true` if this is the
    /// item's first join (not already a participant).
    fn add_item(&self, item: LogItemRef) -> bool {
        let mut items = self.items.lock();
        if items.iter().any(|existing| Arc::ptr_eq(existing, &item)) {
            false
        } else {
            items.push(item);
            true
        }
    }

    /// `xfs_trans_log_buf`: marks `[first, last]` dirty in the
    /// buffer's bitmap and joins it to the transaction if not already a
    /// participant. A first join takes the item's recursion/hold
    /// reference, matching `xfs_trans_log_buf`'s `xfs_buf_item_init` +
    /// hold dance for a buffer not yet attached to this transaction.
    pub fn log_buf(&self, item: &Arc<BufferLogItem>, first: usize, last: usize) {
        item.log_range(first, last);
        item.buffer().flags.set(BufferFlags::DONE);
        if self.add_item(item.clone()) {
            item.recur_incr();
            item.hold();
        }
        self.flags.set(T_DIRTY);
    }

    /// `xfs_trans_log_inode`: ORs `fieldmask` (always including
    /// the inode core) into the item's dirty field set.
    pub fn log_inode(&self, item: &Arc<InodeLogItem>, fieldmask: u32) {
        item.log_fields(fieldmask);
        self.add_item(item.clone());
        self.flags.set(T_DIRTY);
    }

    /// `xfs_trans_binval`: marks a buffer stale and cancels its
    /// dirty bitmap. The `CANCEL` flag carries through `format` so
    /// recovery can recognize and skip a canceled buffer's later writes
    ///.
    pub fn binval(&self, item: &Arc<BufferLogItem>) {
        item.set_flags(BLI_STALE | BLI_CANCEL);
        item.clear_dirty_bitmap();
        if self.add_item(item.clone()) {
            item.recur_incr();
            item.hold();
        }
        self.flags.set(T_DIRTY);
    }

    /// `xfs_trans_bhold`: keeps the buffer locked past `commit`,
    /// for callers chaining another transaction onto the same buffer.
    pub fn bhold(&self, item: &Arc<BufferLogItem>) {
        item.set_flags(BLI_HOLD);
    }

    /// `xfs_trans_ihold`: bumps the inode item's lock recursion
    /// count so a second transaction may join the same inode.
    pub fn ihold(&self, item: &Arc<InodeLogItem>) {
        item.ilock_incr();
    }

    /// `xfs_trans_brelse`: decrements the item's recursion count; if it
    /// is still held by an outer call, or the item is dirty or stale, the
    /// buffer stays attached to the transaction. Otherwise drops the
    /// item from the transaction's list, clears HOLD, drops the item's
    /// own reference, and unlocks the buffer.
    pub fn brelse(&self, item: &Arc<BufferLogItem>) {
        if item.recur_decr() > 0 {
            return;
        }
        if item.is_dirty() || item.flags() & BLI_STALE != 0 {
            return;
        }
        let target: LogItemRef = item.clone();
        self.items.lock().retain(|existing| !Arc::ptr_eq(existing, &target));
        item.clear_flags(BLI_HOLD);
        item.unhold();
        LogItem::unlock(item.as_ref());
    }

    /// Assembles the transaction header plus every participating item's
    /// formatted iovecs into one flat region list for `LogEngine::write`.
    fn assemble_regions(&self, items: &[LogItemRef]) -> Vec<Vec<u8>> {
        let mut regions = Vec::new();
        regions.push(transaction_header_bytes(self.ty, self.id, items.len() as u32));
        for item in items {
            let mut table = IovecTable::default();
            item.format(&mut table);
            for iov in table.iovecs {
                regions.push(iov.data);
            }
        }
        regions
    }

    /// `xfs_trans_commit`:
    /// 1. pin every item so it cannot be written out before the commit
    ///    record reaches the log;
    /// 2. format the transaction header and every item's dirty state
    ///    into one record;
    /// 3. write it, consuming the reservation;
    /// 4. register a completion callback that repositions each item in
    ///    the AIL at the commit LSN and unpins it;
    /// 5. release the reservation;
    /// 6. if `sync`, force the log and wait for the AIL to reflect it.
    pub async fn commit(self, sync: bool) -> Result<Lsn, TransactionError> {
        let items = {
            let items = self.items.lock();
            items.clone()
        };
        if items.is_empty() {
            self.finished.store(true, Ordering::Release);
            return Err(TransactionError::Empty);
        }

        for item in &items {
            item.pin();
        }

        let regions = self.assemble_regions(&items);
        let lsn = self.log.write(&self.ticket, &regions, true);

        let ail = self.ail.clone();
        let callback_items = items.clone();
        self.log.on_active_committed(Box::new(move || {
            for item in callback_items {
                let new_lsn = item.committed(lsn);
                if item.ail_link().is_in_ail() {
                    ail.update(&item, new_lsn);
                } else {
                    ail.insert(item.clone(), new_lsn);
                }
                item.unpin(false);
                item.unlock();
                let _ = item.push();
            }
        }));

        self.log.done(&self.ticket, !self.flags.contains(T_PERM_LOG_RES));
        self.finished.store(true, Ordering::Release);

        if sync || self.flags.contains(T_SYNC) {
            self.log.force(ForceMode::Sync).await;
            self.ail.wait_for_lsn(lsn).await;
        }
        Ok(lsn)
    }

    /// `xfs_trans_cancel`: aborts every participating item
    /// (unpinning it and dropping its dirty state) and returns the
    /// reservation without writing a record.
    pub fn cancel(self) {
        let items = self.items.lock().clone();
        for item in &items {
            item.abort();
        }
        self.log.done(&self.ticket, true);
        self.finished.store(true, Ordering::Release);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        debug_assert!(
            self.finished.load(Ordering::Acquire),
            "transaction dropped without commit() or cancel()"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ail::Ail;
    use crate::block_io::MemoryBlockDevice;
    use crate::buffer::{AlignmentPolicy, DelwriFlusher, DeviceTarget, FlusherConfig};
    use crate::log_item::buf_item::BufferLogItem;
    use crate::page_store::{MemoryPageStore, PAGE_SIZE};

    fn setup() -> (LogEngine, Arc<Ail>, Arc<BufferLogItem>) {
        let device = Arc::new(MemoryBlockDevice::new(4096));
        let ail = Ail::new();
        let log = LogEngine::new(device, ail.clone(), 0, 2048, 4, 8192);
        let target = Arc::new(DeviceTarget::new(0, Arc::new(MemoryPageStore::new()), AlignmentPolicy::Any));
        let buf = crate::buffer::Buffer::new(target, 0, PAGE_SIZE, PAGE_SIZE);
        let flusher = Arc::new(DelwriFlusher::new(FlusherConfig::default()));
        let item = BufferLogItem::new(buf, flusher, ail.clone());
        (log, ail, item)
    }

    #[tokio::test]
    async fn commit_inserts_item_into_ail_at_commit_lsn() {
        let (log, ail, item) = setup();
        let txn = Transaction::alloc(&log, &ail, TRANS_TYPE_GENERIC, 256, false).unwrap();
        txn.log_buf(&item, 0, 63);
        let item_ref: LogItemRef = item.clone();
        let committed_lsn = txn.commit(true).await.unwrap();
        assert!(item_ref.ail_link().is_in_ail());
        assert_eq!(item_ref.ail_link().lsn(), committed_lsn);
    }

    #[test]
    fn cancel_aborts_items_without_writing_a_record() {
        let (log, ail, item) = setup();
        let txn = Transaction::alloc(&log, &ail, TRANS_TYPE_GENERIC, 256, false).unwrap();
        item.pin();
        txn.log_buf(&item, 0, 63);
        txn.cancel();
        assert_eq!(item.buffer().pin_count(), 0);
    }

    #[tokio::test]
    async fn empty_commit_is_rejected() {
        let (log, ail, _item) = setup();
        let txn = Transaction::alloc(&log, &ail, TRANS_TYPE_GENERIC, 256, false).unwrap();
        let result = txn.commit(false).await;
        assert!(matches!(result, Err(TransactionError::Empty)));
    }
}
