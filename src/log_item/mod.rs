//! Log Item Framework — the polymorphic protocol every piece of
//! logged state implements, plus the `BufferLogItem`/`InodeLogItem`
//! variants the core ships.
//!
//! The field layouts (dirty bitmap chunking, recursion counts, field
//! masks) follow XFS's `xfs_buf_item.h`/`xfs_inode_item.h`. The op
//! vector is a small fixed vtable over transaction participants; here
//! it's expressed as a single trait with fixed methods rather than one
//! micro-trait per capability.

pub mod buf_item;
pub mod inode_item;

pub use buf_item::BufferLogItem;
pub use inode_item::InodeLogItem;

use std::sync::Arc;

use crate::common::Lsn;

/// 128-byte granularity of a buffer log item's dirty bitmap, ported from
/// `XFS_BLI_CHUNK`/`XFS_BLI_SHIFT`.
pub const BUF_LOG_CHUNK: usize = 128;
pub const BUF_LOG_SHIFT: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogItemType {
    Buffer,
    Inode,
}

/// One (address, length) region to be copied into the log record during
/// `format`.
#[derive(Debug, Clone)]
pub struct Iovec {
    pub data: Vec<u8>,
}

/// The per-item output of `format`: a variant-specific header iovec
/// followed by the logged data region iovecs.
#[derive(Debug, Default)]
pub struct IovecTable {
    pub iovecs: Vec<Iovec>,
}

impl IovecTable {
    pub fn push(&mut self, data: Vec<u8>) {
        self.iovecs.push(Iovec { data });
    }

    pub fn total_len(&self) -> usize {
        self.iovecs.iter().map(|v| v.data.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrylockResult {
    Success,
    Pinned,
    Locked,
    Flushing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// The item's backing state was written out (or push was a no-op
    /// because the item was already clean).
    Success,
    /// The item is pinned; the caller should force the log.
    Pinned,
    /// The item's lock could not be acquired without sleeping.
    Locked,
}

/// Intrusive AIL link. Lives embedded in each concrete item rather than inherited,
/// per "duck-typing to trait" / "pointer graphs to arenas": the AIL
/// itself owns the ordering; this link only records whether and where an
/// item currently sits in it.
#[derive(Debug, Default)]
pub struct AilLink {
    pub in_ail: std::sync::atomic::AtomicBool,
    pub lsn: parking_lot::Mutex<Lsn>,
    /// Insertion sequence, assigned by the AIL on `insert`; breaks ties
    /// between items sharing the same commit LSN so the sorted list has
    /// a total order.
    pub seq: std::sync::atomic::AtomicU64,
}

impl AilLink {
    pub fn new() -> Self {
        AilLink {
            in_ail: std::sync::atomic::AtomicBool::new(false),
            lsn: parking_lot::Mutex::new(Lsn::ZERO),
            seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn is_in_ail(&self) -> bool {
        self.in_ail.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn lsn(&self) -> Lsn {
        *self.lsn.lock()
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// The fixed op table every logged object implements.
pub trait LogItem: Send + Sync {
    fn item_type(&self) -> LogItemType;

    /// Number of log iovecs required to describe the item's current
    /// dirty state.
    fn size(&self) -> usize;

    /// Serializes the item's dirty portion into `iovs`, including its
    /// variant-specific format header.
    fn format(&self, iovs: &mut IovecTable);

    /// Prevents the underlying object from being written out.
    fn pin(&self);

    /// Reverses `pin`.
    fn unpin(&self, remove: bool);

    /// Tries to acquire the object's lock without sleeping.
    fn trylock(&self) -> TrylockResult;

    /// Releases the object's lock (deferred if `HOLD` is set on the item).
    fn unlock(&self);

    /// Called when the transaction holding the item commits; returns a
    /// new LSN to record for the item (most items just return `lsn`).
    fn committed(&self, lsn: Lsn) -> Lsn;

    /// Best-effort write-out of the underlying dirty state, invoked by
    /// the AIL pusher under tail pressure.
    fn push(&self) -> PushResult;

    /// Called when the owning transaction aborts.
    fn abort(&self);

    /// The item's AIL link.
    fn ail_link(&self) -> &AilLink;
}

pub type LogItemRef = Arc<dyn LogItem>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ail_link_starts_detached_at_lsn_zero() {
        let link = AilLink::new();
        assert!(!link.is_in_ail());
        assert_eq!(link.lsn(), Lsn::ZERO);
    }
}
