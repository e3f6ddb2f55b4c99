//! Active Item List: an LSN-ordered list of dirty log items with a
//! generation counter for concurrent-mutation detection and a
//! `push_ail` pass that drives the log tail forward under reservation
//! pressure, following XFS's `xfs_trans_ail_*` family.
//!
//! XFS's intrusive forw/back pointers become a single `parking_lot`-
//! guarded `Vec` kept sorted by `(lsn, seq)`: `O(log n)` positioning via
//! binary search, `O(n)` shift on insert/delete, acceptable at the item
//! counts a single mount's AIL holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::common::Lsn;
use crate::log_item::{LogItem, LogItemRef, PushResult, TrylockResult};

#[derive(Debug, Default)]
pub struct AilStats {
    pub inserted: AtomicU64,
    pub deleted: AtomicU64,
    pub pushed: AtomicU64,
    pub pins_skipped: AtomicU64,
    pub locks_skipped: AtomicU64,
}

struct Entry {
    lsn: Lsn,
    seq: u64,
    item: LogItemRef,
}

pub struct Ail {
    entries: parking_lot::Mutex<Vec<Entry>>,
    generation: AtomicU64,
    next_seq: AtomicU64,
    stats: Arc<AilStats>,
    notify: tokio::sync::Notify,
}

impl Ail {
    pub fn new() -> Arc<Ail> {
        Arc::new(Ail {
            entries: parking_lot::Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            stats: Arc::new(AilStats::default()),
            notify: tokio::sync::Notify::new(),
        })
    }

    pub fn stats(&self) -> Arc<AilStats> {
        self.stats.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// `insert`: places `item` into the sorted list at `lsn`.
    pub fn insert(&self, item: LogItemRef, lsn: Lsn) {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        *item.ail_link().lsn.lock() = lsn;
        item.ail_link().seq.store(seq, Ordering::Release);
        item.ail_link().in_ail.store(true, Ordering::Release);

        let mut entries = self.entries.lock();
        let pos = entries.partition_point(|e| (e.lsn, e.seq) < (lsn, seq));
        entries.insert(pos, Entry { lsn, seq, item });
        drop(entries);

        self.stats.inserted.fetch_add(1, Ordering::Relaxed);
        self.bump_generation();
    }

    /// `update`: repositions an item already in the list.
    /// Monotonic rule: an update to an LSN less than or equal to the
    /// item's current LSN is a no-op (items never move backwards).
    pub fn update(&self, item: &LogItemRef, lsn: Lsn) {
        let current = item.ail_link().lsn();
        if lsn <= current {
            return;
        }
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| Arc::ptr_eq(&e.item, item)) {
            entries.remove(pos);
            let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
            *item.ail_link().lsn.lock() = lsn;
            item.ail_link().seq.store(seq, Ordering::Release);
            let new_pos = entries.partition_point(|e| (e.lsn, e.seq) < (lsn, seq));
            entries.insert(new_pos, Entry { lsn, seq, item: item.clone() });
        }
        drop(entries);
        self.bump_generation();
    }

    /// `delete`: removes an item once its backing state is stable.
    pub fn delete(&self, item: &LogItemRef) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !Arc::ptr_eq(&e.item, item));
        let removed = entries.len() != before;
        drop(entries);
        if removed {
            item.ail_link().in_ail.store(false, Ordering::Release);
            self.stats.deleted.fetch_add(1, Ordering::Relaxed);
            self.bump_generation();
        }
    }

    /// `min`: the item with the smallest LSN, if any.
    pub fn min(&self) -> Option<LogItemRef> {
        self.entries.lock().first().map(|e| e.item.clone())
    }

    /// `next`: the item immediately after `item` in LSN order.
    pub fn next(&self, item: &LogItemRef) -> Option<LogItemRef> {
        let entries = self.entries.lock();
        let pos = entries.iter().position(|e| Arc::ptr_eq(&e.item, item))?;
        entries.get(pos + 1).map(|e| e.item.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The log tail LSN: the minimum LSN of any item in the AIL, or
    /// `head_lsn` if the AIL is empty.
    pub fn tail_lsn(&self, head_lsn: Lsn) -> Lsn {
        self.entries.lock().first().map(|e| e.lsn).unwrap_or(head_lsn)
    }

    /// `push_ail`: walks the list ascending, pushing every item
    /// below `threshold_lsn`. Returns `true` if any item reported
    /// `PINNED`, telling the caller to force the log.
    pub fn push_ail(&self, threshold_lsn: Lsn) -> bool {
        let _span = tracing::debug_span!("ail_push", threshold = %threshold_lsn).entered();
        let snapshot: Vec<(Lsn, LogItemRef)> = {
            let entries = self.entries.lock();
            entries.iter().take_while(|e| e.lsn < threshold_lsn).map(|e| (e.lsn, e.item.clone())).collect()
        };
        let mut needs_force = false;
        for (_, item) in snapshot {
            match item.trylock() {
                TrylockResult::Success => {
                    if item.push() == PushResult::Success {
                        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                    }
                    item.unlock();
                }
                TrylockResult::Pinned => {
                    self.stats.pins_skipped.fetch_add(1, Ordering::Relaxed);
                    needs_force = true;
                }
                TrylockResult::Locked | TrylockResult::Flushing => {
                    self.stats.locks_skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        tracing::debug!(pushed = self.stats.pushed.load(Ordering::Relaxed), needs_force, "ail_push_done");
        needs_force
    }

    /// Blocks until the AIL's minimum LSN is at least `lsn`, or the AIL
    /// is empty ("transaction_commit(WAIT) suspends on the commit
    /// LSN").
    pub async fn wait_for_lsn(&self, lsn: Lsn) {
        loop {
            let satisfied = {
                let entries = self.entries.lock();
                entries.first().map(|e| e.lsn >= lsn).unwrap_or(true)
            };
            if satisfied {
                return;
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_item::inode_item::InodeLogItem;

    #[test]
    fn insert_then_min_yields_ascending_lsn_order() {
        let ail = Ail::new();
        let a: LogItemRef = InodeLogItem::new(1);
        let b: LogItemRef = InodeLogItem::new(2);
        let c: LogItemRef = InodeLogItem::new(3);
        ail.insert(c.clone(), Lsn::pack(1, 30));
        ail.insert(a.clone(), Lsn::pack(1, 10));
        ail.insert(b.clone(), Lsn::pack(1, 20));

        let min = ail.min().unwrap();
        assert!(Arc::ptr_eq(&min, &a));
        let next1 = ail.next(&min).unwrap();
        assert!(Arc::ptr_eq(&next1, &b));
        let next2 = ail.next(&next1).unwrap();
        assert!(Arc::ptr_eq(&next2, &c));
    }

    #[test]
    fn update_ignores_non_increasing_lsn() {
        let ail = Ail::new();
        let a: LogItemRef = InodeLogItem::new(1);
        ail.insert(a.clone(), Lsn::pack(1, 100));
        ail.update(&a, Lsn::pack(1, 50));
        assert_eq!(a.ail_link().lsn(), Lsn::pack(1, 100));
        ail.update(&a, Lsn::pack(1, 150));
        assert_eq!(a.ail_link().lsn(), Lsn::pack(1, 150));
    }

    #[test]
    fn delete_removes_item_and_tail_lsn_falls_back_to_head() {
        let ail = Ail::new();
        let a: LogItemRef = InodeLogItem::new(1);
        ail.insert(a.clone(), Lsn::pack(1, 10));
        assert_eq!(ail.tail_lsn(Lsn::pack(1, 999)), Lsn::pack(1, 10));
        ail.delete(&a);
        assert!(ail.is_empty());
        assert_eq!(ail.tail_lsn(Lsn::pack(1, 999)), Lsn::pack(1, 999));
    }

    #[test]
    fn push_ail_reports_pinned_items_need_force() {
        let ail = Ail::new();
        let a = InodeLogItem::new(1);
        a.pin();
        let item: LogItemRef = a;
        ail.insert(item, Lsn::pack(1, 10));
        let needs_force = ail.push_ail(Lsn::pack(1, 20));
        assert!(needs_force);
    }
}
