//! In-memory [`PageStore`] used by every test in this crate (and by the
//! `MemoryBlockDevice` in `block_io`, which layers directly on it).
//!
//! Backed directly by `dashmap` rather than a hand-rolled lock-striped
//! map: this is a port/test boundary, not the hot path worth
//! hand-building a concurrent map for.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{AddressSpaceId, GfpHint, PageHandle, PageIndex, PageStore, PageStoreError, PAGE_SIZE};

struct PageEntry {
    data: Mutex<Vec<u8>>,
    uptodate: std::sync::atomic::AtomicBool,
}

pub struct MemoryPageStore {
    pages: DashMap<(AddressSpaceId, PageIndex), Arc<PageEntry>>,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        MemoryPageStore { pages: DashMap::new() }
    }

    fn entry(&self, aspace: AddressSpaceId, index: PageIndex) -> Arc<PageEntry> {
        self.pages
            .entry((aspace, index))
            .or_insert_with(|| {
                Arc::new(PageEntry {
                    data: Mutex::new(vec![0u8; PAGE_SIZE]),
                    uptodate: std::sync::atomic::AtomicBool::new(false),
                })
            })
            .clone()
    }
}

impl Default for MemoryPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for MemoryPageStore {
    fn find_or_create_page(
        &self,
        aspace: AddressSpaceId,
        index: PageIndex,
        _gfp: GfpHint,
    ) -> Result<PageHandle, PageStoreError> {
        self.entry(aspace, index);
        Ok(PageHandle { aspace, index })
    }

    fn release_page(&self, _page: &PageHandle) {}

    // Page-level locking is a detail of the host page cache (an external
    // collaborator; `read`/`write` already serialize through
    // the per-page data mutex, so these are no-ops for the test double.
    fn lock_page(&self, _page: &PageHandle) {}

    fn unlock_page(&self, _page: &PageHandle) {}

    fn mark_accessed(&self, _page: &PageHandle) {}

    fn read(&self, page: &PageHandle, offset: usize, out: &mut [u8]) {
        let entry = self.entry(page.aspace, page.index);
        let data = entry.data.lock();
        out.copy_from_slice(&data[offset..offset + out.len()]);
    }

    fn write(&self, page: &PageHandle, offset: usize, data: &[u8]) {
        let entry = self.entry(page.aspace, page.index);
        let mut buf = entry.data.lock();
        buf[offset..offset + data.len()].copy_from_slice(data);
        entry.uptodate.store(true, std::sync::atomic::Ordering::Release);
    }

    fn is_uptodate(&self, page: &PageHandle) -> bool {
        let entry = self.entry(page.aspace, page.index);
        entry.uptodate.load(std::sync::atomic::Ordering::Acquire)
    }

    fn mark_uptodate(&self, page: &PageHandle) {
        let entry = self.entry(page.aspace, page.index);
        entry.uptodate.store(true, std::sync::atomic::Ordering::Release);
    }
}
