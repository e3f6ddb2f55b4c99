//! Page Store Port — the abstract byte-addressable paged store
//! the buffer cache assembles its backing pages from.
//!
//! This is an external collaborator boundary: the host page cache is
//! not re-implemented here, only the port the buffer cache needs and a
//! [`MemoryPageStore`] test double, behind a small trait-like surface
//! rather than inlining syscalls throughout the buffer manager.

mod memory;

pub use memory::MemoryPageStore;

use crate::common::DeviceId;

/// Identifies an address space (in XFS terms, an inode's page cache
/// mapping); here it is simply the device, since the crate has no inode
/// layer of its own.
pub type AddressSpaceId = DeviceId;

/// Index of a page within an address space, in page-size units.
pub type PageIndex = u64;

/// Hint passed to allocation requests; mirrors `gfp_t` in the original
/// without reproducing the full allocator-flag vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GfpHint {
    /// May sleep/retry to satisfy the request.
    Wait,
    /// Must not sleep; fail fast under pressure.
    NoWait,
}

/// A handle to one page owned by the page store. Opaque to callers beyond
/// the operations the port exposes.
#[derive(Debug, Clone)]
pub struct PageHandle {
    pub aspace: AddressSpaceId,
    pub index: PageIndex,
}

pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum PageStoreError {
    #[error("out of memory allocating page {aspace}:{index}")]
    OutOfMemory { aspace: AddressSpaceId, index: PageIndex },
}

/// Abstract byte-addressable paged store keyed by (device, index).
///
/// All operations are synchronous from the caller's point of view; the
/// buffer cache is responsible for deciding whether to block or retry.
pub trait PageStore: Send + Sync {
    fn find_or_create_page(
        &self,
        aspace: AddressSpaceId,
        index: PageIndex,
        gfp: GfpHint,
    ) -> Result<PageHandle, PageStoreError>;

    fn release_page(&self, page: &PageHandle);

    fn lock_page(&self, page: &PageHandle);

    fn unlock_page(&self, page: &PageHandle);

    fn mark_accessed(&self, page: &PageHandle);

    /// Reads `len` bytes starting at `offset` within the page into `out`.
    fn read(&self, page: &PageHandle, offset: usize, out: &mut [u8]);

    /// Writes `data` into the page starting at `offset`.
    fn write(&self, page: &PageHandle, offset: usize, data: &[u8]);

    fn is_uptodate(&self, page: &PageHandle) -> bool;

    fn mark_uptodate(&self, page: &PageHandle);
}
