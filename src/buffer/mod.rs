//! Page Buffer Cache — an aggregated buffer object layered atop the
//! [`PageStore`](crate::page_store::PageStore) port.
//!
//! Unlike a page-at-a-time LRU cache, this is an aggregated,
//! hash-indexed, pinnable buffer cache with a delayed-write flusher,
//! following XFS's `pagebuf` subsystem for the exact contract each
//! operation honors, with the pool/cache held behind `Arc`+`parking_lot`,
//! a config struct with `Default`, and `tracing` at state transitions.

pub mod flusher;
pub mod hash;
pub mod object;

pub use flusher::{CompletionPool, DelwriFlusher, FlusherConfig};
pub use hash::BufferCache;
pub use object::{Buffer, BufferFlags, BufferKey};

use std::sync::Arc;

use crate::common::{BlockNumber, ByteOffset, DeviceId, SECTOR_SHIFT, SECTOR_SIZE};
use crate::page_store::PageStore;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("out of memory allocating buffer")]
    OutOfMemory,
    #[error("device I/O failed")]
    IoError,
    #[error("operation would block")]
    WouldBlock,
    #[error("buffer not found in cache")]
    NotFound,
}

/// Governs how the I/O breakup algorithm splits a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AlignmentPolicy {
    /// No alignment constraint; submit the whole length in one request.
    Any,
    /// Per-sector unless the whole page is filesystem-block aligned.
    AlignedOnly,
    /// Always split into per-sector submissions.
    SectorOnly,
}

/// A handle identifying a block device plus sector size, alignment
/// policy, and a pointer to its page store.
pub struct DeviceTarget {
    pub device_id: DeviceId,
    pub sector_size: usize,
    pub sector_shift: u32,
    pub sector_mask: u64,
    pub alignment: AlignmentPolicy,
    pub page_store: Arc<dyn PageStore>,
    /// Index the target keeps over its own buffers via the generic AVL
    /// tree, keyed by the packed `(offset, length)` fingerprint; used
    /// only for diagnostics/iteration, not for the primary find-or-create
    /// path (that goes through the hash).
    pub index: crate::common::avl::AvlTree,
}

impl DeviceTarget {
    pub fn new(device_id: DeviceId, page_store: Arc<dyn PageStore>, alignment: AlignmentPolicy) -> Self {
        DeviceTarget {
            device_id,
            sector_size: SECTOR_SIZE,
            sector_shift: SECTOR_SHIFT,
            sector_mask: (SECTOR_SIZE as u64) - 1,
            alignment,
            page_store,
            index: crate::common::avl::AvlTree::new(),
        }
    }

    pub fn blkno_of(&self, offset: ByteOffset) -> BlockNumber {
        offset >> self.sector_shift
    }
}
