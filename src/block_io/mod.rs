//! Block I/O Port — submits reads/writes of an aggregated
//! buffer to a device, with a completion callback.
//!
//! The real device backend is an external collaborator; this module
//! supplies the trait plus a [`MemoryBlockDevice`] test double with
//! optional fault injection used to drive crash/recovery test scenarios.

mod memory;

pub use memory::MemoryBlockDevice;

use crate::common::BlockNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    #[error("device I/O failed")]
    DeviceFailure,
    #[error("request out of range of the device")]
    OutOfRange,
}

/// A single contiguous submission: device-relative block number, byte
/// length, and the in-memory data to write (or buffer to fill on read).
pub struct IoRequest<'a> {
    pub blkno: BlockNumber,
    pub data: &'a mut [u8],
    pub op: IoOp,
}

/// Submit read/write of an aggregated buffer to a device; completion
/// callback. Implementations may run the callback inline (as the memory
/// test device does) or dispatch it to a completion-worker pool.
pub trait BlockIoPort: Send + Sync {
    fn submit(&self, req: IoRequest<'_>) -> Result<(), IoError>;

    /// Prod the device's queue forward; used by `wait_unpin` and the
    /// flusher to avoid sitting on dispatched I/O.
    fn flush_queues(&self);

    /// Total addressable size of the device, in 512-byte sectors.
    fn sector_count(&self) -> u64;
}
