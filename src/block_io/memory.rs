//! In-memory block device with optional fault injection, used to drive
//! the crash/recovery scenarios in without a real disk.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{BlockIoPort, IoError, IoOp, IoRequest};
use crate::common::SECTOR_SIZE;

pub struct MemoryBlockDevice {
    sectors: RwLock<Vec<u8>>,
    writes_issued: AtomicU64,
    /// If set, the Nth write submitted fails with `DeviceFailure` instead
    /// of being applied (0 = disabled).
    fail_after_n_writes: AtomicU64,
    /// If set, the Nth write submitted only applies its leading half,
    /// leaving the trailing sectors with whatever was there before —
    /// simulating a power failure partway through a multi-sector
    /// submission (0 = disabled).
    torn_write_at: AtomicU64,
}

impl MemoryBlockDevice {
    pub fn new(sector_count: u64) -> Self {
        MemoryBlockDevice {
            sectors: RwLock::new(vec![0u8; sector_count as usize * SECTOR_SIZE]),
            writes_issued: AtomicU64::new(0),
            fail_after_n_writes: AtomicU64::new(0),
            torn_write_at: AtomicU64::new(0),
        }
    }

    /// Causes the `n`th subsequent write submission to fail, simulating a
    /// device error mid-stream (used by crash/recovery tests).
    pub fn fail_after_n_writes(&self, n: u64) {
        self.fail_after_n_writes.store(n, Ordering::SeqCst);
    }

    /// Causes the `n`th subsequent write submission to land only its
    /// first half, simulating a torn write for the recovery scenario
    /// that stops replay at the first sector whose cycle marker doesn't
    /// match.
    pub fn torn_write_at(&self, n: u64) {
        self.torn_write_at.store(n, Ordering::SeqCst);
    }

    /// Reads raw bytes for test assertions, bypassing the port.
    pub fn read_raw(&self, byte_offset: u64, len: usize) -> Vec<u8> {
        let sectors = self.sectors.read();
        sectors[byte_offset as usize..byte_offset as usize + len].to_vec()
    }

    /// Writes raw bytes for test setup, bypassing the port.
    pub fn write_raw(&self, byte_offset: u64, data: &[u8]) {
        let mut sectors = self.sectors.write();
        sectors[byte_offset as usize..byte_offset as usize + data.len()].copy_from_slice(data);
    }
}

impl BlockIoPort for MemoryBlockDevice {
    fn submit(&self, req: IoRequest<'_>) -> Result<(), IoError> {
        let byte_offset = req.blkno as usize * SECTOR_SIZE;
        let mut sectors = self.sectors.write();
        if byte_offset + req.data.len() > sectors.len() {
            return Err(IoError::OutOfRange);
        }
        match req.op {
            IoOp::Read => {
                req.data.copy_from_slice(&sectors[byte_offset..byte_offset + req.data.len()]);
            }
            IoOp::Write => {
                let n = self.writes_issued.fetch_add(1, Ordering::SeqCst) + 1;
                let fail_at = self.fail_after_n_writes.load(Ordering::SeqCst);
                if fail_at != 0 && n >= fail_at {
                    return Err(IoError::DeviceFailure);
                }
                let torn_at = self.torn_write_at.load(Ordering::SeqCst);
                if torn_at != 0 && n == torn_at && req.data.len() > SECTOR_SIZE {
                    let sectors_in_req = req.data.len() / SECTOR_SIZE;
                    let half = (sectors_in_req / 2).max(1) * SECTOR_SIZE;
                    sectors[byte_offset..byte_offset + half].copy_from_slice(&req.data[..half]);
                } else {
                    sectors[byte_offset..byte_offset + req.data.len()].copy_from_slice(req.data);
                }
            }
        }
        Ok(())
    }

    fn flush_queues(&self) {}

    fn sector_count(&self) -> u64 {
        self.sectors.read().len() as u64 / SECTOR_SIZE as u64
    }
}
