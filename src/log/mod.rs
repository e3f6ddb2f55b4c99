//! Log Record Engine — the in-core
//! log ring, reservation ticket protocol, record framing with
//! torn-write detection, and the iclog state machine.
//!
//! The protocol and on-disk field layout follow XFS's `xfs_log.c`/
//! `xfs_log_priv.h`; the Rust shape is an `Arc`-shared engine handle
//! around a ring of fixed-size in-core buffers, group-commit style
//! batching, and a CRC32C checksum over each record.

pub mod checksum;
pub mod format;
mod iclog;
pub mod ticket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::ail::Ail;
use crate::block_io::{BlockIoPort, IoOp, IoRequest};
use crate::buffer::CompletionPool;
use crate::common::{Lsn, SECTOR_SIZE};

use format::{LogOpHeader, LogRecordHeader, OpFlags, TransactionHeader, LOG_MAGIC, LOG_VERSION};
use iclog::{IclogSlot, IclogState};
use ticket::{LogClient, Ticket, TIC_PERM};

pub use ticket::Ticket as ReservationTicket;

pub const DEFAULT_ICLOG_COUNT: usize = 8;
pub const DEFAULT_ICLOG_CAPACITY: usize = 32 * 1024;

/// Conservative estimate of one record header's on-disk size, used by
/// `reserve`'s header-rounding formula. One
/// sector is always enough: `REC_HEADER_FIXED_LEN` plus the cycle array
/// for a `DEFAULT_ICLOG_CAPACITY` iclog is well under 512 bytes.
pub const RESERVATION_HEADER_BYTES: i64 = SECTOR_SIZE as i64;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log reservation exceeded available space")]
    LogSpace,
    #[error("corrupt log record: {0}")]
    CorruptLog(String),
    #[error("log version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("log I/O failed")]
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceMode {
    /// Mark the active iclog WANT_SYNC and return without waiting.
    Async,
    /// Mark the active iclog WANT_SYNC and block until it reaches DIRTY.
    Sync,
}

#[derive(Debug, Default)]
pub struct LogStats {
    pub reservations: AtomicU64,
    pub log_space_waits: AtomicU64,
    pub iclog_syncs: AtomicU64,
}

struct Inner {
    iclogs: Vec<IclogSlot>,
    active: usize,
    current_cycle: u64,
    current_block: u64,
    prev_block: u64,
    reservation_free: i64,
    next_tid: u64,
}

/// The in-core log ring plus reservation accounting. Cheap to clone
/// (`Arc`-backed) so every transaction and the flusher daemon can hold
/// their own handle to the same engine.
#[derive(Clone)]
pub struct LogEngine(Arc<Shared>);

struct Shared {
    inner: parking_lot::Mutex<Inner>,
    block_io: Arc<dyn BlockIoPort>,
    ail: Arc<Ail>,
    completion_pool: CompletionPool,
    completion_notify: tokio::sync::Notify,
    stats: Arc<LogStats>,
    log_start_block: u64,
    log_size_blocks: u64,
    iclog_capacity: usize,
}

fn client_id(client: LogClient) -> u8 {
    match client {
        LogClient::Transaction => 1,
        LogClient::Log => 2,
    }
}

impl LogEngine {
    pub fn new(
        block_io: Arc<dyn BlockIoPort>,
        ail: Arc<Ail>,
        log_start_block: u64,
        log_size_blocks: u64,
        iclog_count: usize,
        iclog_capacity: usize,
    ) -> LogEngine {
        let iclogs = (0..iclog_count.max(2)).map(|_| IclogSlot::new(iclog_capacity)).collect();
        let reservation_total = (log_size_blocks as i64) * SECTOR_SIZE as i64;
        LogEngine(Arc::new(Shared {
            inner: parking_lot::Mutex::new(Inner {
                iclogs,
                active: 0,
                current_cycle: 1,
                current_block: 0,
                prev_block: 0,
                reservation_free: reservation_total,
                next_tid: 1,
            }),
            block_io,
            ail,
            completion_pool: CompletionPool::new("log"),
            completion_notify: tokio::sync::Notify::new(),
            stats: Arc::new(LogStats::default()),
            log_start_block,
            log_size_blocks,
            iclog_capacity,
        }))
    }

    pub fn stats(&self) -> Arc<LogStats> {
        self.0.stats.clone()
    }

    pub fn next_tid(&self) -> u64 {
        let mut inner = self.0.inner.lock();
        let tid = inner.next_tid;
        inner.next_tid += 1;
        tid
    }

    /// `reserve`: rounds `length` up to account
    /// for per-record header overhead across however many iclogs the
    /// write will span, taking two extra headers for a permanent
    /// reservation. Pushes the AIL once to try to recover space before
    /// failing with `LogSpace`.
    pub fn reserve(&self, length: usize, client: LogClient, permanent: bool) -> Result<Arc<Ticket>, LogError> {
        let splits = ((length + self.0.iclog_capacity - 1) / self.0.iclog_capacity).max(1) as i64;
        let mut reservation = length as i64 + RESERVATION_HEADER_BYTES * splits;
        if permanent {
            reservation += RESERVATION_HEADER_BYTES * 2;
        }

        {
            let mut inner = self.0.inner.lock();
            if inner.reservation_free >= reservation {
                inner.reservation_free -= reservation;
                let tid = inner.next_tid;
                inner.next_tid += 1;
                self.0.stats.reservations.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::new(Ticket::new(tid, reservation, client, permanent)));
            }
        }

        self.0.stats.log_space_waits.fetch_add(1, Ordering::Relaxed);
        let head_lsn = {
            let inner = self.0.inner.lock();
            Lsn::pack(inner.current_cycle, inner.current_block)
        };
        if self.0.ail.push_ail(head_lsn) {
            // Pinned items block the pusher; forcing the active iclog
            // drains whatever commit is holding them pinned so their
            // callback can unpin and reposition them.
            let mut inner = self.0.inner.lock();
            self.force_active_locked(&mut inner);
        }

        let mut inner = self.0.inner.lock();
        if inner.reservation_free < reservation {
            return Err(LogError::LogSpace);
        }
        inner.reservation_free -= reservation;
        let tid = inner.next_tid;
        inner.next_tid += 1;
        Ok(Arc::new(Ticket::new(tid, reservation, client, permanent)))
    }

    /// `done`: returns a non-permanent ticket's
    /// unused reservation to the pool; resets a permanent ticket in
    /// place so the next write in its chain starts a fresh record.
    pub fn done(&self, ticket: &Ticket, release_permanent: bool) {
        if !ticket.is_permanent() || release_permanent {
            let mut inner = self.0.inner.lock();
            inner.reservation_free += ticket.current_reservation().max(0);
        } else {
            ticket.reset();
        }
    }

    /// Ensures the active iclog slot is ready to accept writes,
    /// cleaning a DIRTY slot and assigning it a fresh starting LSN if it
    /// is empty (`clean_log`, transition table: DIRTY → ACTIVE).
    fn activate(&self, inner: &mut Inner) {
        let idx = inner.active;
        if inner.iclogs[idx].state == IclogState::Dirty {
            inner.iclogs[idx].clean();
        }
        if inner.iclogs[idx].is_empty() {
            inner.iclogs[idx].cycle = inner.current_cycle;
            inner.iclogs[idx].block = inner.current_block;
            inner.iclogs[idx].header_lsn = Lsn::pack(inner.current_cycle, inner.current_block);
        }
    }

    fn append_raw(&self, inner: &mut Inner, bytes: &[u8]) {
        let idx = inner.active;
        inner.iclogs[idx].data.extend_from_slice(bytes);
        inner.iclogs[idx].offset += bytes.len();
    }

    /// Writes one op (header + payload) into the active iclog, switching
    /// to the next slot (and forcing the old one to sync) if it doesn't
    /// fit. Large regions are split across iclogs with CONTINUE/WAS_CONT/
    /// END framing.
    fn append_region(&self, inner: &mut Inner, tid: u32, region: &[u8], client: u8, commit: bool) -> i64 {
        let mut written = 0i64;
        let mut remaining = region;
        let mut first_chunk = true;
        loop {
            self.activate(inner);
            let idx = inner.active;
            let capacity = self.0.iclog_capacity;
            let header_room = capacity.saturating_sub(inner.iclogs[idx].offset + LogOpHeader::ENCODED_LEN);
            let take = remaining.len().min(header_room);
            let mut flags = if first_chunk { None } else { Some(OpFlags::WasCont) };
            let is_last = take == remaining.len();
            let mut op = LogOpHeader::new(tid, take as u32, client, flags.take().unwrap_or(OpFlags::Start));
            if !is_last {
                op = op.with_flag(OpFlags::Continue);
            } else if commit {
                op = op.with_flag(OpFlags::Commit);
            } else if !first_chunk {
                op = op.with_flag(OpFlags::End);
            }
            self.append_raw(inner, &op.encode());
            self.append_raw(inner, &remaining[..take]);
            inner.iclogs[idx].num_ops += 1;
            written += take as i64;

            remaining = &remaining[take..];
            first_chunk = false;
            if remaining.is_empty() {
                break;
            }
            self.force_active_locked(inner);
        }
        written
    }

    /// `write`: appends a start op if the ticket
    /// is freshly initialized, then one op per region, marking the last
    /// region COMMIT when `commit` is set. Returns the LSN of the record
    /// the write landed in.
    pub fn write(&self, ticket: &Ticket, regions: &[Vec<u8>], commit: bool) -> Lsn {
        let mut inner = self.0.inner.lock();
        self.activate(&mut inner);
        let tid = ticket.tid as u32;
        let client = client_id(ticket.client);

        let mut total = 0i64;
        if ticket.is_inited() {
            let op = LogOpHeader::new(tid, 0, client, OpFlags::Start);
            self.append_raw(&mut inner, &op.encode());
            inner.iclogs[inner.active].num_ops += 1;
            ticket.clear_inited();
        }

        let n = regions.len();
        for (i, region) in regions.iter().enumerate() {
            let is_last = i + 1 == n;
            total += self.append_region(&mut inner, tid, region, client, commit && is_last);
        }

        let lsn = inner.iclogs[inner.active].header_lsn;
        drop(inner);
        ticket.consume(total);
        lsn
    }

    /// Marks the active iclog WANT_SYNC, snapshots block/cycle pointers,
    /// submits it for physical write-out, and advances the ring to the
    /// next slot. The submission here is synchronous (the `BlockIoPort`
    /// contract is a blocking call); completion-callback dispatch still
    /// goes through the completion pool to model "interrupt context"
    /// running on any CPU.
    fn force_active_locked(&self, inner: &mut Inner) {
        let idx = inner.active;
        if inner.iclogs[idx].is_empty() {
            return;
        }
        tracing::debug!(iclog = idx, cycle = inner.iclogs[idx].cycle, block = inner.iclogs[idx].block, "iclog active -> want_sync");
        inner.iclogs[idx].state = IclogState::WantSync;
        inner.iclogs[idx].tail_lsn = self.0.ail.tail_lsn(inner.iclogs[idx].header_lsn);

        let sector_count = self.0.iclog_capacity / SECTOR_SIZE;
        let mut record = inner.iclogs[idx].data.clone();
        record.resize(self.0.iclog_capacity, 0);

        // Torn-write detection: swap each sector's first word out into
        // the header's cycle array, replacing it with the cycle number,
        // so every sector carries the current cycle on disk.
        let mut cycle_array = Vec::with_capacity(sector_count);
        for sector in 0..sector_count {
            let at = sector * SECTOR_SIZE;
            if at + 4 > record.len() {
                cycle_array.push(0);
                continue;
            }
            let saved = u32::from_le_bytes(record[at..at + 4].try_into().unwrap());
            cycle_array.push(saved);
            record[at..at + 4].copy_from_slice(&(inner.iclogs[idx].cycle as u32).to_le_bytes());
        }

        let header = LogRecordHeader {
            magic: LOG_MAGIC,
            cycle: inner.iclogs[idx].cycle as u32,
            version: LOG_VERSION,
            lsn: inner.iclogs[idx].header_lsn,
            tail_lsn: inner.iclogs[idx].tail_lsn,
            length: inner.iclogs[idx].offset as u32,
            checksum: checksum::crc32c(&record[..inner.iclogs[idx].offset.min(record.len())]),
            prev_block: inner.prev_block as u32,
            num_ops: inner.iclogs[idx].num_ops,
            cycle_array,
        };
        let mut header_bytes = header.encode();
        header_bytes.resize(SECTOR_SIZE, 0);

        inner.iclogs[idx].state = IclogState::Syncing;
        let blkno = self.0.log_start_block + inner.iclogs[idx].block;
        let header_ok = self.0.block_io.submit(IoRequest { blkno, data: &mut header_bytes, op: IoOp::Write }).is_ok();
        let mut data_buf = record;
        let data_ok = self
            .0
            .block_io
            .submit(IoRequest { blkno: blkno + 1, data: &mut data_buf[SECTOR_SIZE..], op: IoOp::Write })
            .is_ok();

        inner.iclogs[idx].state = IclogState::DoneSync;
        inner.iclogs[idx].state = IclogState::Callback;
        let callbacks = std::mem::take(&mut inner.iclogs[idx].callbacks);
        inner.iclogs[idx].state = IclogState::Dirty;
        tracing::debug!(iclog = idx, ok = header_ok && data_ok, "iclog syncing -> dirty");
        self.0.stats.iclog_syncs.fetch_add(1, Ordering::Relaxed);

        inner.prev_block = inner.iclogs[idx].block;
        inner.current_block += sector_count as u64 + 1;
        if inner.current_block >= self.0.log_size_blocks {
            inner.current_block -= self.0.log_size_blocks;
            inner.current_cycle += 1;
        }
        inner.active = (idx + 1) % inner.iclogs.len();

        let ok = header_ok && data_ok;
        let pool = &self.0.completion_pool;
        pool.dispatch(
            idx,
            Box::new(move || {
                if ok {
                    for cb in callbacks {
                        cb();
                    }
                }
            }),
        );
    }

    /// `log_force` ("log_force(SYNC) suspends on the iclog completion
    /// semaphore"). `Async` returns immediately after marking WANT_SYNC;
    /// `Sync` additionally waits for the forced slot to leave SYNCING.
    pub async fn force(&self, mode: ForceMode) -> Lsn {
        let (idx, generation) = {
            let mut inner = self.0.inner.lock();
            let idx = inner.active;
            let generation = inner.iclogs[idx].generation;
            self.force_active_locked(&mut inner);
            (idx, generation)
        };
        if mode == ForceMode::Sync {
            loop {
                let done = {
                    let inner = self.0.inner.lock();
                    inner.iclogs[idx].state == IclogState::Dirty && inner.iclogs[idx].generation == generation
                };
                if done {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
        let inner = self.0.inner.lock();
        inner.iclogs[idx].header_lsn
    }

    /// Registers a callback to run once the active iclog's record
    /// reaches CALLBACK.
    pub fn on_active_committed(&self, cb: Box<dyn FnOnce() + Send>) {
        let mut inner = self.0.inner.lock();
        let idx = inner.active;
        inner.iclogs[idx].callbacks.push(cb);
    }

    pub fn current_lsn(&self) -> Lsn {
        let inner = self.0.inner.lock();
        Lsn::pack(inner.current_cycle, inner.current_block)
    }

    pub fn tail_lsn(&self) -> Lsn {
        self.0.ail.tail_lsn(self.current_lsn())
    }

    pub fn log_start_block(&self) -> u64 {
        self.0.log_start_block
    }

    pub fn log_size_blocks(&self) -> u64 {
        self.0.log_size_blocks
    }

    /// Writes a single-op UNMOUNT_TRANS record after the last commit
    ///, so recovery recognizes a clean tail.
    pub async fn write_unmount_record(&self) {
        let ticket = Arc::new(Ticket::new(0, RESERVATION_HEADER_BYTES * 2, LogClient::Log, false));
        let mut inner = self.0.inner.lock();
        self.activate(&mut inner);
        let op = LogOpHeader::new(0, 0, client_id(LogClient::Log), OpFlags::Unmount);
        self.append_raw(&mut inner, &op.encode());
        inner.iclogs[inner.active].num_ops += 1;
        drop(inner);
        let _ = ticket;
        self.force(ForceMode::Sync).await;
    }
}

pub(crate) fn transaction_header_bytes(ty: u32, tid: u64, num_items: u32) -> Vec<u8> {
    TransactionHeader { magic: format::TRANS_MAGIC, ty, tid, num_items }.encode().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_io::MemoryBlockDevice;

    fn engine() -> LogEngine {
        let device = Arc::new(MemoryBlockDevice::new(4096));
        let ail = Ail::new();
        LogEngine::new(device, ail, 0, 2048, 4, 8192)
    }

    #[test]
    fn reserve_accounts_header_overhead_and_decrements_pool() {
        let log = engine();
        let ticket = log.reserve(100, LogClient::Transaction, false).unwrap();
        assert_eq!(ticket.current_reservation(), 100 + RESERVATION_HEADER_BYTES);
    }

    #[test]
    fn reserve_fails_with_log_space_when_pool_exhausted() {
        let log = engine();
        let huge = (log.0.log_size_blocks as usize) * SECTOR_SIZE * 2;
        assert!(matches!(log.reserve(huge, LogClient::Transaction, false), Err(LogError::LogSpace)));
    }

    #[test]
    fn reserve_succeeds_after_a_pending_ticket_is_released() {
        // Pool is 2048 * 512 = 1,048,576 bytes. The held ticket's
        // reservation (900000 + 110 header sectors) leaves only ~92 KiB
        // free, too little for the second request until `done` returns
        // the held ticket's space to the pool.
        let log = engine();
        let held = log.reserve(900_000, LogClient::Transaction, false).unwrap();
        assert!(matches!(log.reserve(524_288, LogClient::Transaction, false), Err(LogError::LogSpace)));
        log.done(&held, true);
        assert!(log.reserve(524_288, LogClient::Transaction, false).is_ok());
    }

    #[tokio::test]
    async fn write_then_force_sync_transitions_active_iclog_to_dirty() {
        let log = engine();
        let ticket = log.reserve(64, LogClient::Transaction, false).unwrap();
        let lsn = log.write(&ticket, &[vec![1, 2, 3, 4]], true);
        assert_eq!(lsn.cycle(), 1);
        log.force(ForceMode::Sync).await;
    }
}
