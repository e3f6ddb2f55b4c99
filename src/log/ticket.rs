//! Reservation tickets, modeled on XFS's `xlog_ticket_t`.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

pub const TIC_INITED: u32 = 0x1;
pub const TIC_PERM: u32 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogClient {
    Transaction,
    Log,
}

/// A byte budget in the log obtained before a transaction may write
/// anything. Tickets are
/// recycled on `done`, not pooled explicitly — ownership is `Arc`-based
/// and the ticket is simply dropped.
#[derive(Debug)]
pub struct Ticket {
    pub tid: u64,
    pub original_reservation: i64,
    current_reservation: AtomicI64,
    pub client: LogClient,
    flags: AtomicU32,
}

impl Ticket {
    pub fn new(tid: u64, reservation: i64, client: LogClient, permanent: bool) -> Ticket {
        let flags = TIC_INITED | if permanent { TIC_PERM } else { 0 };
        Ticket { tid, original_reservation: reservation, current_reservation: AtomicI64::new(reservation), client, flags: AtomicU32::new(flags) }
    }

    pub fn current_reservation(&self) -> i64 {
        self.current_reservation.load(Ordering::Acquire)
    }

    pub fn consume(&self, bytes: i64) {
        if self.flags.load(Ordering::Acquire) & TIC_PERM != 0 {
            return;
        }
        self.current_reservation.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn is_permanent(&self) -> bool {
        self.flags.load(Ordering::Acquire) & TIC_PERM != 0
    }

    pub fn is_inited(&self) -> bool {
        self.flags.load(Ordering::Acquire) & TIC_INITED != 0
    }

    pub fn clear_inited(&self) {
        self.flags.fetch_and(!TIC_INITED, Ordering::AcqRel);
    }

    pub fn set_inited(&self) {
        self.flags.fetch_or(TIC_INITED, Ordering::AcqRel);
    }

    pub fn reset(&self) {
        self.current_reservation.store(self.original_reservation, Ordering::Release);
        self.set_inited();
    }
}
