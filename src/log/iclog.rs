//! In-core log buffer (iclog) state machine, modeled on XFS's
//! `xlog_in_core_t` and its ACTIVE/WANT_SYNC/SYNCING/DONE_SYNC/CALLBACK/
//! DIRTY transition table.

use crate::common::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IclogState {
    Active,
    WantSync,
    Syncing,
    DoneSync,
    Callback,
    Dirty,
}

/// One slot in the in-core log ring. Mutated only while the engine's
/// single `icloglock`-equivalent mutex is held.
pub struct IclogSlot {
    pub state: IclogState,
    pub cycle: u64,
    pub block: u64,
    pub header_lsn: Lsn,
    pub tail_lsn: Lsn,
    pub data: Vec<u8>,
    pub offset: usize,
    pub num_ops: u32,
    /// Bumped every time the slot transitions DIRTY → ACTIVE; lets a
    /// waiter identify which incarnation of this slot it is waiting on.
    pub generation: u64,
    pub callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl IclogSlot {
    pub fn new(capacity: usize) -> IclogSlot {
        IclogSlot {
            state: IclogState::Active,
            cycle: 0,
            block: 0,
            header_lsn: Lsn::ZERO,
            tail_lsn: Lsn::ZERO,
            data: Vec::with_capacity(capacity),
            offset: 0,
            num_ops: 0,
            generation: 0,
            callbacks: Vec::new(),
        }
    }

    pub fn remaining(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.offset)
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// DIRTY → ACTIVE (`clean_log`, transition table): lazily reset
    /// a synced slot so it can accept new writers.
    pub fn clean(&mut self) {
        debug_assert_eq!(self.state, IclogState::Dirty);
        self.state = IclogState::Active;
        self.data.clear();
        self.offset = 0;
        self.num_ops = 0;
        self.generation += 1;
        debug_assert!(self.callbacks.is_empty());
    }
}
