//! On-disk wire formats, bit-exact: the log record header, log op
//! header, and transaction header. Field order and widths follow XFS's
//! `xlog_rec_header_t` / `xlog_op_header_t`.

use super::LogError;
use crate::common::Lsn;

pub const LOG_MAGIC: u32 = 0xFEED_BABE;
pub const LOG_VERSION: u32 = 2;
pub const TRANS_MAGIC: u32 = 0x5452_414e; // 'TRAN'

pub const REC_HEADER_FIXED_LEN: usize = 4 + 4 + 4 + 8 + 8 + 4 + 4 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFlags {
    Start,
    Commit,
    Continue,
    WasCont,
    End,
    Unmount,
}

impl OpFlags {
    fn bits(self) -> u8 {
        match self {
            OpFlags::Start => 1 << 0,
            OpFlags::Commit => 1 << 1,
            OpFlags::Continue => 1 << 2,
            OpFlags::WasCont => 1 << 3,
            OpFlags::End => 1 << 4,
            OpFlags::Unmount => 1 << 5,
        }
    }
}

/// A per-sector cycle array entry used for torn-write detection: the
/// first 32-bit word of each sector is swapped with the corresponding
/// array slot before write-out, so the current cycle number appears at
/// every sector boundary on disk.
#[derive(Debug, Clone)]
pub struct LogRecordHeader {
    pub magic: u32,
    pub cycle: u32,
    pub version: u32,
    pub lsn: Lsn,
    pub tail_lsn: Lsn,
    pub length: u32,
    pub checksum: u32,
    pub prev_block: u32,
    pub num_ops: u32,
    pub cycle_array: Vec<u32>,
}

impl LogRecordHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REC_HEADER_FIXED_LEN + self.cycle_array.len() * 4);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.cycle.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.lsn.0.to_le_bytes());
        out.extend_from_slice(&self.tail_lsn.0.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.extend_from_slice(&self.prev_block.to_le_bytes());
        out.extend_from_slice(&self.num_ops.to_le_bytes());
        for slot in &self.cycle_array {
            out.extend_from_slice(&slot.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8], sector_count: usize) -> Result<LogRecordHeader, LogError> {
        if bytes.len() < REC_HEADER_FIXED_LEN + sector_count * 4 {
            return Err(LogError::CorruptLog("record header truncated".into()));
        }
        let mut at = 0usize;
        let mut take4 = || {
            let v = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
            at += 4;
            v
        };
        let magic = take4();
        let cycle = take4();
        let version = take4();
        let lsn = {
            let v = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
            at += 8;
            Lsn(v)
        };
        let tail_lsn = {
            let v = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
            at += 8;
            Lsn(v)
        };
        let length = take4();
        let checksum = take4();
        let prev_block = take4();
        let num_ops = take4();
        let mut cycle_array = Vec::with_capacity(sector_count);
        for _ in 0..sector_count {
            cycle_array.push(take4());
        }
        if magic != LOG_MAGIC {
            return Err(LogError::CorruptLog("bad record magic".into()));
        }
        if version != LOG_VERSION {
            return Err(LogError::VersionMismatch { found: version, expected: LOG_VERSION });
        }
        Ok(LogRecordHeader { magic, cycle, version, lsn, tail_lsn, length, checksum, prev_block, num_ops, cycle_array })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LogOpHeader {
    pub tid: u32,
    pub len: u32,
    pub client_id: u8,
    pub flags: u8,
}

impl LogOpHeader {
    pub const ENCODED_LEN: usize = 4 + 4 + 1 + 1 + 2;

    pub fn new(tid: u32, len: u32, client_id: u8, flags: OpFlags) -> Self {
        LogOpHeader { tid, len, client_id, flags: flags.bits() }
    }

    pub fn with_flag(mut self, flag: OpFlags) -> Self {
        self.flags |= flag.bits();
        self
    }

    pub fn has(&self, flag: OpFlags) -> bool {
        self.flags & flag.bits() != 0
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.tid.to_le_bytes());
        out[4..8].copy_from_slice(&self.len.to_le_bytes());
        out[8] = self.client_id;
        out[9] = self.flags;
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<LogOpHeader, LogError> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(LogError::CorruptLog("op header truncated".into()));
        }
        Ok(LogOpHeader {
            tid: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            len: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            client_id: bytes[8],
            flags: bytes[9],
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionHeader {
    pub magic: u32,
    pub ty: u32,
    pub tid: u64,
    pub num_items: u32,
}

impl TransactionHeader {
    pub const ENCODED_LEN: usize = 4 + 4 + 8 + 4;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.ty.to_le_bytes());
        out[8..16].copy_from_slice(&self.tid.to_le_bytes());
        out[16..20].copy_from_slice(&self.num_items.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<TransactionHeader, LogError> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(LogError::CorruptLog("transaction header truncated".into()));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != TRANS_MAGIC {
            return Err(LogError::CorruptLog("bad transaction header magic".into()));
        }
        Ok(TransactionHeader {
            magic,
            ty: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            tid: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            num_items: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        })
    }
}

pub use OpFlags::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_header_roundtrips() {
        let header = LogRecordHeader {
            magic: LOG_MAGIC,
            cycle: 3,
            version: LOG_VERSION,
            lsn: Lsn::pack(3, 10),
            tail_lsn: Lsn::pack(2, 900),
            length: 4096,
            checksum: 0xdead_beef,
            prev_block: 9,
            num_ops: 2,
            cycle_array: vec![3, 3, 3, 3],
        };
        let bytes = header.encode();
        let decoded = LogRecordHeader::decode(&bytes, 4).unwrap();
        assert_eq!(decoded.cycle, 3);
        assert_eq!(decoded.lsn, Lsn::pack(3, 10));
        assert_eq!(decoded.cycle_array, vec![3, 3, 3, 3]);
    }

    #[test]
    fn op_header_roundtrips_with_commit_flag() {
        let op = LogOpHeader::new(42, 128, 1, OpFlags::Start).with_flag(OpFlags::Commit);
        let bytes = op.encode();
        let decoded = LogOpHeader::decode(&bytes).unwrap();
        assert!(decoded.has(OpFlags::Start));
        assert!(decoded.has(OpFlags::Commit));
        assert!(!decoded.has(OpFlags::Continue));
    }
}
