//! The 72-byte fixed WAL record layout.

use crate::atom::{fnv1a_64, AtomId};

pub const RECORD_LEN: usize = 72;

/// "still current" sentinel for `valid_to_ticks`.
pub const VALID_TO_FOREVER: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Add = 0,
    Delete = 1,
    Checkpoint = 2,
}

impl Op {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Add),
            1 => Some(Self::Delete),
            2 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// One 72-byte WAL entry:
/// `tx_id(8) op(1) pad(7) s(8) p(8) o(8) g(8) from(8) to(8) checksum(8)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub tx_id: u64,
    pub op: Op,
    pub subject_id: AtomId,
    pub predicate_id: AtomId,
    pub object_id: AtomId,
    pub graph_id: AtomId,
    pub valid_from_ticks: u64,
    pub valid_to_ticks: u64,
}

impl LogRecord {
    pub fn checkpoint(tx_id: u64) -> Self {
        Self {
            tx_id,
            op: Op::Checkpoint,
            subject_id: 0,
            predicate_id: 0,
            object_id: 0,
            graph_id: 0,
            valid_from_ticks: 0,
            valid_to_ticks: 0,
        }
    }

    /// Serializes to the fixed 72-byte wire layout, including the trailing
    /// FNV-1a 64 checksum of bytes `0..64`.
    pub fn to_bytes(self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..8].copy_from_slice(&self.tx_id.to_le_bytes());
        buf[8] = self.op as u8;
        buf[16..24].copy_from_slice(&self.subject_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.predicate_id.to_le_bytes());
        buf[32..40].copy_from_slice(&self.object_id.to_le_bytes());
        buf[40..48].copy_from_slice(&self.graph_id.to_le_bytes());
        buf[48..56].copy_from_slice(&self.valid_from_ticks.to_le_bytes());
        buf[56..64].copy_from_slice(&self.valid_to_ticks.to_le_bytes());
        let checksum = fnv1a_64(&buf[0..64]);
        buf[64..72].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parses a 72-byte chunk. Returns `None` if the op byte is unrecognized
    /// or the trailing checksum does not match — a record is valid only if
    /// its checksum matches.
    pub fn from_bytes(buf: &[u8; RECORD_LEN]) -> Option<Self> {
        let checksum = u64::from_le_bytes(buf[64..72].try_into().unwrap());
        if fnv1a_64(&buf[0..64]) != checksum {
            return None;
        }
        let op = Op::from_byte(buf[8])?;
        Some(Self {
            tx_id: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            op,
            subject_id: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            predicate_id: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            object_id: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            graph_id: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            valid_from_ticks: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
            valid_to_ticks: u64::from_le_bytes(buf[56..64].try_into().unwrap()),
        })
    }
}
