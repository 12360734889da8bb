//! Flat, fixed-size pattern buffer the parser writes into and the scan
//! pipeline reads from.
//!
//! Grounded on `lib/oxigraph/src/storage/binary_encoder.rs`'s fixed-offset
//! `write_u64`/`read_u64` idiom, applied to a query-shape buffer instead of
//! an on-disk quad encoding. No teacher parser uses this representation
//! (`spargebra` builds a heap AST); the 64-byte tagged-slot layout is a
//! purpose-built design for this store.

use crate::buffer::{BufferManager, Lease};

/// Maximum number of slots a `PatternBuffer` may hold.
pub const MAX_CAPACITY: usize = 1024;
/// Default capacity used when a caller doesn't override it via `StoreConfig`.
pub const DEFAULT_CAPACITY: usize = 128;

pub const SLOT_LEN: usize = 64;

pub fn pattern_buffer_size(n: usize) -> usize {
    SLOT_LEN * n
}

/// First byte of every `PatternSlot`, identifying how the remaining 63 bytes
/// are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PatternKind {
    Empty = 0,
    Triple = 1,
    Filter = 2,
    Bind = 3,
    ValuesHeader = 4,
    ValuesEntry = 5,
}

impl PatternKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Empty),
            1 => Some(Self::Triple),
            2 => Some(Self::Filter),
            3 => Some(Self::Bind),
            4 => Some(Self::ValuesHeader),
            5 => Some(Self::ValuesEntry),
            _ => None,
        }
    }
}

/// How a triple-pattern position's source span should be interpreted.
///
/// `Generated` is the one variant whose "span" isn't a source offset at
/// all: `source_start` holds a small synthesized id instead. Both property-
/// path sequence expansion's "fresh intermediate variable" and quoted-
/// triple reification's "fresh blank-node reifier" name
/// terms that never appear in the query text, so they have no source span
/// to point at — a numeric id in the same 4 bytes keeps `TermSpan` at a
/// single fixed layout instead of growing a second representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TermType {
    Variable = 0,
    Iri = 1,
    BlankNode = 2,
    Literal = 3,
    Generated = 4,
}

impl TermType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Variable),
            1 => Some(Self::Iri),
            2 => Some(Self::BlankNode),
            3 => Some(Self::Literal),
            4 => Some(Self::Generated),
            _ => None,
        }
    }
}

/// Property-path operator recorded on a triple slot's optional path fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PathKind {
    None = 0,
    ZeroOrMore = 1,
    OneOrMore = 2,
    ZeroOrOne = 3,
    Inverse = 4,
}

impl PathKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::ZeroOrMore),
            2 => Some(Self::OneOrMore),
            3 => Some(Self::ZeroOrOne),
            4 => Some(Self::Inverse),
            _ => None,
        }
    }
}

/// A single term reference within a triple slot: how to interpret the span
/// `source[source_start..source_start+source_len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSpan {
    pub term_type: TermType,
    pub source_start: i32,
    pub source_len: i32,
}

/// A decoded view over one 64-byte slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSlot {
    Empty,
    Triple {
        subject: TermSpan,
        predicate: TermSpan,
        object: TermSpan,
        path: PathKind,
        path_iri_start: i32,
        path_iri_len: i32,
    },
    Filter {
        source_start: i32,
        source_len: i32,
    },
    Bind {
        expr_start: i32,
        expr_len: i32,
        var_start: i32,
        var_len: i32,
    },
    ValuesHeader {
        var_start: i32,
        var_len: i32,
        entry_count: i32,
    },
    ValuesEntry {
        value_start: i32,
        value_len: i32,
    },
}

fn write_term(buf: &mut [u8], offset: usize, term: TermSpan) {
    buf[offset] = term.term_type as u8;
    buf[offset + 1..offset + 5].copy_from_slice(&term.source_start.to_le_bytes());
    buf[offset + 5..offset + 9].copy_from_slice(&term.source_len.to_le_bytes());
}

fn read_term(buf: &[u8], offset: usize) -> Option<TermSpan> {
    Some(TermSpan {
        term_type: TermType::from_byte(buf[offset])?,
        source_start: i32::from_le_bytes(buf[offset + 1..offset + 5].try_into().unwrap()),
        source_len: i32::from_le_bytes(buf[offset + 5..offset + 9].try_into().unwrap()),
    })
}

const TERM_LEN: usize = 9;

impl PatternSlot {
    pub fn encode(self, buf: &mut [u8; SLOT_LEN]) {
        buf.fill(0);
        match self {
            PatternSlot::Empty => buf[0] = PatternKind::Empty as u8,
            PatternSlot::Triple {
                subject,
                predicate,
                object,
                path,
                path_iri_start,
                path_iri_len,
            } => {
                buf[0] = PatternKind::Triple as u8;
                write_term(buf, 1, subject);
                write_term(buf, 1 + TERM_LEN, predicate);
                write_term(buf, 1 + 2 * TERM_LEN, object);
                let path_off = 1 + 3 * TERM_LEN;
                buf[path_off] = path as u8;
                buf[path_off + 1..path_off + 5].copy_from_slice(&path_iri_start.to_le_bytes());
                buf[path_off + 5..path_off + 9].copy_from_slice(&path_iri_len.to_le_bytes());
            }
            PatternSlot::Filter {
                source_start,
                source_len,
            } => {
                buf[0] = PatternKind::Filter as u8;
                buf[1..5].copy_from_slice(&source_start.to_le_bytes());
                buf[5..9].copy_from_slice(&source_len.to_le_bytes());
            }
            PatternSlot::Bind {
                expr_start,
                expr_len,
                var_start,
                var_len,
            } => {
                buf[0] = PatternKind::Bind as u8;
                buf[1..5].copy_from_slice(&expr_start.to_le_bytes());
                buf[5..9].copy_from_slice(&expr_len.to_le_bytes());
                buf[9..13].copy_from_slice(&var_start.to_le_bytes());
                buf[13..17].copy_from_slice(&var_len.to_le_bytes());
            }
            PatternSlot::ValuesHeader {
                var_start,
                var_len,
                entry_count,
            } => {
                buf[0] = PatternKind::ValuesHeader as u8;
                buf[1..5].copy_from_slice(&var_start.to_le_bytes());
                buf[5..9].copy_from_slice(&var_len.to_le_bytes());
                buf[9..13].copy_from_slice(&entry_count.to_le_bytes());
            }
            PatternSlot::ValuesEntry {
                value_start,
                value_len,
            } => {
                buf[0] = PatternKind::ValuesEntry as u8;
                buf[1..5].copy_from_slice(&value_start.to_le_bytes());
                buf[5..9].copy_from_slice(&value_len.to_le_bytes());
            }
        }
    }

    pub fn decode(buf: &[u8; SLOT_LEN]) -> Option<Self> {
        match PatternKind::from_byte(buf[0])? {
            PatternKind::Empty => Some(PatternSlot::Empty),
            PatternKind::Triple => {
                let path_off = 1 + 3 * TERM_LEN;
                Some(PatternSlot::Triple {
                    subject: read_term(buf, 1)?,
                    predicate: read_term(buf, 1 + TERM_LEN)?,
                    object: read_term(buf, 1 + 2 * TERM_LEN)?,
                    path: PathKind::from_byte(buf[path_off])?,
                    path_iri_start: i32::from_le_bytes(
                        buf[path_off + 1..path_off + 5].try_into().unwrap(),
                    ),
                    path_iri_len: i32::from_le_bytes(
                        buf[path_off + 5..path_off + 9].try_into().unwrap(),
                    ),
                })
            }
            PatternKind::Filter => Some(PatternSlot::Filter {
                source_start: i32::from_le_bytes(buf[1..5].try_into().unwrap()),
                source_len: i32::from_le_bytes(buf[5..9].try_into().unwrap()),
            }),
            PatternKind::Bind => Some(PatternSlot::Bind {
                expr_start: i32::from_le_bytes(buf[1..5].try_into().unwrap()),
                expr_len: i32::from_le_bytes(buf[5..9].try_into().unwrap()),
                var_start: i32::from_le_bytes(buf[9..13].try_into().unwrap()),
                var_len: i32::from_le_bytes(buf[13..17].try_into().unwrap()),
            }),
            PatternKind::ValuesHeader => Some(PatternSlot::ValuesHeader {
                var_start: i32::from_le_bytes(buf[1..5].try_into().unwrap()),
                var_len: i32::from_le_bytes(buf[5..9].try_into().unwrap()),
                entry_count: i32::from_le_bytes(buf[9..13].try_into().unwrap()),
            }),
            PatternKind::ValuesEntry => Some(PatternSlot::ValuesEntry {
                value_start: i32::from_le_bytes(buf[1..5].try_into().unwrap()),
                value_len: i32::from_le_bytes(buf[5..9].try_into().unwrap()),
            }),
        }
    }
}

/// A flat array of 64-byte slots leased from a `BufferManager`; lifetime is
/// one query.
pub struct PatternBuffer<'a> {
    lease: Lease<'a>,
    len: usize,
    capacity: usize,
}

impl<'a> PatternBuffer<'a> {
    pub fn new(pool: &'a dyn BufferManager, capacity: usize) -> Self {
        let capacity = capacity.min(MAX_CAPACITY);
        let lease = pool.rent(pattern_buffer_size(capacity));
        Self {
            lease,
            len: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `slot`, returning its index. Errors if the buffer is full:
    /// the slot count is bounded by the buffer's capacity.
    pub fn push(&mut self, slot: PatternSlot) -> Result<usize, PatternBufferFull> {
        if self.len >= self.capacity {
            return Err(PatternBufferFull);
        }
        let index = self.len;
        let offset = index * SLOT_LEN;
        let mut raw = [0u8; SLOT_LEN];
        slot.encode(&mut raw);
        self.lease[offset..offset + SLOT_LEN].copy_from_slice(&raw);
        self.len += 1;
        Ok(index)
    }

    pub fn get(&self, index: usize) -> Option<PatternSlot> {
        if index >= self.len {
            return None;
        }
        let offset = index * SLOT_LEN;
        let raw: [u8; SLOT_LEN] = self.lease[offset..offset + SLOT_LEN].try_into().unwrap();
        PatternSlot::decode(&raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = PatternSlot> + '_ {
        (0..self.len).map(move |i| self.get(i).expect("index within len"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternBufferFull;

impl std::fmt::Display for PatternBufferFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pattern buffer exceeded its capacity")
    }
}

impl std::error::Error for PatternBufferFull {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PooledBufferManager;

    #[test]
    fn triple_slot_round_trips() {
        let pool = PooledBufferManager::new();
        let mut buffer = PatternBuffer::new(&pool, 4);
        let slot = PatternSlot::Triple {
            subject: TermSpan {
                term_type: TermType::Variable,
                source_start: 0,
                source_len: 2,
            },
            predicate: TermSpan {
                term_type: TermType::Iri,
                source_start: 3,
                source_len: 5,
            },
            object: TermSpan {
                term_type: TermType::Literal,
                source_start: 9,
                source_len: 4,
            },
            path: PathKind::None,
            path_iri_start: 0,
            path_iri_len: 0,
        };
        let index = buffer.push(slot).unwrap();
        assert_eq!(buffer.get(index), Some(slot));
    }

    #[test]
    fn push_beyond_capacity_fails() {
        let pool = PooledBufferManager::new();
        let mut buffer = PatternBuffer::new(&pool, 1);
        buffer.push(PatternSlot::Empty).unwrap();
        assert!(buffer.push(PatternSlot::Empty).is_err());
    }

    #[test]
    fn capacity_is_clamped_to_max() {
        let pool = PooledBufferManager::new();
        let buffer = PatternBuffer::new(&pool, MAX_CAPACITY * 2);
        assert_eq!(buffer.capacity(), MAX_CAPACITY);
    }

    #[test]
    fn pattern_buffer_size_matches_slot_len() {
        assert_eq!(pattern_buffer_size(10), 640);
    }
}
