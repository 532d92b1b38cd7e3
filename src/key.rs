//! Internal key model.
//!
//! Every mutation is identified by `(user_key, sequence, kind)`. Sequence
//! numbers are 56-bit monotonically increasing counters; the kind records
//! whether the entry carries a value or a deletion marker. Internal keys
//! order by ascending user key, then *descending* sequence, then descending
//! kind, which places the newest version of a user key first among its
//! siblings.
//!
//! The encoded form appends an 8-byte big-endian trailer `(sequence << 8) |
//! kind` to the user key. Runs on disk store encoded internal keys; in-memory
//! structures use the decoded struct, which carries the ordering.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Sequence number assigned to a mutation.
pub type SequenceNumber = u64;

/// Largest representable sequence number (56 bits).
pub const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

const TRAILER_SIZE: usize = 8;

/// Whether an entry carries a value or marks a deletion.
///
/// The discriminants matter: kind orders descending inside an internal key,
/// so at equal `(user_key, sequence)` a value sorts before a tombstone, and a
/// lookup key built with `Value` sees every visible entry of its user key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    Tombstone = 0,
    Value = 1,
}

impl ValueKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ValueKind::Tombstone),
            1 => Ok(ValueKind::Value),
            other => Err(Error::Corruption(format!("unknown value kind {other}"))),
        }
    }
}

/// A decoded internal key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub sequence: SequenceNumber,
    pub kind: ValueKind,
}

impl InternalKey {
    pub fn new(user_key: Vec<u8>, sequence: SequenceNumber, kind: ValueKind) -> Self {
        debug_assert!(sequence <= MAX_SEQUENCE);
        Self {
            user_key,
            sequence,
            kind,
        }
    }

    /// Lookup key for a point read: the newest entry of `user_key` visible
    /// at `sequence` is the first internal key >= this one.
    pub fn for_lookup(user_key: &[u8], sequence: SequenceNumber) -> Self {
        Self::new(user_key.to_vec(), sequence, ValueKind::Value)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.user_key.len() + TRAILER_SIZE);
        buf.extend_from_slice(&self.user_key);
        let mut trailer = [0u8; TRAILER_SIZE];
        BigEndian::write_u64(&mut trailer, (self.sequence << 8) | self.kind as u64);
        buf.extend_from_slice(&trailer);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TRAILER_SIZE {
            return Err(Error::Corruption(format!(
                "internal key too short: {} bytes",
                buf.len()
            )));
        }
        let split = buf.len() - TRAILER_SIZE;
        let trailer = BigEndian::read_u64(&buf[split..]);
        Ok(Self {
            user_key: buf[..split].to_vec(),
            sequence: trailer >> 8,
            kind: ValueKind::from_u8((trailer & 0xff) as u8)?,
        })
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| (other.kind as u8).cmp(&(self.kind as u8)))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ikey(key: &[u8], seq: u64, kind: ValueKind) -> InternalKey {
        InternalKey::new(key.to_vec(), seq, kind)
    }

    #[test]
    fn orders_by_user_key_then_descending_sequence() {
        let a1 = ikey(b"a", 1, ValueKind::Value);
        let a9 = ikey(b"a", 9, ValueKind::Value);
        let b5 = ikey(b"b", 5, ValueKind::Value);

        assert!(a9 < a1, "newer version of a key must sort first");
        assert!(a1 < b5);
        assert!(a9 < b5);
    }

    #[test]
    fn value_sorts_before_tombstone_at_equal_sequence() {
        let val = ikey(b"k", 7, ValueKind::Value);
        let del = ikey(b"k", 7, ValueKind::Tombstone);
        assert!(val < del);
    }

    #[test]
    fn lookup_key_sees_all_visible_entries() {
        let lookup = InternalKey::for_lookup(b"k", 5);
        // Entries newer than the snapshot sort before the lookup key.
        assert!(ikey(b"k", 6, ValueKind::Value) < lookup);
        assert!(ikey(b"k", 9, ValueKind::Tombstone) < lookup);
        // Entries at or below the snapshot sort at or after it.
        assert!(ikey(b"k", 5, ValueKind::Value) >= lookup);
        assert!(ikey(b"k", 5, ValueKind::Tombstone) > lookup);
        assert!(ikey(b"k", 1, ValueKind::Value) > lookup);
    }

    #[test]
    fn encode_decode_roundtrip() {
        for (key, seq, kind) in [
            (b"".as_slice(), 0u64, ValueKind::Value),
            (b"hello", 42, ValueKind::Tombstone),
            (b"\x00\xff", MAX_SEQUENCE, ValueKind::Value),
        ] {
            let original = ikey(key, seq, kind);
            let decoded = InternalKey::decode(&original.encode()).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(InternalKey::decode(b"short").is_err());
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let mut buf = ikey(b"k", 3, ValueKind::Value).encode();
        let last = buf.len() - 1;
        buf[last] = 9;
        assert!(InternalKey::decode(&buf).is_err());
    }
}
