//! Atomic write batches.
//!
//! A batch is the unit of durability: its entries receive a contiguous block
//! of sequence numbers, it is appended to the write-ahead log as a single
//! record, and either all of its entries become visible or none do.
//!
//! Encoded layout, big-endian throughout:
//!
//! ```text
//! +------------+-----------+---------------------------------------+
//! | seq: u64   | count: u32| entries...                            |
//! +------------+-----------+---------------------------------------+
//!
//! entry: kind u8 | key_len u32 | key | (val_len u32 | value)
//! ```
//!
//! Tombstone entries carry no value bytes.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};
use crate::key::{SequenceNumber, ValueKind};

const HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BatchEntry {
    pub kind: ValueKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// An ordered list of mutations applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    sequence: SequenceNumber,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.entries.push(BatchEntry {
            kind: ValueKind::Value,
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.entries.push(BatchEntry {
            kind: ValueKind::Tombstone,
            key: key.to_vec(),
            value: Vec::new(),
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.sequence = 0;
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encoded size, used by group commit to bound co-batching.
    pub fn approximate_size(&self) -> usize {
        HEADER_SIZE
            + self
                .entries
                .iter()
                .map(|e| 9 + e.key.len() + if e.kind == ValueKind::Value { 4 } else { 0 } + e.value.len())
                .sum::<usize>()
    }

    /// Moves all entries of `other` onto the end of this batch.
    pub fn append(&mut self, other: Batch) {
        self.entries.extend(other.entries);
    }

    /// Iterates entries as `(kind, key, value)`. Tombstones yield an empty
    /// value slice.
    pub fn iter(&self) -> impl Iterator<Item = (ValueKind, &[u8], &[u8])> {
        self.entries
            .iter()
            .map(|e| (e.kind, e.key.as_slice(), e.value.as_slice()))
    }

    pub(crate) fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.sequence = sequence;
    }

    pub(crate) fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.approximate_size());
        buf.write_u64::<BigEndian>(self.sequence).unwrap();
        buf.write_u32::<BigEndian>(self.entries.len() as u32).unwrap();
        for entry in &self.entries {
            buf.write_u8(entry.kind as u8).unwrap();
            buf.write_u32::<BigEndian>(entry.key.len() as u32).unwrap();
            buf.extend_from_slice(&entry.key);
            if entry.kind == ValueKind::Value {
                buf.write_u32::<BigEndian>(entry.value.len() as u32).unwrap();
                buf.extend_from_slice(&entry.value);
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "batch record too short: {} bytes",
                buf.len()
            )));
        }
        let mut cursor = Cursor::new(buf);
        let sequence = cursor.read_u64::<BigEndian>()?;
        let count = cursor.read_u32::<BigEndian>()? as usize;

        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let kind = ValueKind::from_u8(cursor.read_u8()?)?;
            let key_len = cursor.read_u32::<BigEndian>()? as usize;
            let mut key = vec![0u8; key_len];
            cursor.read_exact(&mut key)?;
            let value = if kind == ValueKind::Value {
                let val_len = cursor.read_u32::<BigEndian>()? as usize;
                let mut value = vec![0u8; val_len];
                cursor.read_exact(&mut value)?;
                value
            } else {
                Vec::new()
            };
            entries.push(BatchEntry { kind, key, value });
        }
        if cursor.position() as usize != buf.len() {
            return Err(Error::Corruption(
                "trailing bytes after batch entries".to_string(),
            ));
        }
        Ok(Self { entries, sequence })
    }
}
