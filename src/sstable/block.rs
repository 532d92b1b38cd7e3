//! Prefix-compressed key-value blocks.
//!
//! Entries share a prefix with their predecessor; every
//! `restart_interval`-th entry is written in full and its offset recorded in
//! the restart array at the end of the block, giving binary search a way in.
//!
//! ```text
//! +-------------+-------------+------------+-----------+-------+
//! |shared: u16  |unshared: u16|val_len: u32| key delta | value |
//! +-------------+-------------+------------+-----------+-------+
//! ...
//! +-------------------+-------------------+
//! | restarts: u32 * n | restart count: u32|
//! +-------------------+-------------------+
//! ```
//!
//! Keys are encoded internal keys; ordering decisions always go through the
//! decoded form, which carries the internal comparator.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::key::InternalKey;

pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    entries_since_restart: usize,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buffer: Vec::new(),
            restarts: Vec::new(),
            restart_interval: restart_interval.max(1),
            entries_since_restart: 0,
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in ascending encoded-key order
    /// within the block.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.entries_since_restart == 0 {
            self.restarts.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_len(&self.last_key, key)
        };
        let unshared = key.len() - shared;

        self.buffer.write_u16::<BigEndian>(shared as u16).unwrap();
        self.buffer.write_u16::<BigEndian>(unshared as u16).unwrap();
        self.buffer.write_u32::<BigEndian>(value.len() as u32).unwrap();
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
        self.entries_since_restart += 1;
        if self.entries_since_restart >= self.restart_interval {
            self.entries_since_restart = 0;
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.restarts.is_empty() {
            self.restarts.push(0);
        }
        for restart in &self.restarts {
            self.buffer.write_u32::<BigEndian>(*restart).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restarts.len() as u32)
            .unwrap();
        self.buffer
    }

    /// Current encoded size, including the restart array it would finish
    /// with.
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A decoded, immutable block.
pub struct Block {
    data: Vec<u8>,
    restarts: Vec<u32>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("block shorter than restart count".to_string()));
        }
        let count_offset = data.len() - 4;
        let num_restarts = BigEndian::read_u32(&data[count_offset..]) as usize;
        if num_restarts == 0 {
            return Err(Error::Corruption("block has no restart points".to_string()));
        }
        let restarts_size = num_restarts
            .checked_mul(4)
            .ok_or_else(|| Error::Corruption("restart count overflow".to_string()))?;
        if restarts_size > count_offset {
            return Err(Error::Corruption("block restart array out of bounds".to_string()));
        }
        let restarts_offset = count_offset - restarts_size;
        let mut restarts = Vec::with_capacity(num_restarts);
        for i in 0..num_restarts {
            let at = restarts_offset + i * 4;
            let restart = BigEndian::read_u32(&data[at..at + 4]);
            if restart as usize > restarts_offset {
                return Err(Error::Corruption("restart offset out of bounds".to_string()));
            }
            restarts.push(restart);
        }
        let mut data = data;
        data.truncate(restarts_offset);
        Ok(Self { data, restarts })
    }

    pub fn iter(self: &Arc<Self>) -> BlockIter {
        BlockIter::new(Arc::clone(self))
    }
}

struct ParsedEntry {
    key: InternalKey,
    key_encoded: Vec<u8>,
    value_start: usize,
    value_len: usize,
    /// Offset of this entry's header in the block.
    offset: usize,
    /// Offset of the following entry.
    next_offset: usize,
}

/// Cursor over one block. Forward steps parse sequentially; backward steps
/// rewind to the governing restart point and re-scan, which keeps the
/// prefix-compression state correct in both directions.
pub struct BlockIter {
    block: Arc<Block>,
    current: Option<ParsedEntry>,
    error: Option<Error>,
}

impl BlockIter {
    fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            current: None,
            error: None,
        }
    }

    /// Parses the entry at `offset`, given the previous full key (empty at a
    /// restart point).
    fn parse_at(&self, offset: usize, prev_key: &[u8]) -> Result<ParsedEntry> {
        let data = &self.block.data;
        if offset + 8 > data.len() {
            return Err(Error::Corruption("block entry header out of bounds".to_string()));
        }
        let mut header = &data[offset..];
        let shared = header.read_u16::<BigEndian>()? as usize;
        let unshared = header.read_u16::<BigEndian>()? as usize;
        let value_len = header.read_u32::<BigEndian>()? as usize;

        let key_start = offset + 8;
        let value_start = key_start + unshared;
        let next_offset = value_start + value_len;
        if shared > prev_key.len() || next_offset > data.len() {
            return Err(Error::Corruption("block entry out of bounds".to_string()));
        }

        let mut key_encoded = Vec::with_capacity(shared + unshared);
        key_encoded.extend_from_slice(&prev_key[..shared]);
        key_encoded.extend_from_slice(&data[key_start..value_start]);
        let key = InternalKey::decode(&key_encoded)?;

        Ok(ParsedEntry {
            key,
            key_encoded,
            value_start,
            value_len,
            offset,
            next_offset,
        })
    }

    fn set_error(&mut self, e: Error) {
        self.error = Some(e);
        self.current = None;
    }

    /// Positions at the restart point `index` and returns the parsed first
    /// entry, or invalidates on corruption.
    fn seek_to_restart(&mut self, index: usize) {
        let offset = self.block.restarts[index] as usize;
        if offset >= self.block.data.len() {
            // Block with a restart array but no entries.
            self.current = None;
            return;
        }
        match self.parse_at(offset, &[]) {
            Ok(entry) => self.current = Some(entry),
            Err(e) => self.set_error(e),
        }
    }

    /// Key of the first entry at restart `index`; restart entries never
    /// share a prefix, so they decode standalone.
    fn restart_key(&self, index: usize) -> Result<InternalKey> {
        let entry = self.parse_at(self.block.restarts[index] as usize, &[])?;
        Ok(entry.key)
    }
}

impl BlockIter {
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn status(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn seek_to_first(&mut self) {
        if self.error.is_some() {
            return;
        }
        self.seek_to_restart(0);
    }

    pub fn seek_to_last(&mut self) {
        if self.error.is_some() {
            return;
        }
        self.seek_to_restart(self.block.restarts.len() - 1);
        while let Some(entry) = &self.current {
            if entry.next_offset >= self.block.data.len() {
                break;
            }
            self.step_forward();
        }
    }

    pub fn seek(&mut self, target: &InternalKey) {
        if self.error.is_some() {
            return;
        }
        // Binary search the restart array for the last restart whose key is
        // < target, then scan forward.
        let mut left = 0usize;
        let mut right = self.block.restarts.len();
        while left < right {
            let mid = left + (right - left) / 2;
            match self.restart_key(mid) {
                Ok(key) => match key.cmp(target) {
                    Ordering::Less => left = mid + 1,
                    _ => right = mid,
                },
                Err(e) => {
                    self.set_error(e);
                    return;
                }
            }
        }
        self.seek_to_restart(left.saturating_sub(1));
        while let Some(entry) = &self.current {
            if entry.key >= *target {
                return;
            }
            self.step_forward();
        }
    }

    pub fn next(&mut self) {
        if self.current.is_none() {
            return;
        }
        self.step_forward();
    }

    pub fn prev(&mut self) {
        let target_offset = match &self.current {
            Some(entry) => entry.offset,
            None => return,
        };
        if target_offset == 0 {
            self.current = None;
            return;
        }
        // Largest restart strictly before the current entry.
        let restart = self
            .block
            .restarts
            .partition_point(|&r| (r as usize) < target_offset)
            .saturating_sub(1);
        self.seek_to_restart(restart);
        while let Some(entry) = &self.current {
            if entry.next_offset >= target_offset {
                break;
            }
            self.step_forward();
        }
    }

    fn step_forward(&mut self) {
        let (next_offset, prev_key) = match &self.current {
            Some(entry) => (entry.next_offset, entry.key_encoded.clone()),
            None => return,
        };
        if next_offset >= self.block.data.len() {
            self.current = None;
            return;
        }
        match self.parse_at(next_offset, &prev_key) {
            Ok(entry) => self.current = Some(entry),
            Err(e) => self.set_error(e),
        }
    }

    pub fn key(&self) -> &InternalKey {
        &self.current.as_ref().expect("iterator not valid").key
    }

    pub fn value(&self) -> &[u8] {
        let entry = self.current.as_ref().expect("iterator not valid");
        &self.block.data[entry.value_start..entry.value_start + entry.value_len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueKind;

    fn ikey(key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(key.to_vec(), seq, ValueKind::Value)
    }

    fn build_block(entries: &[(&[u8], u64, &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, seq, value) in entries {
            builder.add(&ikey(key, *seq).encode(), value);
        }
        Arc::new(Block::new(builder.finish()).unwrap())
    }

    const ENTRIES: &[(&[u8], u64, &[u8])] = &[
        (b"apple", 1, b"fruit"),
        (b"application", 2, b"software"),
        (b"banana", 3, b"fruit"),
        (b"band", 4, b"music"),
        (b"bandana", 5, b"clothing"),
        (b"cherry", 6, b"fruit"),
    ];

    #[test]
    fn forward_scan_returns_all_entries() {
        for interval in [1, 2, 16] {
            let block = build_block(ENTRIES, interval);
            let mut iter = block.iter();
            iter.seek_to_first();

            let mut seen = Vec::new();
            while iter.valid() {
                seen.push((iter.key().user_key.clone(), iter.value().to_vec()));
                iter.next();
            }
            assert_eq!(seen.len(), ENTRIES.len(), "interval {interval}");
            for ((key, _, value), (seen_key, seen_value)) in ENTRIES.iter().zip(&seen) {
                assert_eq!(seen_key.as_slice(), *key);
                assert_eq!(seen_value.as_slice(), *value);
            }
        }
    }

    #[test]
    fn backward_scan_mirrors_forward() {
        let block = build_block(ENTRIES, 2);
        let mut iter = block.iter();
        iter.seek_to_last();

        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.key().user_key.clone());
            iter.prev();
        }
        seen.reverse();
        let expected: Vec<Vec<u8>> = ENTRIES.iter().map(|(k, _, _)| k.to_vec()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn seek_finds_exact_and_following_keys() {
        let block = build_block(ENTRIES, 2);
        let mut iter = block.iter();

        iter.seek(&InternalKey::for_lookup(b"band", crate::key::MAX_SEQUENCE));
        assert!(iter.valid());
        assert_eq!(iter.key().user_key, b"band");

        iter.seek(&InternalKey::for_lookup(b"bananaz", crate::key::MAX_SEQUENCE));
        assert!(iter.valid());
        assert_eq!(iter.key().user_key, b"band");

        iter.seek(&InternalKey::for_lookup(b"zzz", crate::key::MAX_SEQUENCE));
        assert!(!iter.valid());
    }

    #[test]
    fn prev_from_first_entry_invalidates() {
        let block = build_block(ENTRIES, 2);
        let mut iter = block.iter();
        iter.seek_to_first();
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn single_entry_block() {
        let block = build_block(&[(b"only", 9, b"one")], 16);
        let mut iter = block.iter();
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.key().user_key, b"only");
        iter.next();
        assert!(!iter.valid());

        iter.seek_to_last();
        assert!(iter.valid());
        assert_eq!(iter.value(), b"one");
    }

    #[test]
    fn corrupt_restart_array_is_rejected() {
        assert!(Block::new(vec![0, 0]).is_err());
        // Restart count claiming more entries than the block holds.
        assert!(Block::new(vec![0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn versions_of_a_key_scan_newest_first() {
        let block = build_block(&[(b"k", 9, b"new"), (b"k", 3, b"old")], 16);
        let mut iter = block.iter();
        iter.seek(&InternalKey::for_lookup(b"k", 5));
        assert!(iter.valid());
        assert_eq!(iter.key().sequence, 3);

        iter.seek(&InternalKey::for_lookup(b"k", 100));
        assert!(iter.valid());
        assert_eq!(iter.key().sequence, 9);
    }
}
