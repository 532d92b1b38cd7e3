//! In-memory ordered table.
//!
//! The memtable is a concurrent-reader / single-writer map from internal key
//! to value, backed by `crossbeam_skiplist::SkipMap`. Readers never block
//! against the writer: the skip list publishes nodes with release stores and
//! readers observe them with acquire loads, so a fully-initialized node is
//! visible or absent, never partial.
//!
//! A memtable is *sealed* once its measured memory crosses the write buffer
//! threshold. A sealed table rejects inserts and is kept only for reading
//! until the flush that turns it into a level-0 run completes.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::{InternalKey, SequenceNumber, ValueKind};

/// Per-entry bookkeeping overhead counted against the write buffer, covering
/// the sequence/kind trailer and node pointers.
const ENTRY_OVERHEAD: usize = 16;

pub struct Memtable {
    data: SkipMap<InternalKey, Vec<u8>>,
    size: AtomicUsize,
    sealed: AtomicBool,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
        }
    }

    /// Inserts one version of a user key. Only the write coordinator calls
    /// this, and only on the active table.
    pub fn insert(
        &self,
        sequence: SequenceNumber,
        kind: ValueKind,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::Sealed);
        }
        let entry_size = key.len() + value.len() + ENTRY_OVERHEAD;
        self.data.insert(
            InternalKey::new(key.to_vec(), sequence, kind),
            value.to_vec(),
        );
        self.size.fetch_add(entry_size, Ordering::Relaxed);
        Ok(())
    }

    /// Newest version of `key` visible at `sequence`.
    ///
    /// Returns `None` when the table holds no visible version, `Some(None)`
    /// when the newest visible version is a tombstone, and `Some(Some(v))`
    /// otherwise.
    pub fn get(&self, key: &[u8], sequence: SequenceNumber) -> Option<Option<Vec<u8>>> {
        let lookup = InternalKey::for_lookup(key, sequence);
        let entry = self.data.lower_bound(Bound::Included(&lookup))?;
        if entry.key().user_key != key {
            return None;
        }
        match entry.key().kind {
            ValueKind::Value => Some(Some(entry.value().clone())),
            ValueKind::Tombstone => Some(None),
        }
    }

    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Marks the table read-only. Idempotent.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn iter(self: &Arc<Self>) -> MemtableIter {
        MemtableIter {
            table: Arc::clone(self),
            current: None,
        }
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("entries", &self.data.len())
            .field("size", &self.approximate_size())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

/// Owned cursor over a memtable.
///
/// The cursor holds its position as an owned `(key, value)` pair and
/// re-ranges into the skip list on every step, so it has no borrow of the
/// table and stays valid for as long as the `Arc` it holds.
pub struct MemtableIter {
    table: Arc<Memtable>,
    current: Option<(InternalKey, Vec<u8>)>,
}

impl InternalIterator for MemtableIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        self.current = self
            .table
            .data
            .front()
            .map(|e| (e.key().clone(), e.value().clone()));
    }

    fn seek_to_last(&mut self) {
        self.current = self
            .table
            .data
            .back()
            .map(|e| (e.key().clone(), e.value().clone()));
    }

    fn seek(&mut self, target: &InternalKey) {
        self.current = self
            .table
            .data
            .lower_bound(Bound::Included(target))
            .map(|e| (e.key().clone(), e.value().clone()));
    }

    fn next(&mut self) {
        let key = match &self.current {
            Some((key, _)) => key.clone(),
            None => return,
        };
        self.current = self
            .table
            .data
            .lower_bound(Bound::Excluded(&key))
            .map(|e| (e.key().clone(), e.value().clone()));
    }

    fn prev(&mut self) {
        let key = match &self.current {
            Some((key, _)) => key.clone(),
            None => return,
        };
        self.current = self
            .table
            .data
            .upper_bound(Bound::Excluded(&key))
            .map(|e| (e.key().clone(), e.value().clone()));
    }

    fn key(&self) -> &InternalKey {
        &self.current.as_ref().expect("iterator not valid").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not valid").1
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(entries: &[(u64, ValueKind, &[u8], &[u8])]) -> Arc<Memtable> {
        let table = Arc::new(Memtable::new());
        for (seq, kind, key, value) in entries {
            table.insert(*seq, *kind, key, value).unwrap();
        }
        table
    }

    #[test]
    fn get_returns_newest_visible_version() {
        let table = table_with(&[
            (1, ValueKind::Value, b"k", b"v1"),
            (5, ValueKind::Value, b"k", b"v5"),
            (9, ValueKind::Value, b"k", b"v9"),
        ]);

        assert_eq!(table.get(b"k", 100), Some(Some(b"v9".to_vec())));
        assert_eq!(table.get(b"k", 9), Some(Some(b"v9".to_vec())));
        assert_eq!(table.get(b"k", 7), Some(Some(b"v5".to_vec())));
        assert_eq!(table.get(b"k", 1), Some(Some(b"v1".to_vec())));
        assert_eq!(table.get(b"k", 0), None);
        assert_eq!(table.get(b"missing", 100), None);
    }

    #[test]
    fn tombstone_shadows_older_value() {
        let table = table_with(&[
            (1, ValueKind::Value, b"k", b"v"),
            (2, ValueKind::Tombstone, b"k", b""),
        ]);

        assert_eq!(table.get(b"k", 10), Some(None));
        assert_eq!(table.get(b"k", 1), Some(Some(b"v".to_vec())));
    }

    #[test]
    fn sealed_table_rejects_inserts() {
        let table = Arc::new(Memtable::new());
        table.insert(1, ValueKind::Value, b"a", b"1").unwrap();
        table.seal();
        assert_eq!(
            table.insert(2, ValueKind::Value, b"b", b"2"),
            Err(Error::Sealed)
        );
        // Reads still work.
        assert_eq!(table.get(b"a", 10), Some(Some(b"1".to_vec())));
    }

    #[test]
    fn size_is_measured() {
        let table = Arc::new(Memtable::new());
        assert_eq!(table.approximate_size(), 0);
        table.insert(1, ValueKind::Value, b"key", b"value").unwrap();
        assert_eq!(table.approximate_size(), 3 + 5 + ENTRY_OVERHEAD);
    }

    #[test]
    fn iterator_walks_in_internal_key_order() {
        let table = table_with(&[
            (3, ValueKind::Value, b"b", b"b3"),
            (1, ValueKind::Value, b"a", b"a1"),
            (2, ValueKind::Value, b"a", b"a2"),
        ]);

        let mut iter = table.iter();
        iter.seek_to_first();

        let mut seen = Vec::new();
        while iter.valid() {
            seen.push((iter.key().user_key.clone(), iter.key().sequence));
            iter.next();
        }
        // Within a user key, newer versions come first.
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 2),
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 3),
            ]
        );
    }

    #[test]
    fn iterator_moves_both_directions() {
        let table = table_with(&[
            (1, ValueKind::Value, b"a", b"1"),
            (2, ValueKind::Value, b"b", b"2"),
            (3, ValueKind::Value, b"c", b"3"),
        ]);

        let mut iter = table.iter();
        iter.seek_to_last();
        assert_eq!(iter.key().user_key, b"c");

        iter.prev();
        assert_eq!(iter.key().user_key, b"b");

        iter.next();
        assert_eq!(iter.key().user_key, b"c");

        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn seek_positions_at_first_key_at_or_after_target() {
        let table = table_with(&[
            (1, ValueKind::Value, b"b", b"1"),
            (2, ValueKind::Value, b"d", b"2"),
        ]);

        let mut iter = table.iter();
        iter.seek(&InternalKey::for_lookup(b"c", crate::key::MAX_SEQUENCE));
        assert!(iter.valid());
        assert_eq!(iter.key().user_key, b"d");

        iter.seek(&InternalKey::for_lookup(b"e", crate::key::MAX_SEQUENCE));
        assert!(!iter.valid());
    }

    #[test]
    fn concurrent_reads_during_writes() {
        use std::thread;

        let table = Arc::new(Memtable::new());
        let writer_table = Arc::clone(&table);
        let writer = thread::spawn(move || {
            for i in 0..1000u64 {
                let key = format!("key{i:04}");
                writer_table
                    .insert(i + 1, ValueKind::Value, key.as_bytes(), b"v")
                    .unwrap();
            }
        });

        let mut readers = Vec::new();
        for _ in 0..3 {
            let reader_table = Arc::clone(&table);
            readers.push(thread::spawn(move || {
                let mut last_len = 0;
                for _ in 0..100 {
                    let len = reader_table.len();
                    assert!(len >= last_len);
                    last_len = len;
                }
            }));
        }

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(table.len(), 1000);
    }
}
