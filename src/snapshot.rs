//! Snapshots: frozen observation points.
//!
//! A snapshot pins a sequence number. Reads through it ignore every newer
//! mutation, and compaction keeps at least the newest version at-or-below
//! the oldest live snapshot for every key. Snapshots are plain refcounted
//! handles; dropping the handle releases it, and the list prunes released
//! entries whenever it is consulted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::key::SequenceNumber;

#[derive(Debug)]
struct SnapshotInner {
    sequence: SequenceNumber,
}

/// A handle to a frozen view of the store. Cloneable; the view stays pinned
/// until every clone is dropped.
#[derive(Debug, Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }
}

/// Live snapshots, oldest first.
#[derive(Debug, Default)]
pub struct SnapshotList {
    entries: Mutex<VecDeque<Arc<SnapshotInner>>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, sequence: SequenceNumber) -> Snapshot {
        let inner = Arc::new(SnapshotInner { sequence });
        let mut entries = self.entries.lock().unwrap();
        debug_assert!(entries.back().map_or(true, |s| s.sequence <= sequence));
        entries.push_back(Arc::clone(&inner));
        Snapshot { inner }
    }

    /// Sequence of the oldest live snapshot, or `fallback` when none exist.
    /// This is the fence below which compaction may drop shadowed versions.
    pub fn oldest(&self, fallback: SequenceNumber) -> SequenceNumber {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|s| Arc::strong_count(s) > 1);
        entries.front().map_or(fallback, |s| s.sequence)
    }

    pub fn is_empty(&self) -> bool {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|s| Arc::strong_count(s) > 1);
        entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_falls_back_when_no_snapshots() {
        let list = SnapshotList::new();
        assert_eq!(list.oldest(42), 42);
        assert!(list.is_empty());
    }

    #[test]
    fn oldest_live_snapshot_wins() {
        let list = SnapshotList::new();
        let a = list.acquire(10);
        let b = list.acquire(20);
        assert_eq!(list.oldest(99), 10);

        drop(a);
        assert_eq!(list.oldest(99), 20);

        drop(b);
        assert_eq!(list.oldest(99), 99);
    }

    #[test]
    fn clones_keep_a_snapshot_alive() {
        let list = SnapshotList::new();
        let a = list.acquire(10);
        let a2 = a.clone();
        drop(a);
        assert_eq!(list.oldest(99), 10);
        drop(a2);
        assert_eq!(list.oldest(99), 99);
    }

    #[test]
    fn sequences_are_observable() {
        let list = SnapshotList::new();
        let snapshot = list.acquire(7);
        assert_eq!(snapshot.sequence(), 7);
    }
}
