//! User-facing iterator.
//!
//! Wraps the heap merge of memtables and runs, fixed to a `(version,
//! sequence)` pair taken at creation, and collapses internal keys into the
//! user's view: entries above the sequence fence are invisible, shadowed
//! versions are skipped, tombstones hide everything older for their key.
//!
//! Moving forward the inner cursor rests on the entry being exposed.
//! Moving backward it rests just before the exposed key's entries, and the
//! exposed pair is carried in `saved_key`/`saved_value`; backward scans of
//! one key visit versions oldest to newest, so the last visible one
//! observed wins.

use std::sync::Arc;

use crate::error::Result;
use crate::iterator::{InternalIterator, MergeIterator};
use crate::key::{InternalKey, SequenceNumber, ValueKind};
use crate::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

pub struct DbIterator {
    inner: MergeIterator,
    sequence: SequenceNumber,
    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    /// Pins the catalog snapshot so its runs stay on disk for the
    /// iterator's lifetime.
    _version: Arc<Version>,
}

impl DbIterator {
    pub(crate) fn new(
        children: Vec<Box<dyn InternalIterator>>,
        sequence: SequenceNumber,
        version: Arc<Version>,
    ) -> Self {
        Self {
            inner: MergeIterator::new(children),
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            _version: version,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current user key. Only while `valid`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => &self.inner.key().user_key,
            Direction::Reverse => &self.saved_key,
        }
    }

    /// Current value. Only while `valid`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    pub fn status(&self) -> Result<()> {
        self.inner.status()
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Positions at the first user key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        self.inner
            .seek(&InternalKey::for_lookup(target, self.sequence));
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            // The inner cursor sits before the entries of saved_key; hop
            // back onto its first entry, then skip past the whole key.
            self.direction = Direction::Forward;
            if !self.inner.valid() {
                self.inner.seek_to_first();
            } else {
                self.inner.next();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key still holds the key to step over.
        } else {
            self.saved_key.clear();
            self.saved_key.extend_from_slice(&self.inner.key().user_key);
        }

        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // Walk the inner cursor back off every entry of the current
            // key; it ends on the predecessor territory.
            self.saved_key.clear();
            self.saved_key.extend_from_slice(&self.inner.key().user_key);
            loop {
                self.inner.prev();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self.inner.key().user_key < self.saved_key {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    /// Forward scan for the next visible, non-deleted user entry. With
    /// `skipping`, entries for `saved_key` (and anything smaller) are
    /// passed over first.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert_eq!(self.direction, Direction::Forward);
        while self.inner.valid() {
            let key = self.inner.key();
            if key.sequence <= self.sequence {
                match key.kind {
                    ValueKind::Tombstone => {
                        // Everything older with this user key is deleted.
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(&key.user_key);
                        skipping = true;
                    }
                    ValueKind::Value => {
                        if skipping && key.user_key.as_slice() <= self.saved_key.as_slice() {
                            // Shadowed by a newer entry already seen.
                        } else {
                            self.valid = true;
                            self.saved_key.clear();
                            return;
                        }
                    }
                }
            }
            self.inner.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Backward scan. Visits each key's versions oldest to newest, keeping
    /// the newest visible one in `saved_*`; stops once the cursor moves
    /// onto a smaller key while holding a live value.
    fn find_prev_user_entry(&mut self) {
        debug_assert_eq!(self.direction, Direction::Reverse);

        let mut kind = ValueKind::Tombstone;
        while self.inner.valid() {
            let key = self.inner.key();
            if key.sequence <= self.sequence {
                if kind != ValueKind::Tombstone && key.user_key < self.saved_key {
                    // The saved entry is the answer; the cursor now rests
                    // before its key's entries.
                    break;
                }
                kind = key.kind;
                match kind {
                    ValueKind::Tombstone => {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    }
                    ValueKind::Value => {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(&key.user_key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(self.inner.value());
                    }
                }
            }
            self.inner.prev();
        }

        if kind == ValueKind::Tombstone {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}
