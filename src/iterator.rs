//! Iterator machinery.
//!
//! Every data source exposes the same small cursor capability set through
//! [`InternalIterator`]: the memtable, a single run, the per-level run
//! concatenator, and the heap merge are the closed set of variants. The
//! merge composes children under one total order; the user-facing iterator
//! in `db::iter` layers snapshot filtering and tombstone suppression on top.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::cache::TableCache;
use crate::error::{Error, Result};
use crate::key::InternalKey;
use crate::sstable::reader::TableIter;
use crate::version::RunMeta;

/// Bidirectional cursor over internal keys.
///
/// `key`/`value` may only be called while `valid()`; `next`/`prev` step the
/// cursor and may invalidate it at either end. Errors encountered while
/// stepping park the cursor invalid and are reported through `status`.
pub trait InternalIterator: Send {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    /// Positions at the first entry with key >= `target`.
    fn seek(&mut self, target: &InternalKey);
    fn next(&mut self);
    fn prev(&mut self);
    fn key(&self) -> &InternalKey;
    fn value(&self) -> &[u8];
    fn status(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

struct HeapEntry {
    key: InternalKey,
    index: usize,
    reverse: bool,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.index == other.index
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops its greatest element. Forward iteration wants the
        // smallest key on top, reverse the largest; equal keys break toward
        // the lower child index (the newer source).
        let by_key = if self.reverse {
            self.key.cmp(&other.key)
        } else {
            other.key.cmp(&self.key)
        };
        by_key.then_with(|| other.index.cmp(&self.index))
    }
}

/// Heap merge of N child cursors into one ordered stream.
///
/// The winning child stays out of the heap while it is current; stepping
/// advances it and re-inserts it. Switching direction repositions every
/// non-current child around the current key, mirroring the key in both
/// traversal orders.
pub struct MergeIterator {
    children: Vec<Box<dyn InternalIterator>>,
    heap: BinaryHeap<HeapEntry>,
    current: Option<usize>,
    direction: Direction,
}

impl MergeIterator {
    pub fn new(children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            children,
            heap: BinaryHeap::new(),
            current: None,
            direction: Direction::Forward,
        }
    }

    fn rebuild_heap(&mut self, skip: Option<usize>) {
        self.heap.clear();
        let reverse = self.direction == Direction::Reverse;
        for (index, child) in self.children.iter().enumerate() {
            if Some(index) == skip || !child.valid() {
                continue;
            }
            self.heap.push(HeapEntry {
                key: child.key().clone(),
                index,
                reverse,
            });
        }
    }

    fn pop_current(&mut self) {
        self.current = self.heap.pop().map(|e| e.index);
    }

    fn reinsert(&mut self, index: usize) {
        if self.children[index].valid() {
            self.heap.push(HeapEntry {
                key: self.children[index].key().clone(),
                index,
                reverse: self.direction == Direction::Reverse,
            });
        }
    }
}

impl InternalIterator for MergeIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.rebuild_heap(None);
        self.pop_current();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.rebuild_heap(None);
        self.pop_current();
    }

    fn seek(&mut self, target: &InternalKey) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.rebuild_heap(None);
        self.pop_current();
    }

    fn next(&mut self) {
        let cur = match self.current {
            Some(cur) => cur,
            None => return,
        };

        if self.direction == Direction::Reverse {
            // Children other than the current one sit at keys < current.
            // Put each at its first key > current so forward stepping sees
            // every key exactly once.
            let key = self.children[cur].key().clone();
            for index in 0..self.children.len() {
                if index == cur {
                    continue;
                }
                let child = &mut self.children[index];
                child.seek(&key);
                if child.valid() && *child.key() == key {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
            self.rebuild_heap(Some(cur));
        }

        self.children[cur].next();
        self.reinsert(cur);
        self.pop_current();
    }

    fn prev(&mut self) {
        let cur = match self.current {
            Some(cur) => cur,
            None => return,
        };

        if self.direction == Direction::Forward {
            // Children other than the current one sit at keys > current.
            // Put each at its last key < current.
            let key = self.children[cur].key().clone();
            for index in 0..self.children.len() {
                if index == cur {
                    continue;
                }
                let child = &mut self.children[index];
                child.seek(&key);
                if child.valid() {
                    child.prev();
                } else {
                    // Every key in this child is < current.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
            self.rebuild_heap(Some(cur));
        }

        self.children[cur].prev();
        self.reinsert(cur);
        self.pop_current();
    }

    fn key(&self) -> &InternalKey {
        self.children[self.current.expect("iterator not valid")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("iterator not valid")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

/// Concatenating cursor over one level's runs (level >= 1 only, where runs
/// are key-disjoint and sorted). Opens one run at a time through the table
/// cache.
pub struct LevelIter {
    cache: Arc<TableCache>,
    files: Vec<Arc<RunMeta>>,
    index: usize,
    data: Option<TableIter>,
    error: Option<Error>,
}

impl LevelIter {
    pub fn new(cache: Arc<TableCache>, files: Vec<Arc<RunMeta>>) -> Self {
        let index = files.len();
        Self {
            cache,
            files,
            index,
            data: None,
            error: None,
        }
    }

    /// Index of the first run whose largest key is >= `target`.
    fn find_file(&self, target: &InternalKey) -> usize {
        self.files
            .partition_point(|f| f.largest < *target)
    }

    fn load(&mut self) -> bool {
        if self.index >= self.files.len() {
            self.data = None;
            return false;
        }
        match self.cache.get(self.files[self.index].file_no) {
            Ok(table) => {
                self.data = Some(table.iter());
                true
            }
            Err(e) => {
                self.error = Some(e);
                self.data = None;
                false
            }
        }
    }

    fn skip_empty_forward(&mut self) {
        while self.data.as_ref().map_or(false, |d| !d.valid()) {
            if self.data.as_ref().map_or(false, |d| d.status().is_err()) {
                break;
            }
            if self.index + 1 >= self.files.len() {
                self.data = None;
                break;
            }
            self.index += 1;
            if self.load() {
                if let Some(data) = &mut self.data {
                    data.seek_to_first();
                }
            }
        }
    }

    fn skip_empty_backward(&mut self) {
        while self.data.as_ref().map_or(false, |d| !d.valid()) {
            if self.data.as_ref().map_or(false, |d| d.status().is_err()) {
                break;
            }
            if self.index == 0 {
                self.data = None;
                break;
            }
            self.index -= 1;
            if self.load() {
                if let Some(data) = &mut self.data {
                    data.seek_to_last();
                }
            }
        }
    }
}

impl InternalIterator for LevelIter {
    fn valid(&self) -> bool {
        self.data.as_ref().map_or(false, |d| d.valid())
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        if self.load() {
            if let Some(data) = &mut self.data {
                data.seek_to_first();
            }
            self.skip_empty_forward();
        }
    }

    fn seek_to_last(&mut self) {
        if self.files.is_empty() {
            self.data = None;
            return;
        }
        self.index = self.files.len() - 1;
        if self.load() {
            if let Some(data) = &mut self.data {
                data.seek_to_last();
            }
            self.skip_empty_backward();
        }
    }

    fn seek(&mut self, target: &InternalKey) {
        self.index = self.find_file(target);
        if self.index >= self.files.len() {
            self.data = None;
            return;
        }
        if self.load() {
            if let Some(data) = &mut self.data {
                data.seek(target);
            }
            self.skip_empty_forward();
        }
    }

    fn next(&mut self) {
        if let Some(data) = &mut self.data {
            data.next();
        }
        self.skip_empty_forward();
    }

    fn prev(&mut self) {
        if let Some(data) = &mut self.data {
            data.prev();
        }
        self.skip_empty_backward();
    }

    fn key(&self) -> &InternalKey {
        self.data.as_ref().expect("iterator not valid").key()
    }

    fn value(&self) -> &[u8] {
        self.data.as_ref().expect("iterator not valid").value()
    }

    fn status(&self) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        if let Some(data) = &self.data {
            data.status()?;
        }
        Ok(())
    }
}
