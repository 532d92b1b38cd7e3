//! Run reader cache.
//!
//! Maps `file_no -> Arc<Table>` with a capacity taken from
//! `max_open_files`. Readers that hold an `Arc` keep using their table after
//! eviction; the cache only bounds how many file handles sit warm. Files are
//! explicitly evicted before they are unlinked so a deleted run never leaves
//! a cached handle behind.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::Options;
use crate::error::Result;
use crate::files;
use crate::sstable::reader::Table;

struct CacheInner {
    map: HashMap<u64, Arc<Table>>,
    // Recency queue, least-recent at the front.
    lru: VecDeque<u64>,
}

pub struct TableCache {
    dir: PathBuf,
    opts: Options,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl TableCache {
    pub fn new(dir: PathBuf, opts: Options) -> Self {
        let capacity = opts.max_open_files.max(16);
        Self {
            dir,
            opts,
            capacity,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                lru: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, file_no: u64) -> Result<Arc<Table>> {
        {
            let mut inner = self.inner.lock()?;
            if let Some(table) = inner.map.get(&file_no).cloned() {
                touch(&mut inner.lru, file_no);
                return Ok(table);
            }
        }

        // Open outside the lock; a racing open of the same file resolves by
        // last-insert-wins, which is harmless for immutable files.
        let path = files::run_path(&self.dir, file_no);
        let table = Arc::new(Table::open(&path, &self.opts)?);

        let mut inner = self.inner.lock()?;
        inner.map.insert(file_no, Arc::clone(&table));
        touch(&mut inner.lru, file_no);
        while inner.map.len() > self.capacity {
            match inner.lru.pop_front() {
                Some(old) => {
                    inner.map.remove(&old);
                }
                None => break,
            }
        }
        Ok(table)
    }

    /// Drops the cached handle for a run that is about to be unlinked.
    pub fn evict(&self, file_no: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.map.remove(&file_no);
            inner.lru.retain(|&no| no != file_no);
        }
    }

    #[cfg(test)]
    fn cached_count(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }
}

fn touch(lru: &mut VecDeque<u64>, file_no: u64) {
    lru.retain(|&no| no != file_no);
    lru.push_back(file_no);
}
