//! The store handle.
//!
//! `Db` ties the pieces together: the write path serializes mutations
//! through a writer queue into the WAL and active memtable; a dedicated
//! background thread flushes sealed memtables and runs compactions, split
//! across the worker pool when a merge is large enough; readers resolve
//! point and range queries against a pinned `(version, sequence)` pair.
//!
//! Locks, in acquisition order: `state` (memtables, background flags),
//! `versions` (the catalog), then the WAL writer. Critical sections stay
//! short; the only IO under the catalog lock is the manifest commit.

mod iter;
mod recovery;
mod write;

pub use iter::DbIterator;

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::cache::TableCache;
use crate::compaction::pool::{WorkerPool, DEFAULT_WORKERS};
use crate::compaction::worker::CompactionEnv;
use crate::compaction::{split, worker, Compaction};
use crate::config::{Options, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::files::{self, FileKind};
use crate::flock::FileLock;
use crate::iterator::{InternalIterator, LevelIter};
use crate::key::SequenceNumber;
use crate::memtable::Memtable;
use crate::snapshot::{Snapshot, SnapshotList};
use crate::version::edit::{NewFile, VersionEdit};
use crate::version::set::VersionSet;
use crate::wal::LogWriter;

/// An open store. All operations are safe to call from any thread.
pub struct Db {
    pub(crate) shared: Arc<DbShared>,
    bg_thread: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct DbShared {
    pub dir: PathBuf,
    pub opts: Options,
    pub cache: Arc<TableCache>,

    pub versions: Mutex<VersionSet>,
    pub state: Mutex<DbState>,
    /// Wakes the background thread; paired with `state`.
    pub work_available: Condvar,
    /// Wakes writers stalled on background progress; paired with `state`.
    pub work_done: Condvar,

    pub write_queue: Mutex<VecDeque<Arc<write::WriteTicket>>>,
    /// Wakes queued writers; paired with `write_queue`.
    pub write_done: Condvar,

    pub wal: Mutex<Option<LogWriter>>,
    pub snapshots: SnapshotList,
    pub pool: WorkerPool,
    pub shutting_down: Arc<AtomicBool>,
    manual_ids: AtomicU64,

    _lock: FileLock,
}

pub(crate) struct DbState {
    pub mem: Arc<Memtable>,
    pub imm: Option<Arc<Memtable>>,
    /// Number of the active write-ahead log.
    pub log_no: u64,
    /// First WAL failure; poisons every later write until reopen.
    pub background_error: Option<Error>,
    pub bg_scheduled: bool,
    pub manual: Option<ManualCompaction>,
    pub counters: Counters,
}

#[derive(Debug, Clone)]
pub(crate) struct ManualCompaction {
    pub id: u64,
    pub level: usize,
    pub begin: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Counters {
    pub memtable_flushes: u64,
    pub compactions: u64,
    pub split_compactions: u64,
    pub trivial_moves: u64,
}

/// Per-level and engine-wide counters for introspection.
#[derive(Debug, Clone)]
pub struct DbStats {
    pub levels: Vec<LevelStats>,
    pub memtable_bytes: usize,
    pub has_immutable_memtable: bool,
    pub last_sequence: SequenceNumber,
    pub memtable_flushes: u64,
    pub compactions: u64,
    pub split_compactions: u64,
    pub trivial_moves: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LevelStats {
    pub runs: usize,
    pub bytes: u64,
}

impl Db {
    /// Opens the store at `path`, recovering any previous state. See
    /// `db::recovery` for the open-time sequence.
    pub fn open<P: Into<PathBuf>>(path: P, opts: Options) -> Result<Db> {
        recovery::open(path.into(), opts)
    }

    /// Newest value of `key` visible now.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_at(key, None)
    }

    /// Newest value of `key` visible at `snapshot` (or now, when `None`).
    pub fn get_at(&self, key: &[u8], snapshot: Option<&Snapshot>) -> Result<Option<Vec<u8>>> {
        let (mem, imm, version, sequence) = self.shared.read_state(snapshot);

        if let Some(found) = mem.get(key, sequence) {
            return Ok(found);
        }
        if let Some(imm) = &imm {
            if let Some(found) = imm.get(key, sequence) {
                return Ok(found);
            }
        }

        let (found, seek_charge) = version.get(&self.shared.cache, key, sequence)?;
        if version.update_stats(seek_charge) {
            let mut state = self.shared.state.lock()?;
            self.shared.maybe_schedule_compaction(&mut state);
        }
        Ok(found.unwrap_or(None))
    }

    /// A frozen view at the current sequence.
    pub fn snapshot(&self) -> Snapshot {
        let versions = self.shared.versions.lock().unwrap();
        self.shared.snapshots.acquire(versions.last_sequence())
    }

    /// Releases a snapshot. Equivalent to dropping it.
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    /// An iterator over a frozen view: the given snapshot's, or a fresh one.
    pub fn iter(&self, snapshot: Option<&Snapshot>) -> Result<DbIterator> {
        let (mem, imm, version, sequence) = self.shared.read_state(snapshot);

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        children.push(Box::new(mem.iter()));
        if let Some(imm) = &imm {
            children.push(Box::new(imm.iter()));
        }
        // Level-0 runs overlap: one cursor each, newest first. Deeper levels
        // are disjoint: one concatenating cursor per level.
        for file in &version.files[0] {
            let table = self.shared.cache.get(file.file_no)?;
            children.push(Box::new(table.iter()));
        }
        for level in 1..NUM_LEVELS {
            if !version.files[level].is_empty() {
                children.push(Box::new(LevelIter::new(
                    Arc::clone(&self.shared.cache),
                    version.files[level].clone(),
                )));
            }
        }

        Ok(DbIterator::new(children, sequence, version))
    }

    /// Compacts the given user-key range (`None` bounds are open) down the
    /// tree, level by level, including a rewrite of the deepest populated
    /// level so that versions shadowed under a since-released snapshot are
    /// reclaimed wherever they sit.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        // Everything buffered must participate.
        self.force_rotate_memtable()?;
        self.wait_for_flush()?;

        // Deepest level already holding data in the range.
        let max_level = {
            let versions = self.shared.versions.lock()?;
            let current = versions.current();
            (1..NUM_LEVELS)
                .filter(|&level| current.overlap_in_level(level, begin, end))
                .max()
                .unwrap_or(1)
        };

        for level in 0..=max_level.min(NUM_LEVELS - 2) {
            self.shared.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> DbStats {
        let (levels, last_sequence) = {
            let versions = self.shared.versions.lock().unwrap();
            let current = versions.current();
            let levels = (0..NUM_LEVELS)
                .map(|level| LevelStats {
                    runs: current.num_files(level),
                    bytes: current.level_bytes(level),
                })
                .collect();
            (levels, versions.last_sequence())
        };
        let state = self.shared.state.lock().unwrap();
        DbStats {
            levels,
            memtable_bytes: state.mem.approximate_size(),
            has_immutable_memtable: state.imm.is_some(),
            last_sequence,
            memtable_flushes: state.counters.memtable_flushes,
            compactions: state.counters.compactions,
            split_compactions: state.counters.split_compactions,
            trivial_moves: state.counters.trivial_moves,
        }
    }

    /// Stops background work and releases the directory lock. Writes issued
    /// after close fail; reads race the teardown and should stop first.
    /// Called automatically on drop.
    pub fn close(&self) -> Result<()> {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Every waiter re-checks the flag when woken.
        {
            let _state = self.shared.state.lock()?;
            self.shared.work_available.notify_all();
            self.shared.work_done.notify_all();
        }
        {
            let _queue = self.shared.write_queue.lock()?;
            self.shared.write_done.notify_all();
        }
        if let Some(handle) = self.bg_thread.lock()?.take() {
            let _ = handle.join();
        }
        tracing::info!(dir = %self.shared.dir.display(), "store closed");
        Ok(())
    }

    /// Seals the active memtable and starts a fresh one, scheduling a flush.
    fn force_rotate_memtable(&self) -> Result<()> {
        self.write_internal(None, false)
    }

    fn wait_for_flush(&self) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        while state.imm.is_some() {
            if self.shared.shutting_down.load(Ordering::Acquire) {
                return Err(Error::Io("store is shutting down".to_string()));
            }
            if let Some(e) = &state.background_error {
                return Err(e.clone());
            }
            state = self.shared.work_done.wait(state)?;
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("dir", &self.shared.dir).finish()
    }
}

impl DbShared {
    pub(crate) fn new(
        dir: PathBuf,
        opts: Options,
        cache: Arc<TableCache>,
        versions: VersionSet,
        mem: Arc<Memtable>,
        log_no: u64,
        wal: LogWriter,
        lock: FileLock,
    ) -> Self {
        Self {
            dir,
            opts,
            cache,
            versions: Mutex::new(versions),
            state: Mutex::new(DbState {
                mem,
                imm: None,
                log_no,
                background_error: None,
                bg_scheduled: false,
                manual: None,
                counters: Counters::default(),
            }),
            work_available: Condvar::new(),
            work_done: Condvar::new(),
            write_queue: Mutex::new(VecDeque::new()),
            write_done: Condvar::new(),
            wal: Mutex::new(Some(wal)),
            snapshots: SnapshotList::new(),
            pool: WorkerPool::new(DEFAULT_WORKERS),
            shutting_down: Arc::new(AtomicBool::new(false)),
            manual_ids: AtomicU64::new(0),
            _lock: lock,
        }
    }

    /// Pins the read inputs: both memtables, the current version, and the
    /// visibility fence.
    fn read_state(
        &self,
        snapshot: Option<&Snapshot>,
    ) -> (
        Arc<Memtable>,
        Option<Arc<Memtable>>,
        Arc<crate::version::Version>,
        SequenceNumber,
    ) {
        let state = self.state.lock().unwrap();
        let versions = self.versions.lock().unwrap();
        let sequence = snapshot
            .map(|s| s.sequence())
            .unwrap_or_else(|| versions.last_sequence());
        (
            Arc::clone(&state.mem),
            state.imm.clone(),
            versions.current(),
            sequence,
        )
    }

    /// Wakes the background thread when there is work and no run in flight.
    pub(crate) fn maybe_schedule_compaction(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.bg_scheduled || self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let pending = state.imm.is_some()
            || state.manual.is_some()
            || self.versions.lock().unwrap().needs_compaction();
        if pending {
            state.bg_scheduled = true;
            self.work_available.notify_one();
        }
    }

    /// Submits a manual compaction for one level and waits for it.
    fn manual_compact_level(
        self: &Arc<Self>,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let id = self.manual_ids.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut state = self.state.lock()?;
            // One manual request at a time.
            while state.manual.is_some() {
                if self.shutting_down.load(Ordering::Acquire) {
                    return Err(Error::Io("store is shutting down".to_string()));
                }
                state = self.work_done.wait(state)?;
            }
            state.manual = Some(ManualCompaction {
                id,
                level,
                begin: begin.map(|b| b.to_vec()),
                end: end.map(|e| e.to_vec()),
            });
            self.maybe_schedule_compaction(&mut state);
        }

        let mut state = self.state.lock()?;
        while state.manual.as_ref().map(|m| m.id) == Some(id) {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::Io("store is shutting down".to_string()));
            }
            state = self.work_done.wait(state)?;
        }
        Ok(())
    }

    /// Background thread body: sleep until signaled, run one round of
    /// compaction work, repeat until shutdown.
    pub(crate) fn background_main(self: Arc<Self>) {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                while !state.bg_scheduled && !self.shutting_down.load(Ordering::Acquire) {
                    state = self.work_available.wait(state).unwrap();
                }
            }
            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }

            let result = self.background_compaction();
            if let Err(e) = &result {
                tracing::warn!(error = %e, "background compaction failed, backing off");
                // Brief pause so a persistent failure does not spin; the
                // reschedule below retries while work remains.
                std::thread::sleep(std::time::Duration::from_millis(250));
            }

            let mut state = self.state.lock().unwrap();
            state.bg_scheduled = false;
            self.maybe_schedule_compaction(&mut state);
            self.work_done.notify_all();
        }
        tracing::debug!("background compaction thread exiting");
    }

    /// One round of background work, in priority order: flush the sealed
    /// memtable, then a manual request, then size- or seek-driven work.
    pub(crate) fn background_compaction(self: &Arc<Self>) -> Result<()> {
        if self.state.lock()?.imm.is_some() {
            return self.compact_memtable();
        }

        let manual = self.state.lock()?.manual.clone();

        let compaction = {
            let mut versions = self.versions.lock()?;
            match &manual {
                Some(m) => versions.compact_range_inputs(m.level, m.begin.as_deref(), m.end.as_deref()),
                None => versions.pick_compaction(),
            }
        };

        let result = match compaction {
            None => Ok(()),
            // Manual compactions always rewrite: their point is reclaiming
            // shadowed versions, which a pure move cannot do.
            Some(mut c) if manual.is_none() && c.is_trivial_move() => self.apply_trivial_move(&mut c),
            Some(mut c) => self.run_compaction(&mut c),
        };

        if let Some(m) = manual {
            let mut state = self.state.lock()?;
            if state.manual.as_ref().map(|mc| mc.id) == Some(m.id) {
                state.manual = None;
            }
        }

        self.remove_obsolete_files();
        result
    }

    /// Flushes the sealed memtable into a level-0 run and advances the
    /// catalog's log floor past the WAL files it came from.
    fn compact_memtable(self: &Arc<Self>) -> Result<()> {
        let imm = match self.state.lock()?.imm.clone() {
            Some(imm) => imm,
            None => return Ok(()),
        };

        let mut edit = VersionEdit::new();
        let mut written: Option<u64> = None;

        if !imm.is_empty() {
            let file_no = self.versions.lock()?.new_file_number();
            let path = files::run_path(&self.dir, file_no);
            let build = (|| -> Result<NewFile> {
                let mut builder =
                    crate::sstable::builder::TableBuilder::create(&path, &self.opts)?;
                let mut iter = imm.iter();
                iter.seek_to_first();
                while iter.valid() {
                    builder.add(iter.key(), iter.value())?;
                    iter.next();
                }
                let smallest = builder.smallest().expect("non-empty memtable").clone();
                let largest = builder.largest().expect("non-empty memtable").clone();
                let entries = builder.num_entries();
                let size = builder.finish()?;
                tracing::info!(file_no, size, entries, "memtable flushed to level-0 run");
                Ok(NewFile {
                    file_no,
                    size,
                    smallest,
                    largest,
                })
            })();
            match build {
                Ok(file) => {
                    written = Some(file.file_no);
                    edit.add_file(0, file);
                }
                Err(e) => {
                    let _ = fs::remove_file(&path);
                    return Err(e);
                }
            }
        }

        // Install while holding the state lock so no reader can observe the
        // new run and the still-present sealed memtable at once.
        let mut state = self.state.lock()?;
        edit.set_log_no(state.log_no);
        let mut versions = self.versions.lock()?;
        match versions.log_and_apply(&mut edit) {
            Ok(()) => {
                state.imm = None;
                state.counters.memtable_flushes += 1;
                Ok(())
            }
            Err(e) => {
                drop(versions);
                drop(state);
                if let Some(file_no) = written {
                    self.cache.evict(file_no);
                    let _ = fs::remove_file(files::run_path(&self.dir, file_no));
                }
                Err(e)
            }
        }
    }

    fn apply_trivial_move(self: &Arc<Self>, c: &mut Compaction) -> Result<()> {
        let file = Arc::clone(&c.inputs[0][0]);
        c.edit.delete_file(c.level, file.file_no);
        c.edit.add_file(
            c.target_level(),
            NewFile {
                file_no: file.file_no,
                size: file.size,
                smallest: file.smallest.clone(),
                largest: file.largest.clone(),
            },
        );

        let mut state = self.state.lock()?;
        let mut versions = self.versions.lock()?;
        versions.log_and_apply(&mut c.edit)?;
        state.counters.trivial_moves += 1;
        tracing::info!(
            file_no = file.file_no,
            from_level = c.level,
            to_level = c.target_level(),
            size = file.size,
            "trivial move"
        );
        Ok(())
    }

    /// Executes a merging compaction, split across the pool when the plan
    /// allows, and installs the resulting edit.
    fn run_compaction(self: &Arc<Self>, c: &mut Compaction) -> Result<()> {
        let env = CompactionEnv {
            dir: self.dir.clone(),
            opts: self.opts.clone(),
            cache: Arc::clone(&self.cache),
        };
        let smallest_snapshot = self
            .snapshots
            .oldest(self.versions.lock()?.last_sequence());

        let alloc: Arc<dyn Fn() -> u64 + Send + Sync> = {
            let shared = Arc::clone(self);
            Arc::new(move || shared.versions.lock().unwrap().new_file_number())
        };

        let mut was_split = false;
        match split::plan_shards(c, &self.opts, self.pool.size()) {
            Some(shards) => {
                tracing::info!(
                    level = c.level,
                    shards = shards.len(),
                    input_bytes = c.total_input_bytes(),
                    "dispatching split compaction"
                );
                match split::run_split(
                    &env,
                    c,
                    shards,
                    &self.pool,
                    smallest_snapshot,
                    Arc::clone(&alloc),
                    Arc::clone(&self.shutting_down),
                ) {
                    Ok(outputs) => {
                        was_split = true;
                        c.add_input_deletions();
                        let target = c.target_level();
                        for output in outputs {
                            c.edit.add_file(target, output);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "split compaction failed, retrying classically");
                        worker::compact(
                            &env,
                            c,
                            smallest_snapshot,
                            alloc.as_ref(),
                            &self.shutting_down,
                        )?;
                    }
                }
            }
            None => {
                worker::compact(
                    &env,
                    c,
                    smallest_snapshot,
                    alloc.as_ref(),
                    &self.shutting_down,
                )?;
            }
        }

        let install = {
            let mut state = self.state.lock()?;
            let mut versions = self.versions.lock()?;
            let install = versions.log_and_apply(&mut c.edit);
            if install.is_ok() {
                state.counters.compactions += 1;
                if was_split {
                    state.counters.split_compactions += 1;
                }
            }
            install
        };
        if let Err(e) = install {
            // The attempted runs never became visible; unlink them.
            for (_, file) in &c.edit.added_files {
                self.cache.evict(file.file_no);
                let _ = fs::remove_file(files::run_path(&self.dir, file.file_no));
            }
            return Err(e);
        }
        Ok(())
    }

    /// Deletes files no live version references: old WALs, the previous
    /// manifest, compacted-away runs, stray temp files.
    pub(crate) fn remove_obsolete_files(&self) {
        let (live, log_floor, manifests) = {
            let versions = match self.versions.lock() {
                Ok(versions) => versions,
                Err(_) => return,
            };
            (
                versions.live_files(),
                versions.log_number(),
                versions.live_manifest_files(),
            )
        };

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let keep = match files::parse_file_name(name) {
                Some((FileKind::Wal, no)) => no >= log_floor,
                Some((FileKind::Manifest, no)) => manifests.contains(&no),
                Some((FileKind::Run, no)) => {
                    if !live.contains(&no) {
                        self.cache.evict(no);
                        false
                    } else {
                        true
                    }
                }
                Some((FileKind::Temp, _)) => false,
                Some((FileKind::Current, _)) | Some((FileKind::Lock, _)) => true,
                // Not ours; leave it alone.
                None => true,
            };
            if !keep {
                tracing::debug!(file = name, "removing obsolete file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
