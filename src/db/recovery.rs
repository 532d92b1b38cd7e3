//! Open-time recovery.
//!
//! Order of operations: lock the directory, create the initial catalog if
//! this is a new database, replay the manifest named by `CURRENT`, replay
//! every write-ahead log at or above the catalog's log floor into fresh
//! memtables (flushing when one fills), rotate or reuse the final log,
//! commit the recovered state through a fresh manifest, then sweep orphan
//! files left by whatever crash preceded us.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::batch::Batch;
use crate::cache::TableCache;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::files::{self, FileKind};
use crate::flock::FileLock;
use crate::key::SequenceNumber;
use crate::memtable::Memtable;
use crate::sstable::builder::TableBuilder;
use crate::version::edit::{NewFile, VersionEdit};
use crate::version::set::VersionSet;
use crate::wal::{LogReader, LogWriter};

use super::{Db, DbShared};

pub(crate) fn open(dir: PathBuf, opts: Options) -> Result<Db> {
    if opts.create_if_missing {
        fs::create_dir_all(&dir)?;
    } else if !dir.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "{} does not exist and create_if_missing is off",
            dir.display()
        )));
    }

    let lock = FileLock::lock(files::lock_path(&dir))
        .map_err(|e| Error::Io(format!("cannot lock {}: {e}", dir.display())))?;

    let current_exists = files::current_path(&dir).exists();
    if current_exists && opts.error_if_exists {
        return Err(Error::InvalidArgument(format!(
            "{} already exists and error_if_exists is on",
            dir.display()
        )));
    }
    if !current_exists {
        if !opts.create_if_missing {
            return Err(Error::InvalidArgument(format!(
                "{} has no database and create_if_missing is off",
                dir.display()
            )));
        }
        tracing::info!(dir = %dir.display(), "creating new database");
        VersionSet::create_new(&dir)?;
    }

    let cache = Arc::new(TableCache::new(dir.clone(), opts.clone()));
    let mut versions = VersionSet::new(dir.clone(), opts.clone());
    versions.recover()?;

    // Logs at or above the catalog's floor still hold batches no run
    // covers.
    let mut logs: Vec<u64> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(files::parse_file_name))
        .filter_map(|(kind, no)| match kind {
            FileKind::Wal if no >= versions.log_number() => Some(no),
            _ => None,
        })
        .collect();
    logs.sort_unstable();

    let mut edit = VersionEdit::new();
    let mut mem = Arc::new(Memtable::new());
    let mut max_sequence: SequenceNumber = 0;
    let mut flushed_during_replay = false;
    let mut last_log_clean = true;

    for &log_no in &logs {
        versions.mark_file_number_used(log_no);
        let path = files::wal_path(&dir, log_no);
        let mut reader = LogReader::open(&path, opts.paranoid_checks)?;
        let mut records = 0usize;
        while let Some(payload) = reader.read_record()? {
            let batch = Batch::decode(&payload)?;
            let base = batch.sequence();
            for (offset, (kind, key, value)) in batch.iter().enumerate() {
                mem.insert(base + offset as u64, kind, key, value)?;
            }
            if batch.count() > 0 {
                let last = base + batch.count() as u64 - 1;
                max_sequence = max_sequence.max(last);
            }
            records += 1;

            if mem.approximate_size() > opts.write_buffer_size {
                flushed_during_replay = true;
                write_level0_table(&dir, &opts, &mut versions, &mem, &mut edit)?;
                mem = Arc::new(Memtable::new());
            }
        }
        last_log_clean = !reader.tail_truncated();
        tracing::info!(log_no, records, "replayed write-ahead log");
    }

    // Either keep appending to the final log or flush what it held and
    // rotate.
    let (log_no, wal_writer, mem) = if opts.reuse_logs
        && !logs.is_empty()
        && last_log_clean
        && !flushed_during_replay
    {
        let last = *logs.last().expect("non-empty");
        let writer = LogWriter::open_append(files::wal_path(&dir, last))?;
        tracing::info!(log_no = last, "reusing write-ahead log");
        (last, writer, mem)
    } else {
        if !mem.is_empty() {
            write_level0_table(&dir, &opts, &mut versions, &mem, &mut edit)?;
        }
        let new_log = versions.new_file_number();
        let writer = LogWriter::create(files::wal_path(&dir, new_log))?;
        (new_log, writer, Arc::new(Memtable::new()))
    };
    edit.set_log_no(log_no);

    if max_sequence > versions.last_sequence() {
        versions.set_last_sequence(max_sequence);
    }

    // Commits the recovered state into a fresh manifest and repoints
    // CURRENT at it.
    versions.log_and_apply(&mut edit)?;

    let shared = Arc::new(DbShared::new(
        dir, opts, cache, versions, mem, log_no, wal_writer, lock,
    ));

    let bg = {
        let shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("emberdb-compact".to_string())
            .spawn(move || shared.background_main())
            .map_err(|e| Error::Io(format!("cannot spawn compaction thread: {e}")))?
    };

    let db = Db {
        shared,
        bg_thread: Mutex::new(Some(bg)),
    };

    db.shared.remove_obsolete_files();
    {
        let mut state = db.shared.state.lock()?;
        db.shared.maybe_schedule_compaction(&mut state);
    }
    Ok(db)
}

/// Flushes a replayed memtable straight to a level-0 run.
fn write_level0_table(
    dir: &Path,
    opts: &Options,
    versions: &mut VersionSet,
    mem: &Arc<Memtable>,
    edit: &mut VersionEdit,
) -> Result<()> {
    use crate::iterator::InternalIterator;

    if mem.is_empty() {
        return Ok(());
    }
    let file_no = versions.new_file_number();
    let path = files::run_path(dir, file_no);
    let result = (|| -> Result<()> {
        let mut builder = TableBuilder::create(&path, opts)?;
        let mut iter = mem.iter();
        iter.seek_to_first();
        while iter.valid() {
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        let smallest = builder.smallest().expect("non-empty memtable").clone();
        let largest = builder.largest().expect("non-empty memtable").clone();
        let size = builder.finish()?;
        tracing::info!(file_no, size, "recovered memtable flushed to level-0 run");
        edit.add_file(
            0,
            NewFile {
                file_no,
                size,
                smallest,
                largest,
            },
        );
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&path);
    }
    result
}
