//! Streaming compaction merge.
//!
//! One merge loop serves both execution strategies: the classical worker
//! runs it over the full input range, split shards run it clamped to their
//! key interval. The loop consumes internal keys in ascending order,
//! applies the snapshot fence, and cuts output runs on size and on
//! grandparent overlap.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::TableCache;
use crate::compaction::Compaction;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::files;
use crate::iterator::{InternalIterator, LevelIter, MergeIterator};
use crate::key::{InternalKey, SequenceNumber};
use crate::sstable::builder::TableBuilder;
use crate::version::edit::NewFile;

/// Everything a merge needs besides the plan itself. Cheap to clone into
/// shard jobs.
#[derive(Clone)]
pub(crate) struct CompactionEnv {
    pub dir: PathBuf,
    pub opts: Options,
    pub cache: Arc<TableCache>,
}

/// Clamp of a merge to a user-key interval `[lo, hi)`; `None` bounds are
/// open. Full compactions use `MergeBounds::all()`.
#[derive(Debug, Clone, Default)]
pub(crate) struct MergeBounds {
    pub lo: Option<Vec<u8>>,
    pub hi: Option<Vec<u8>>,
}

impl MergeBounds {
    pub fn all() -> Self {
        Self::default()
    }
}

/// Allocator for output file numbers, backed by the catalog.
pub(crate) type FileNoAlloc = dyn Fn() -> u64 + Send + Sync;

/// Builds the merged input cursor for a compaction: at level 0 one cursor
/// per run (they overlap), above that a single concatenating cursor per
/// level.
pub(crate) fn input_iterator(env: &CompactionEnv, c: &Compaction) -> Result<MergeIterator> {
    let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
    if c.level == 0 {
        for file in &c.inputs[0] {
            let table = env.cache.get(file.file_no)?;
            children.push(Box::new(table.iter()));
        }
    } else {
        children.push(Box::new(LevelIter::new(
            Arc::clone(&env.cache),
            c.inputs[0].clone(),
        )));
    }
    if !c.inputs[1].is_empty() {
        children.push(Box::new(LevelIter::new(
            Arc::clone(&env.cache),
            c.inputs[1].clone(),
        )));
    }
    Ok(MergeIterator::new(children))
}

/// Runs the merge over `c`'s inputs restricted to `bounds` and returns the
/// output runs written to the target level.
///
/// For every user key, the newest version above `smallest_snapshot` and the
/// newest at-or-below it survive; everything older is dropped. Tombstones
/// are additionally dropped once no deeper level can hold the key.
///
/// Cancellation is cooperative at output-file boundaries. On any error all
/// outputs written so far are unlinked before returning.
pub(crate) fn run_merge(
    env: &CompactionEnv,
    c: &mut Compaction,
    bounds: &MergeBounds,
    smallest_snapshot: SequenceNumber,
    alloc: &FileNoAlloc,
    shutdown: &AtomicBool,
) -> Result<Vec<NewFile>> {
    let mut outputs: Vec<NewFile> = Vec::new();
    let mut builder: Option<(u64, TableBuilder)> = None;

    let result = (|| -> Result<()> {
        let mut iter = input_iterator(env, c)?;
        match &bounds.lo {
            Some(lo) => iter.seek(&InternalKey::for_lookup(lo, crate::key::MAX_SEQUENCE)),
            None => iter.seek_to_first(),
        }

        let mut last_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = u64::MAX;

        while iter.valid() {
            let key = iter.key().clone();
            if let Some(hi) = &bounds.hi {
                if key.user_key.as_slice() >= hi.as_slice() {
                    break;
                }
            }

            let first_occurrence = last_user_key.as_deref() != Some(key.user_key.as_slice());
            if first_occurrence {
                last_user_key = Some(key.user_key.clone());
                last_sequence_for_key = u64::MAX;
            } else {
                // The merge order guarantees strictly decreasing sequences
                // within one user key.
                debug_assert!(key.sequence < last_sequence_for_key);
            }

            let drop = if last_sequence_for_key <= smallest_snapshot {
                // A newer version at-or-below the fence already survived;
                // this one is invisible to every snapshot.
                true
            } else {
                key.kind == crate::key::ValueKind::Tombstone
                    && key.sequence <= smallest_snapshot
                    && c.is_base_level_for_key(&key.user_key)
            };
            last_sequence_for_key = key.sequence;

            if !drop {
                if builder.is_some() && c.should_stop_before(&key) {
                    finish_output(&mut builder, &mut outputs)?;
                    if shutdown.load(Ordering::Acquire) {
                        return Err(Error::Io("shutdown during compaction".to_string()));
                    }
                }
                if builder.is_none() {
                    let file_no = alloc();
                    let path = files::run_path(&env.dir, file_no);
                    builder = Some((file_no, TableBuilder::create(path, &env.opts)?));
                }
                let (_, b) = builder.as_mut().expect("builder just ensured");
                b.add(&key, iter.value())?;
                if b.estimated_size() >= c.max_output_file_size() {
                    finish_output(&mut builder, &mut outputs)?;
                    if shutdown.load(Ordering::Acquire) {
                        return Err(Error::Io("shutdown during compaction".to_string()));
                    }
                }
            }

            iter.next();
        }
        iter.status()?;
        finish_output(&mut builder, &mut outputs)?;
        Ok(())
    })();

    match result {
        Ok(()) => Ok(outputs),
        Err(e) => {
            if let Some((file_no, b)) = builder.take() {
                let path = b.path().to_path_buf();
                drop(b);
                let _ = fs::remove_file(path);
                env.cache.evict(file_no);
            }
            discard_outputs(env, &outputs);
            Err(e)
        }
    }
}

/// Finishes the open output run, if any, and records its metadata.
fn finish_output(
    builder: &mut Option<(u64, TableBuilder)>,
    outputs: &mut Vec<NewFile>,
) -> Result<()> {
    let (file_no, b) = match builder.take() {
        Some(open) => open,
        None => return Ok(()),
    };
    if b.num_entries() == 0 {
        let path = b.path().to_path_buf();
        drop(b);
        let _ = fs::remove_file(path);
        return Ok(());
    }
    let smallest = b.smallest().expect("non-empty output").clone();
    let largest = b.largest().expect("non-empty output").clone();
    let size = b.finish()?;
    tracing::debug!(file_no, size, "compaction output run finished");
    outputs.push(NewFile {
        file_no,
        size,
        smallest,
        largest,
    });
    Ok(())
}

/// Unlinks runs produced by an abandoned compaction attempt.
pub(crate) fn discard_outputs(env: &CompactionEnv, outputs: &[NewFile]) {
    for output in outputs {
        env.cache.evict(output.file_no);
        let _ = fs::remove_file(files::run_path(&env.dir, output.file_no));
    }
}

/// Classical worker: merge the whole input set and fill in the edit.
pub(crate) fn compact(
    env: &CompactionEnv,
    c: &mut Compaction,
    smallest_snapshot: SequenceNumber,
    alloc: &FileNoAlloc,
    shutdown: &AtomicBool,
) -> Result<()> {
    let input_bytes = c.total_input_bytes();
    let outputs = run_merge(env, c, &MergeBounds::all(), smallest_snapshot, alloc, shutdown)?;

    let output_bytes: u64 = outputs.iter().map(|o| o.size).sum();
    tracing::info!(
        level = c.level,
        base_inputs = c.inputs[0].len(),
        parent_inputs = c.inputs[1].len(),
        outputs = outputs.len(),
        input_bytes,
        output_bytes,
        "compaction merge complete"
    );

    c.add_input_deletions();
    let target = c.target_level();
    for output in outputs {
        c.edit.add_file(target, output);
    }
    Ok(())
}
