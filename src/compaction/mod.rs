//! Compaction planning and execution.
//!
//! The [`Compaction`] plan is produced by the catalog (`version::set`): the
//! chosen level, its input runs, the overlapping runs one level down, and
//! the grandparent runs used to bound output sizes. Execution is either the
//! classical streaming merge in [`worker`] or the sharded variant in
//! [`split`], which fans disjoint key ranges out over the fixed pool in
//! [`pool`].

pub mod pool;
pub mod split;
pub mod worker;

use std::sync::Arc;

use crate::config::{Options, NUM_LEVELS};
use crate::key::InternalKey;
use crate::version::edit::VersionEdit;
use crate::version::{key_range, total_file_size, RunMeta, Version};

/// A planned compaction of `level` into `level + 1`.
pub struct Compaction {
    pub level: usize,
    /// `inputs[0]` holds the runs from `level`, `inputs[1]` the overlapping
    /// runs from `level + 1`.
    pub inputs: [Vec<Arc<RunMeta>>; 2],
    /// Runs at `level + 2` overlapping the compaction's range.
    pub grandparents: Vec<Arc<RunMeta>>,
    /// Edit under construction: input deletions, output additions, and the
    /// advanced compaction pointer.
    pub edit: VersionEdit,
    /// The version the inputs were selected from, pinned so the input files
    /// stay live for the duration.
    pub input_version: Option<Arc<Version>>,

    max_file_size: u64,
    max_grandparent_overlap: u64,

    // Streaming state for output cuts against the grandparents.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Per-level scan positions for the tombstone base-level test. Keys are
    // consumed in ascending order, so each pointer only moves forward.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub fn new(opts: &Options, level: usize) -> Self {
        Self {
            level,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            edit: VersionEdit::new(),
            input_version: None,
            max_file_size: opts.max_file_size,
            max_grandparent_overlap: opts.max_grandparent_overlap_bytes(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub fn target_level(&self) -> usize {
        self.level + 1
    }

    pub fn max_output_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn total_input_bytes(&self) -> u64 {
        total_file_size(&self.inputs[0]) + total_file_size(&self.inputs[1])
    }

    /// Smallest and largest internal key across the level-`level` inputs.
    pub fn base_range(&self) -> (InternalKey, InternalKey) {
        key_range(&self.inputs[0])
    }

    /// Smallest and largest internal key across all inputs.
    pub fn total_range(&self) -> (InternalKey, InternalKey) {
        let mut all: Vec<Arc<RunMeta>> = self.inputs[0].clone();
        all.extend(self.inputs[1].iter().cloned());
        key_range(&all)
    }

    /// A move is trivial when a single input run can be reparented into the
    /// next level without rewriting: nothing overlaps it there, and its
    /// grandparent overlap stays under the cap so the move does not set up
    /// an oversized future compaction.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Records every input run as deleted in the edit.
    pub fn add_input_deletions(&mut self) {
        for (which, level) in [(0, self.level), (1, self.target_level())] {
            for file in &self.inputs[which] {
                self.edit.delete_file(level, file.file_no);
            }
        }
    }

    /// True when no run below the compaction's output level can contain
    /// `user_key`, which makes it safe to drop a tombstone for that key.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let version = match &self.input_version {
            Some(version) => Arc::clone(version),
            None => return false,
        };
        for level in self.target_level() + 1..NUM_LEVELS {
            let files = &version.files[level];
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if user_key <= file.largest.user_key.as_slice() {
                    if user_key >= file.smallest.user_key.as_slice() {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// True when the current output should be cut before writing `key`,
    /// because its accumulated range already overlaps too much of the
    /// grandparent level.
    pub fn should_stop_before(&mut self, key: &InternalKey) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && *key > self.grandparents[self.grandparent_index].largest
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compaction")
            .field("level", &self.level)
            .field("base_inputs", &self.inputs[0].len())
            .field("parent_inputs", &self.inputs[1].len())
            .field("grandparents", &self.grandparents.len())
            .finish()
    }
}
