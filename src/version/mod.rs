//! The versioned catalog.
//!
//! A [`Version`] is an immutable snapshot of the level structure: which runs
//! exist at which level, plus the scoring that tells the scheduler where
//! compaction pressure is. Versions form a chain held by the
//! [`set::VersionSet`]; readers pin one with an `Arc` clone and never see it
//! change. Runs referenced by any live version are never unlinked.

pub mod edit;
pub mod set;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use crate::cache::TableCache;
use crate::config::{Options, L0_COMPACTION_TRIGGER, NUM_LEVELS};
use crate::error::Result;
use crate::key::{InternalKey, SequenceNumber, ValueKind};
use crate::version::edit::{NewFile, VersionEdit};

/// Metadata of one immutable run.
#[derive(Debug)]
pub struct RunMeta {
    pub file_no: u64,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Point reads that had to pass over this run without an answer. When
    /// the budget runs out the run becomes a seek-driven compaction
    /// candidate, amortizing the wasted seeks into one merge.
    allowed_seeks: AtomicI64,
}

impl RunMeta {
    pub fn new(file_no: u64, size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        // One seek is worth roughly 16KB of compaction IO; small files still
        // get a floor so a burst of misses does not immediately flag them.
        let allowed_seeks = ((size / (16 * 1024)) as i64).max(100);
        Self {
            file_no,
            size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed_seeks),
        }
    }

    pub fn from_new_file(file: &NewFile) -> Self {
        Self::new(
            file.file_no,
            file.size,
            file.smallest.clone(),
            file.largest.clone(),
        )
    }

    /// Charges one missed seek; true once the budget is exhausted.
    fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::Relaxed) <= 1
    }

    fn overlaps_user_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        if let Some(begin) = begin {
            if self.largest.user_key.as_slice() < begin {
                return false;
            }
        }
        if let Some(end) = end {
            if self.smallest.user_key.as_slice() > end {
                return false;
            }
        }
        true
    }
}

pub fn total_file_size(files: &[Arc<RunMeta>]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// Smallest and largest internal key across a non-empty run list.
pub fn key_range(files: &[Arc<RunMeta>]) -> (InternalKey, InternalKey) {
    debug_assert!(!files.is_empty());
    let mut smallest = files[0].smallest.clone();
    let mut largest = files[0].largest.clone();
    for file in &files[1..] {
        if file.smallest < smallest {
            smallest = file.smallest.clone();
        }
        if file.largest > largest {
            largest = file.largest.clone();
        }
    }
    (smallest, largest)
}

/// Immutable snapshot of the level structure.
pub struct Version {
    /// Runs per level. Level 0 is ordered newest file first; higher levels
    /// are key-disjoint and ordered by smallest key.
    pub files: Vec<Vec<Arc<RunMeta>>>,

    /// Highest compaction score and the level it belongs to, computed once
    /// at install time.
    pub compaction_score: f64,
    pub compaction_level: usize,

    /// Seek-driven compaction candidate, set by the read path.
    file_to_compact: RwLock<Option<(usize, Arc<RunMeta>)>>,
}

impl Version {
    pub fn new() -> Self {
        Self {
            files: vec![Vec::new(); NUM_LEVELS],
            compaction_score: 0.0,
            compaction_level: 0,
            file_to_compact: RwLock::new(None),
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.files[level])
    }

    pub fn take_file_to_compact(&self) -> Option<(usize, Arc<RunMeta>)> {
        self.file_to_compact.write().unwrap().take()
    }

    pub fn has_file_to_compact(&self) -> bool {
        self.file_to_compact.read().unwrap().is_some()
    }

    /// Point lookup across the level structure.
    ///
    /// Returns the visible entry (`Some(None)` for a tombstone) plus the run
    /// to seek-charge: the first run read, whenever the lookup had to touch
    /// more than one.
    pub fn get(
        &self,
        cache: &TableCache,
        user_key: &[u8],
        sequence: SequenceNumber,
    ) -> Result<(Option<Option<Vec<u8>>>, Option<(usize, Arc<RunMeta>)>)> {
        let lookup = InternalKey::for_lookup(user_key, sequence);
        let mut first_read: Option<(usize, Arc<RunMeta>)> = None;
        let mut reads = 0usize;

        // The first run consulted is charged, but only when the lookup had
        // to go past it.
        fn charge(
            first_read: &Option<(usize, Arc<RunMeta>)>,
            reads: usize,
        ) -> Option<(usize, Arc<RunMeta>)> {
            if reads > 1 {
                first_read.clone()
            } else {
                None
            }
        }

        for level in 0..NUM_LEVELS {
            let candidates: Vec<&Arc<RunMeta>> = if level == 0 {
                // Level-0 runs overlap; consult every one containing the
                // key, newest file first.
                self.files[0]
                    .iter()
                    .filter(|f| f.overlaps_user_range(Some(user_key), Some(user_key)))
                    .collect()
            } else {
                match find_file(&self.files[level], user_key) {
                    Some(index) => vec![&self.files[level][index]],
                    None => continue,
                }
            };

            for file in candidates {
                reads += 1;
                if first_read.is_none() {
                    first_read = Some((level, Arc::clone(file)));
                }

                let table = cache.get(file.file_no)?;
                if let Some((found, value)) = table.get(&lookup)? {
                    if found.user_key == user_key {
                        let result = match found.kind {
                            ValueKind::Value => Some(Some(value)),
                            ValueKind::Tombstone => Some(None),
                        };
                        return Ok((result, charge(&first_read, reads)));
                    }
                }
            }
        }

        Ok((None, charge(&first_read, reads)))
    }

    /// Applies a seek charge reported by `get`. Returns true when the run
    /// just became a compaction candidate.
    pub fn update_stats(&self, stats: Option<(usize, Arc<RunMeta>)>) -> bool {
        if let Some((level, run)) = stats {
            if run.charge_seek() {
                let mut candidate = self.file_to_compact.write().unwrap();
                if candidate.is_none() {
                    *candidate = Some((level, run));
                    return true;
                }
            }
        }
        false
    }

    /// All runs at `level` whose user-key range intersects
    /// `[begin, end]` (both bounds inclusive, `None` = unbounded). At level
    /// 0 the range is widened transitively, since overlapping runs must be
    /// compacted together.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<RunMeta>> {
        let mut begin = begin.map(|b| b.to_vec());
        let mut end = end.map(|e| e.to_vec());
        let mut inputs = Vec::new();

        let mut i = 0;
        while i < self.files[level].len() {
            let file = &self.files[level][i];
            i += 1;
            if !file.overlaps_user_range(begin.as_deref(), end.as_deref()) {
                continue;
            }
            if level == 0 {
                // Widen and restart if this run extends the range; other
                // level-0 runs may overlap the wider range.
                let mut widened = false;
                if let Some(b) = &begin {
                    if file.smallest.user_key < *b {
                        begin = Some(file.smallest.user_key.clone());
                        widened = true;
                    }
                }
                if let Some(e) = &end {
                    if file.largest.user_key > *e {
                        end = Some(file.largest.user_key.clone());
                        widened = true;
                    }
                }
                if widened {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(Arc::clone(file));
        }
        inputs
    }

    pub fn overlap_in_level(&self, level: usize, begin: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        self.files[level]
            .iter()
            .any(|f| f.overlaps_user_range(begin, end))
    }

    /// Computes the compaction score after the file lists are final.
    ///
    /// Level 0 is scored by run count (each run is a read amplification
    /// unit regardless of size); higher levels by bytes against their
    /// geometric budget.
    pub fn finalize(&mut self, opts: &Options) {
        let mut best_level = 0;
        let mut best_score = self.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64;

        for level in 1..NUM_LEVELS - 1 {
            let score = self.level_bytes(level) as f64 / opts.max_bytes_for_level(level) as f64;
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }

        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<usize> = (0..NUM_LEVELS).map(|l| self.num_files(l)).collect();
        f.debug_struct("Version")
            .field("files", &counts)
            .field("compaction_level", &self.compaction_level)
            .field("compaction_score", &self.compaction_score)
            .finish()
    }
}

/// Index of the single run at a key-disjoint level that may contain
/// `user_key`.
fn find_file(files: &[Arc<RunMeta>], user_key: &[u8]) -> Option<usize> {
    let index = files.partition_point(|f| f.largest.user_key.as_slice() < user_key);
    if index < files.len() && files[index].smallest.user_key.as_slice() <= user_key {
        Some(index)
    } else {
        None
    }
}

/// Accumulates edits on top of a base version and produces the successor.
pub struct VersionBuilder {
    base: Arc<Version>,
    deleted: Vec<std::collections::HashSet<u64>>,
    added: Vec<Vec<Arc<RunMeta>>>,
}

impl VersionBuilder {
    pub fn new(base: Arc<Version>) -> Self {
        Self {
            base,
            deleted: vec![std::collections::HashSet::new(); NUM_LEVELS],
            added: vec![Vec::new(); NUM_LEVELS],
        }
    }

    pub fn accumulate(&mut self, edit: &VersionEdit) {
        for (level, file_no) in &edit.deleted_files {
            self.deleted[*level].insert(*file_no);
        }
        for (level, file) in &edit.added_files {
            self.deleted[*level].remove(&file.file_no);
            self.added[*level].push(Arc::new(RunMeta::from_new_file(file)));
        }
    }

    pub fn apply(self, opts: &Options) -> Version {
        let mut version = Version::new();
        for level in 0..NUM_LEVELS {
            let mut files: Vec<Arc<RunMeta>> = self.base.files[level]
                .iter()
                .filter(|f| !self.deleted[level].contains(&f.file_no))
                .cloned()
                .collect();
            files.extend(self.added[level].iter().cloned());

            if level == 0 {
                files.sort_by(|a, b| b.file_no.cmp(&a.file_no));
            } else {
                files.sort_by(|a, b| a.smallest.cmp(&b.smallest));
                debug_assert!(
                    files.windows(2).all(|w| w[0].largest < w[1].smallest),
                    "level {level} runs overlap after edit"
                );
            }
            version.files[level] = files;
        }
        version.finalize(opts);
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn ikey(key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(key.to_vec(), seq, ValueKind::Value)
    }

    pub(crate) fn run(file_no: u64, size: u64, smallest: &[u8], largest: &[u8]) -> Arc<RunMeta> {
        Arc::new(RunMeta::new(
            file_no,
            size,
            ikey(smallest, 100),
            ikey(largest, 1),
        ))
    }

    #[test]
    fn find_file_selects_containing_run() {
        let files = vec![run(1, 10, b"a", b"c"), run(2, 10, b"e", b"g")];
        assert_eq!(find_file(&files, b"b"), Some(0));
        assert_eq!(find_file(&files, b"c"), Some(0));
        assert_eq!(find_file(&files, b"d"), None);
        assert_eq!(find_file(&files, b"e"), Some(1));
        assert_eq!(find_file(&files, b"z"), None);
    }

    #[test]
    fn overlapping_inputs_at_disjoint_level() {
        let mut version = Version::new();
        version.files[1] = vec![
            run(1, 10, b"a", b"c"),
            run(2, 10, b"e", b"g"),
            run(3, 10, b"i", b"k"),
        ];

        let hits = version.overlapping_inputs(1, Some(b"f"), Some(b"j"));
        let nos: Vec<u64> = hits.iter().map(|f| f.file_no).collect();
        assert_eq!(nos, vec![2, 3]);

        assert!(version.overlapping_inputs(1, Some(b"x"), None).is_empty());
        assert_eq!(version.overlapping_inputs(1, None, None).len(), 3);
    }

    #[test]
    fn level0_overlap_widens_transitively() {
        let mut version = Version::new();
        // b..d overlaps c..f which overlaps e..h; picking b must pull all.
        version.files[0] = vec![
            run(3, 10, b"e", b"h"),
            run(2, 10, b"c", b"f"),
            run(1, 10, b"b", b"d"),
        ];

        let hits = version.overlapping_inputs(0, Some(b"b"), Some(b"b"));
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn builder_applies_deletes_and_adds() {
        let mut base = Version::new();
        base.files[1] = vec![run(1, 10, b"a", b"c"), run(2, 10, b"e", b"g")];
        let base = Arc::new(base);

        let mut edit = VersionEdit::new();
        edit.delete_file(1, 1);
        edit.add_file(
            1,
            NewFile {
                file_no: 9,
                size: 20,
                smallest: ikey(b"h", 5),
                largest: ikey(b"j", 1),
            },
        );

        let mut builder = VersionBuilder::new(base);
        builder.accumulate(&edit);
        let version = builder.apply(&Options::default());

        let nos: Vec<u64> = version.files[1].iter().map(|f| f.file_no).collect();
        assert_eq!(nos, vec![2, 9]);
    }

    #[test]
    fn level0_sorts_newest_file_first() {
        let base = Arc::new(Version::new());
        let mut edit = VersionEdit::new();
        for no in [4u64, 9, 2] {
            edit.add_file(
                0,
                NewFile {
                    file_no: no,
                    size: 10,
                    smallest: ikey(b"a", 1),
                    largest: ikey(b"z", 1),
                },
            );
        }
        let mut builder = VersionBuilder::new(base);
        builder.accumulate(&edit);
        let version = builder.apply(&Options::default());

        let nos: Vec<u64> = version.files[0].iter().map(|f| f.file_no).collect();
        assert_eq!(nos, vec![9, 4, 2]);
    }

    #[test]
    fn score_prefers_crowded_level0() {
        let mut version = Version::new();
        for no in 0..8 {
            version.files[0].push(run(no, 10, b"a", b"z"));
        }
        version.finalize(&Options::default());
        assert_eq!(version.compaction_level, 0);
        assert!(version.compaction_score >= 2.0);
    }

    #[test]
    fn score_scales_by_level_budget() {
        let opts = Options::default();
        let mut version = Version::new();
        // 20MB at level 1 against its 10MB budget.
        version.files[1] = vec![run(1, 20 * 1024 * 1024, b"a", b"m")];
        version.finalize(&opts);
        assert_eq!(version.compaction_level, 1);
        assert!((version.compaction_score - 2.0).abs() < 0.01);
    }

    #[test]
    fn seek_budget_flags_candidate_once() {
        let version = Version::new();
        let file = run(1, 0, b"a", b"c");
        // Budget floor is 100 charges.
        for _ in 0..99 {
            assert!(!version.update_stats(Some((1, Arc::clone(&file)))));
        }
        assert!(version.update_stats(Some((1, Arc::clone(&file)))));
        assert!(version.has_file_to_compact());
        // Second candidate does not displace the first.
        let other = run(2, 0, b"d", b"e");
        for _ in 0..200 {
            version.update_stats(Some((2, Arc::clone(&other))));
        }
        assert_eq!(version.take_file_to_compact().unwrap().1.file_no, 1);
    }
}
