//! The version set: the chain of catalog snapshots, the manifest journal
//! that persists their deltas, and the input selection for compactions.
//!
//! A single mutex around the `VersionSet` is the catalog lock. Critical
//! sections stay short; the only IO performed under it is the manifest
//! append + fsync that commits an install.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::compaction::Compaction;
use crate::config::{Options, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::files::{self, FileKind};
use crate::key::{InternalKey, SequenceNumber};
use crate::version::edit::{NewFile, VersionEdit};
use crate::version::{key_range, total_file_size, RunMeta, Version, VersionBuilder};
use crate::wal::{LogReader, LogWriter};

pub struct VersionSet {
    dir: PathBuf,
    opts: Options,

    next_file_no: u64,
    /// Number the next manifest will be created under.
    manifest_file_no: u64,
    /// Number of the manifest `CURRENT` points at on disk.
    current_manifest_no: u64,
    last_sequence: SequenceNumber,
    log_no: u64,

    /// Version chain, newest at the front. Readers pin entries with `Arc`
    /// clones; unreferenced history is pruned at install time.
    versions: VecDeque<Arc<Version>>,

    /// Where the next size-driven compaction at each level resumes.
    compaction_pointers: Vec<Option<InternalKey>>,

    manifest: Option<LogWriter>,
}

impl VersionSet {
    pub fn new(dir: PathBuf, opts: Options) -> Self {
        let mut empty = Version::new();
        empty.finalize(&opts);
        let mut versions = VecDeque::new();
        versions.push_front(Arc::new(empty));
        Self {
            dir,
            opts,
            next_file_no: 2,
            manifest_file_no: 1,
            current_manifest_no: 1,
            last_sequence: 0,
            log_no: 0,
            versions,
            compaction_pointers: vec![None; NUM_LEVELS],
            manifest: None,
        }
    }

    /// Writes the initial manifest and `CURRENT` for a brand-new database.
    pub fn create_new(dir: &PathBuf) -> Result<()> {
        let manifest_no = 1;
        let mut edit = VersionEdit::new();
        edit.log_no = Some(0);
        edit.next_file_no = Some(2);
        edit.last_sequence = Some(0);

        let manifest_path = files::manifest_path(dir, manifest_no);
        let mut writer = LogWriter::create(&manifest_path)?;
        writer.add_record(&edit.encode())?;
        writer.sync()?;
        drop(writer);

        set_current(dir, manifest_no)?;
        Ok(())
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(self.versions.front().expect("version chain never empty"))
    }

    pub fn new_file_number(&mut self) -> u64 {
        let no = self.next_file_no;
        self.next_file_no += 1;
        no
    }

    /// Returns an unused allocation so the number can be handed out again.
    pub fn reuse_file_number(&mut self, file_no: u64) {
        if file_no + 1 == self.next_file_no {
            self.next_file_no = file_no;
        }
    }

    pub fn mark_file_number_used(&mut self, file_no: u64) {
        if self.next_file_no <= file_no {
            self.next_file_no = file_no + 1;
        }
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    pub fn log_number(&self) -> u64 {
        self.log_no
    }

    /// Manifest files that must survive garbage collection: the one
    /// `CURRENT` points at, and the one the next install will create.
    pub fn live_manifest_files(&self) -> [u64; 2] {
        [self.current_manifest_no, self.manifest_file_no]
    }

    pub fn needs_compaction(&self) -> bool {
        let current = self.current();
        current.compaction_score >= 1.0 || current.has_file_to_compact()
    }

    /// Every run referenced by any version still in the chain.
    pub fn live_files(&self) -> HashSet<u64> {
        let mut live = HashSet::new();
        for version in &self.versions {
            for level in 0..NUM_LEVELS {
                for file in &version.files[level] {
                    live.insert(file.file_no);
                }
            }
        }
        live
    }

    /// Rebuilds the current version by replaying the manifest named by
    /// `CURRENT`.
    pub fn recover(&mut self) -> Result<()> {
        let current_path = files::current_path(&self.dir);
        let current_name = fs::read_to_string(&current_path)
            .map_err(|e| Error::Io(format!("reading CURRENT: {e}")))?;
        let current_name = current_name.trim_end();
        let manifest_no = match files::parse_file_name(current_name) {
            Some((FileKind::Manifest, no)) => no,
            _ => {
                return Err(Error::Corruption(format!(
                    "CURRENT names '{current_name}', not a manifest"
                )))
            }
        };

        let manifest_path = self.dir.join(current_name);
        let mut reader = LogReader::open(&manifest_path, self.opts.paranoid_checks)?;

        let mut builder = VersionBuilder::new(Arc::new(Version::new()));
        let mut log_no = None;
        let mut next_file_no = None;
        let mut last_sequence = None;
        let mut edits = 0usize;

        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode(&record)?;
            builder.accumulate(&edit);
            for (level, key) in &edit.compaction_pointers {
                self.compaction_pointers[*level] = Some(key.clone());
            }
            if edit.log_no.is_some() {
                log_no = edit.log_no;
            }
            if edit.next_file_no.is_some() {
                next_file_no = edit.next_file_no;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
            edits += 1;
        }

        let (log_no, next_file_no, last_sequence) = match (log_no, next_file_no, last_sequence) {
            (Some(l), Some(n), Some(s)) => (l, n, s),
            _ => {
                return Err(Error::Corruption(format!(
                    "manifest {} has no complete metadata",
                    manifest_path.display()
                )))
            }
        };

        self.log_no = log_no;
        self.next_file_no = next_file_no;
        self.last_sequence = last_sequence;
        self.current_manifest_no = manifest_no;
        self.mark_file_number_used(manifest_no);
        self.mark_file_number_used(log_no);

        let version = Arc::new(builder.apply(&self.opts));
        self.prune_unreferenced();
        self.versions.push_front(version);

        // Each open writes a fresh manifest; the old one becomes garbage
        // once CURRENT moves.
        self.manifest_file_no = self.new_file_number();

        tracing::info!(
            manifest = %manifest_path.display(),
            edits,
            log_no,
            next_file_no,
            last_sequence,
            "recovered catalog"
        );
        Ok(())
    }

    /// Applies `edit` to the current version, journals it, and installs the
    /// result as the new current version.
    ///
    /// On a manifest failure nothing is installed; the caller owns cleanup
    /// of any files the edit referenced.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_no {
            Some(log_no) => debug_assert!(
                log_no >= self.log_no && log_no < self.next_file_no,
                "edit log number {log_no} out of range"
            ),
            None => edit.log_no = Some(self.log_no),
        }
        edit.next_file_no = Some(self.next_file_no);
        edit.last_sequence = Some(self.last_sequence);

        let mut builder = VersionBuilder::new(self.current());
        builder.accumulate(edit);
        let version = Arc::new(builder.apply(&self.opts));

        let created_manifest = self.manifest.is_none();
        if created_manifest {
            let path = files::manifest_path(&self.dir, self.manifest_file_no);
            let mut writer = LogWriter::create(&path)?;
            if let Err(e) = self.write_snapshot(&mut writer) {
                drop(writer);
                let _ = fs::remove_file(&path);
                return Err(e);
            }
            self.manifest = Some(writer);
        }

        let result = (|| {
            let writer = self.manifest.as_mut().expect("manifest just ensured");
            writer.add_record(&edit.encode())?;
            writer.sync()?;
            if created_manifest {
                set_current(&self.dir, self.manifest_file_no)?;
                self.current_manifest_no = self.manifest_file_no;
            }
            Ok(())
        })();

        if let Err(e) = result {
            // A half-written record would poison every later append, so the
            // writer is abandoned either way; the next install starts a
            // fresh manifest and rewrites CURRENT.
            self.manifest = None;
            if created_manifest {
                let _ = fs::remove_file(files::manifest_path(&self.dir, self.manifest_file_no));
            }
            self.manifest_file_no = self.new_file_number();
            return Err(e);
        }

        for (level, key) in &edit.compaction_pointers {
            self.compaction_pointers[*level] = Some(key.clone());
        }
        self.log_no = edit.log_no.expect("set above");
        self.prune_unreferenced();
        self.versions.push_front(version);
        Ok(())
    }

    /// Writes the full current state as one edit, the base for a fresh
    /// manifest.
    fn write_snapshot(&self, writer: &mut LogWriter) -> Result<()> {
        let mut edit = VersionEdit::new();
        for (level, pointer) in self.compaction_pointers.iter().enumerate() {
            if let Some(key) = pointer {
                edit.set_compaction_pointer(level, key.clone());
            }
        }
        let current = self.current();
        for level in 0..NUM_LEVELS {
            for file in &current.files[level] {
                edit.add_file(
                    level,
                    NewFile {
                        file_no: file.file_no,
                        size: file.size,
                        smallest: file.smallest.clone(),
                        largest: file.largest.clone(),
                    },
                );
            }
        }
        edit.log_no = Some(self.log_no);
        edit.next_file_no = Some(self.next_file_no);
        edit.last_sequence = Some(self.last_sequence);

        writer.add_record(&edit.encode())?;
        Ok(())
    }

    fn prune_unreferenced(&mut self) {
        // The deque's own reference is the one strong count a dead version
        // still has.
        self.versions.retain(|v| Arc::strong_count(v) > 1);
    }

    /// Chooses the next compaction, size-driven candidates first, then
    /// seek-driven ones. Returns `None` when the tree is healthy.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();

        let mut c = if current.compaction_score >= 1.0 {
            let level = current.compaction_level;
            let mut c = Compaction::new(&self.opts, level);
            // Resume after the last key compacted out of this level,
            // wrapping to the start when the pointer passes every run.
            let picked = current.files[level]
                .iter()
                .find(|f| match &self.compaction_pointers[level] {
                    Some(pointer) => f.largest > *pointer,
                    None => true,
                })
                .or_else(|| current.files[level].first())
                .cloned()?;
            c.inputs[0].push(picked);
            c
        } else if let Some((level, file)) = current.take_file_to_compact() {
            if level + 1 >= NUM_LEVELS {
                return None;
            }
            let mut c = Compaction::new(&self.opts, level);
            c.inputs[0].push(file);
            c
        } else {
            return None;
        };

        c.input_version = Some(Arc::clone(&current));

        if c.level == 0 {
            // Level-0 runs overlap each other: widen to every run touching
            // the picked range, or a newer duplicate would survive above an
            // older one.
            let (smallest, largest) = c.base_range();
            c.inputs[0] = current.overlapping_inputs(
                0,
                Some(&smallest.user_key),
                Some(&largest.user_key),
            );
            debug_assert!(!c.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Builds a compaction for an explicit key range at `level`, used by
    /// manual range compaction. Returns `None` when nothing overlaps.
    pub fn compact_range_inputs(
        &mut self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Option<Compaction> {
        let current = self.current();
        let inputs = current.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }
        let mut c = Compaction::new(&self.opts, level);
        c.inputs[0] = inputs;
        c.input_version = Some(current);
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Completes a compaction plan: pulls in the overlapping next-level
    /// runs, grows the base set when that costs nothing, records the
    /// grandparents, and advances the compaction pointer.
    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let current = c.input_version.as_ref().expect("input version set").clone();

        self.add_boundary_inputs(&current, c.level, &mut c.inputs[0]);
        let (smallest, largest) = c.base_range();
        c.inputs[1] = current.overlapping_inputs(
            c.target_level(),
            Some(&smallest.user_key),
            Some(&largest.user_key),
        );

        let (mut all_smallest, mut all_largest) = c.total_range();

        // Grow the base set to fill the chosen parent range, as long as
        // doing so drags no additional parent runs in and stays under the
        // expansion budget.
        if !c.inputs[1].is_empty() {
            let mut expanded0 = current.overlapping_inputs(
                c.level,
                Some(&all_smallest.user_key),
                Some(&all_largest.user_key),
            );
            self.add_boundary_inputs(&current, c.level, &mut expanded0);
            let inputs0_size = total_file_size(&c.inputs[0]);
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size <= self.opts.expanded_compaction_byte_limit()
            {
                let (new_smallest, new_largest) = key_range(&expanded0);
                let expanded1 = current.overlapping_inputs(
                    c.target_level(),
                    Some(&new_smallest.user_key),
                    Some(&new_largest.user_key),
                );
                if expanded1.len() == c.inputs[1].len() {
                    tracing::info!(
                        level = c.level,
                        from_files = c.inputs[0].len(),
                        to_files = expanded0.len(),
                        from_bytes = inputs0_size,
                        to_bytes = expanded0_size,
                        "expanding compaction base input"
                    );
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let range = c.total_range();
                    all_smallest = range.0;
                    all_largest = range.1;
                }
            }
        }

        if c.target_level() + 1 < NUM_LEVELS {
            c.grandparents = current.overlapping_inputs(
                c.target_level() + 1,
                Some(&all_smallest.user_key),
                Some(&all_largest.user_key),
            );
        }

        // Advance the pointer now rather than at install, so a failed
        // compaction retries a different range.
        let (_, pointer) = c.base_range();
        c.edit.set_compaction_pointer(c.level, pointer.clone());
        self.compaction_pointers[c.level] = Some(pointer);
    }

    /// Pulls in runs whose smallest key continues the user key at the upper
    /// boundary of the input set. Without this, an older version of the
    /// boundary key could be left behind at the lower level while a newer
    /// one moves down, and a later read through a snapshot would see the
    /// stale version first.
    fn add_boundary_inputs(&self, version: &Version, level: usize, files: &mut Vec<Arc<RunMeta>>) {
        if files.is_empty() {
            return;
        }
        let mut largest = files
            .iter()
            .map(|f| f.largest.clone())
            .max()
            .expect("non-empty");
        loop {
            let boundary = version.files[level]
                .iter()
                .filter(|f| {
                    f.smallest > largest && f.smallest.user_key == largest.user_key
                })
                .min_by(|a, b| a.smallest.cmp(&b.smallest))
                .cloned();
            match boundary {
                Some(file) => {
                    largest = file.largest.clone();
                    files.push(file);
                }
                None => break,
            }
        }
    }
}

fn set_current(dir: &PathBuf, manifest_no: u64) -> Result<()> {
    let manifest_name = files::manifest_path(dir, manifest_no);
    let manifest_name = manifest_name
        .file_name()
        .and_then(|n| n.to_str())
        .expect("manifest name is valid utf-8");

    // Write-temp-then-rename; rename within one directory is atomic.
    let tmp = files::temp_path(dir, manifest_no);
    {
        let mut file = fs::File::create(&tmp)?;
        writeln!(file, "{manifest_name}")?;
        file.sync_all()?;
    }
    match fs::rename(&tmp, files::current_path(dir)) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueKind;

    fn ikey(key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(key.to_vec(), seq, ValueKind::Value)
    }

    fn new_file(file_no: u64, size: u64, smallest: &[u8], largest: &[u8]) -> NewFile {
        NewFile {
            file_no,
            size,
            smallest: ikey(smallest, 100),
            largest: ikey(largest, 1),
        }
    }

    fn fresh_set(dir: &tempfile::TempDir) -> VersionSet {
        let dir = dir.path().to_path_buf();
        VersionSet::create_new(&dir).unwrap();
        let mut set = VersionSet::new(dir, Options::default());
        set.recover().unwrap();
        set
    }

    #[test]
    fn new_database_recovers_empty() {
        let dir = tempfile::tempdir().unwrap();
        let set = fresh_set(&dir);
        assert_eq!(set.last_sequence(), 0);
        assert_eq!(set.log_number(), 0);
        let current = set.current();
        for level in 0..NUM_LEVELS {
            assert_eq!(current.num_files(level), 0);
        }
    }

    #[test]
    fn install_and_recover_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = fresh_set(&dir);

        let mut edit = VersionEdit::new();
        edit.add_file(0, new_file(5, 1000, b"a", b"m"));
        edit.add_file(1, new_file(6, 2000, b"a", b"z"));
        set.mark_file_number_used(6);
        set.set_last_sequence(42);
        set.log_and_apply(&mut edit).unwrap();

        assert_eq!(set.current().num_files(0), 1);
        assert_eq!(set.current().num_files(1), 1);

        // Reopen from disk.
        let mut reopened = VersionSet::new(dir.path().to_path_buf(), Options::default());
        reopened.recover().unwrap();
        assert_eq!(reopened.last_sequence(), 42);
        assert_eq!(reopened.current().num_files(0), 1);
        assert_eq!(reopened.current().num_files(1), 1);
        assert!(reopened.live_files().contains(&5));
        assert!(reopened.live_files().contains(&6));
    }

    #[test]
    fn deletions_survive_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = fresh_set(&dir);

        let mut edit = VersionEdit::new();
        edit.add_file(1, new_file(5, 1000, b"a", b"c"));
        edit.add_file(1, new_file(6, 1000, b"e", b"g"));
        set.mark_file_number_used(6);
        set.log_and_apply(&mut edit).unwrap();

        let mut edit = VersionEdit::new();
        edit.delete_file(1, 5);
        edit.add_file(2, new_file(7, 1000, b"a", b"c"));
        set.mark_file_number_used(7);
        set.log_and_apply(&mut edit).unwrap();

        let mut reopened = VersionSet::new(dir.path().to_path_buf(), Options::default());
        reopened.recover().unwrap();
        let current = reopened.current();
        assert_eq!(current.num_files(1), 1);
        assert_eq!(current.files[1][0].file_no, 6);
        assert_eq!(current.num_files(2), 1);
        assert!(!reopened.live_files().contains(&5));
    }

    #[test]
    fn last_sequence_is_monotone_across_installs() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = fresh_set(&dir);

        let mut previous = 0;
        for round in 1..5u64 {
            set.set_last_sequence(round * 10);
            let mut edit = VersionEdit::new();
            let file_no = set.new_file_number();
            edit.add_file(0, new_file(file_no, 100, b"a", b"b"));
            set.log_and_apply(&mut edit).unwrap();
            assert!(set.last_sequence() >= previous);
            previous = set.last_sequence();
        }
    }

    #[test]
    fn pick_compaction_targets_crowded_level0() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = fresh_set(&dir);

        let mut edit = VersionEdit::new();
        for no in 10..15u64 {
            edit.add_file(0, new_file(no, 100, b"a", b"m"));
            set.mark_file_number_used(no);
        }
        set.log_and_apply(&mut edit).unwrap();

        assert!(set.needs_compaction());
        let c = set.pick_compaction().expect("level 0 over trigger");
        assert_eq!(c.level, 0);
        assert_eq!(c.inputs[0].len(), 5);
    }

    #[test]
    fn compaction_pointer_resumes_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = fresh_set(&dir);

        // Oversize level 1 so it is always the size-driven choice.
        let mut edit = VersionEdit::new();
        edit.add_file(1, new_file(10, 20 * 1024 * 1024, b"a", b"c"));
        edit.add_file(1, new_file(11, 20 * 1024 * 1024, b"e", b"g"));
        set.mark_file_number_used(11);
        set.log_and_apply(&mut edit).unwrap();

        let first = set.pick_compaction().expect("level 1 oversized");
        assert_eq!(first.level, 1);
        assert_eq!(first.inputs[0][0].file_no, 10);

        // The pointer advanced past file 10, so the next pick starts at 11.
        let second = set.pick_compaction().expect("still oversized");
        assert_eq!(second.inputs[0][0].file_no, 11);

        // And wraps around afterwards.
        let third = set.pick_compaction().expect("still oversized");
        assert_eq!(third.inputs[0][0].file_no, 10);
    }

    #[test]
    fn boundary_inputs_follow_user_key_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = fresh_set(&dir);

        // Run 11 starts with an older version of run 10's largest user key.
        let mut edit = VersionEdit::new();
        edit.add_file(
            1,
            NewFile {
                file_no: 10,
                size: 100,
                smallest: ikey(b"a", 90),
                largest: ikey(b"k", 50),
            },
        );
        edit.add_file(
            1,
            NewFile {
                file_no: 11,
                size: 100,
                smallest: ikey(b"k", 40),
                largest: ikey(b"p", 10),
            },
        );
        set.mark_file_number_used(11);
        set.log_and_apply(&mut edit).unwrap();

        let current = set.current();
        let mut inputs = vec![Arc::clone(&current.files[1][0])];
        set.add_boundary_inputs(&current, 1, &mut inputs);
        let nos: Vec<u64> = inputs.iter().map(|f| f.file_no).collect();
        assert_eq!(nos, vec![10, 11]);
    }

    #[test]
    fn current_file_updated_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = fresh_set(&dir);

        let mut edit = VersionEdit::new();
        edit.add_file(0, new_file(5, 100, b"a", b"b"));
        set.mark_file_number_used(5);
        set.log_and_apply(&mut edit).unwrap();

        let current = fs::read_to_string(files::current_path(dir.path())).unwrap();
        let name = current.trim_end();
        assert!(name.starts_with("MANIFEST-"), "CURRENT holds {name}");
        assert!(dir.path().join(name).exists());
        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
