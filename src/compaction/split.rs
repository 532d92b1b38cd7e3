//! Partner/split compaction.
//!
//! A large compaction whose parent level contributes at least two runs is
//! partitioned into key-disjoint shards and fanned out over the worker
//! pool. Each shard is a self-contained
//! merge: its own cursor, its own snapshot fence, its own output cuts.
//! Shard edits are unioned and installed as one version edit, so a split
//! compaction is externally indistinguishable from the classical merge of
//! the same inputs — partial success is never visible.
//!
//! Partitioning is a weighted-byte bisection over the parent-level inputs:
//! ideal cut offsets at `i/K` of the total parent weight are snapped to the
//! nearest eligible run boundary. A boundary is eligible only when the runs
//! on either side do not share a user key, which guarantees that no parent
//! run straddles a split point and that one key's version history never
//! spans two shards. Base-level runs that cross shard boundaries are not
//! rewritten; each shard clamps its cursor over them to the shard interval.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};

use itertools::Itertools as _;

use crate::compaction::pool::WorkerPool;
use crate::compaction::worker::{self, CompactionEnv, MergeBounds};
use crate::compaction::Compaction;
use crate::error::{Error, Result};
use crate::key::SequenceNumber;
use crate::version::edit::NewFile;
use crate::version::{total_file_size, RunMeta};

/// One key-range shard of a split compaction.
pub(crate) struct Shard {
    /// User-key interval `[lo, hi)` owned by this shard; `None` bounds are
    /// open.
    pub lo: Option<Vec<u8>>,
    pub hi: Option<Vec<u8>>,
    /// Level-L runs intersecting the interval. These may also feed sibling
    /// shards; the merge clamps them to the interval.
    pub base: Vec<Arc<RunMeta>>,
    /// Level-(L+1) runs wholly contained in the interval.
    pub parents: Vec<Arc<RunMeta>>,
}

/// Partitions `c` into up to `max_shards` shards, or `None` when splitting
/// is not worthwhile: inputs confined to level 0 (no disjoint parent range
/// to carve), a small total weight, or fewer than two shards after boundary
/// snapping.
pub(crate) fn plan_shards(
    c: &Compaction,
    opts: &crate::config::Options,
    max_shards: usize,
) -> Option<Vec<Shard>> {
    if c.total_input_bytes() < opts.split_compaction_min_bytes() {
        return None;
    }
    let parents = &c.inputs[1];
    if parents.len() < 2 || max_shards < 2 {
        return None;
    }

    // Boundary i sits between parents[i-1] and parents[i]. It is eligible
    // only when the two runs do not share a user key, so cutting there can
    // never split one key's version history.
    let eligible: Vec<usize> = parents
        .iter()
        .tuple_windows()
        .positions(|(left, right)| left.largest.user_key != right.smallest.user_key)
        .map(|i| i + 1)
        .collect();
    if eligible.is_empty() {
        return None;
    }

    // Weighted-byte bisection: snap each ideal offset to the closest
    // eligible boundary by cumulative parent bytes.
    let total: u64 = total_file_size(parents);
    let mut cumulative = Vec::with_capacity(parents.len() + 1);
    let mut acc = 0u64;
    cumulative.push(0);
    for parent in parents.iter() {
        acc += parent.size;
        cumulative.push(acc);
    }

    let k = max_shards.min(parents.len()) as u64;
    let mut cuts = BTreeSet::new();
    for j in 1..k {
        let target = total * j / k;
        let best = eligible
            .iter()
            .copied()
            .min_by_key(|&i| cumulative[i].abs_diff(target))
            .expect("eligible is non-empty");
        cuts.insert(best);
    }
    if cuts.is_empty() {
        return None;
    }

    let mut shards = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0usize;
    let mut lo: Option<Vec<u8>> = None;
    for cut in cuts {
        let hi = Some(parents[cut].smallest.user_key.clone());
        shards.push(make_shard(c, lo.clone(), hi.clone(), &parents[start..cut]));
        lo = hi;
        start = cut;
    }
    shards.push(make_shard(c, lo, None, &parents[start..]));

    debug_assert!(shards.len() >= 2);
    debug_assert_eq!(
        shards.iter().map(|s| s.parents.len()).sum::<usize>(),
        parents.len()
    );
    Some(shards)
}

fn make_shard(
    c: &Compaction,
    lo: Option<Vec<u8>>,
    hi: Option<Vec<u8>>,
    parents: &[Arc<RunMeta>],
) -> Shard {
    let base = c.inputs[0]
        .iter()
        .filter(|f| {
            let above_lo = lo
                .as_deref()
                .map_or(true, |lo| f.largest.user_key.as_slice() >= lo);
            // `hi` is exclusive.
            let below_hi = hi
                .as_deref()
                .map_or(true, |hi| f.smallest.user_key.as_slice() < hi);
            above_lo && below_hi
        })
        .cloned()
        .collect();
    Shard {
        lo,
        hi,
        base,
        parents: parents.to_vec(),
    }
}

/// Builds the per-shard plan: same level and version as the parent
/// compaction, inputs and grandparents restricted to the shard.
fn shard_compaction(env: &CompactionEnv, c: &Compaction, shard: &Shard) -> Compaction {
    let mut sc = Compaction::new(&env.opts, c.level);
    sc.inputs[0] = shard.base.clone();
    sc.inputs[1] = shard.parents.clone();
    sc.grandparents = c
        .grandparents
        .iter()
        .filter(|g| {
            let above_lo = shard
                .lo
                .as_deref()
                .map_or(true, |lo| g.largest.user_key.as_slice() >= lo);
            let below_hi = shard
                .hi
                .as_deref()
                .map_or(true, |hi| g.smallest.user_key.as_slice() < hi);
            above_lo && below_hi
        })
        .cloned()
        .collect();
    sc.input_version = c.input_version.clone();
    sc
}

/// Executes the shards on the pool and returns the union of their outputs.
///
/// All-or-nothing: if any shard fails, every output of every shard is
/// unlinked and the error is returned, leaving the caller to retry the
/// compaction classically.
pub(crate) fn run_split(
    env: &CompactionEnv,
    c: &Compaction,
    shards: Vec<Shard>,
    pool: &WorkerPool,
    smallest_snapshot: SequenceNumber,
    alloc: Arc<dyn Fn() -> u64 + Send + Sync>,
    shutdown: Arc<AtomicBool>,
) -> Result<Vec<NewFile>> {
    let shard_count = shards.len();
    let (tx, rx) = mpsc::channel::<(usize, Result<Vec<NewFile>>)>();

    for (index, shard) in shards.into_iter().enumerate() {
        let env = env.clone();
        let mut sc = shard_compaction(&env, c, &shard);
        let alloc = Arc::clone(&alloc);
        let shutdown = Arc::clone(&shutdown);
        let tx = tx.clone();
        pool.execute(move || {
            let bounds = MergeBounds {
                lo: shard.lo,
                hi: shard.hi,
            };
            let result = worker::run_merge(
                &env,
                &mut sc,
                &bounds,
                smallest_snapshot,
                alloc.as_ref(),
                &shutdown,
            );
            // The receiver may be gone if a sibling already failed; the
            // outputs are cleaned up by the collector either way.
            let _ = tx.send((index, result));
        });
    }
    drop(tx);

    let mut results: Vec<Option<Vec<NewFile>>> = (0..shard_count).map(|_| None).collect();
    let mut first_error: Option<Error> = None;
    for _ in 0..shard_count {
        match rx.recv() {
            Ok((index, Ok(outputs))) => results[index] = Some(outputs),
            Ok((index, Err(e))) => {
                tracing::warn!(shard = index, error = %e, "split shard failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(_) => {
                // A worker died without reporting; treat as failure.
                if first_error.is_none() {
                    first_error = Some(Error::Io("split shard lost".to_string()));
                }
                break;
            }
        }
    }

    if let Some(e) = first_error {
        for outputs in results.iter().flatten() {
            worker::discard_outputs(env, outputs);
        }
        return Err(e);
    }

    let mut outputs = Vec::new();
    for shard_outputs in results.into_iter() {
        outputs.extend(shard_outputs.expect("every shard reported success"));
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::key::{InternalKey, ValueKind};

    fn ikey(key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(key.to_vec(), seq, ValueKind::Value)
    }

    fn run(file_no: u64, size: u64, smallest: &[u8], largest: &[u8]) -> Arc<RunMeta> {
        Arc::new(RunMeta::new(
            file_no,
            size,
            ikey(smallest, 100),
            ikey(largest, 1),
        ))
    }

    fn big_compaction(opts: &Options) -> Compaction {
        let mut c = Compaction::new(opts, 1);
        c.inputs[0] = vec![run(1, 4 << 20, b"a", b"z")];
        c.inputs[1] = vec![
            run(10, 4 << 20, b"a", b"f"),
            run(11, 4 << 20, b"g", b"m"),
            run(12, 4 << 20, b"n", b"s"),
            run(13, 4 << 20, b"t", b"z"),
        ];
        c
    }

    #[test]
    fn plans_contiguous_equal_weight_shards() {
        let opts = Options::default();
        let c = big_compaction(&opts);
        let shards = plan_shards(&c, &opts, 4).expect("large level-1 compaction splits");

        assert_eq!(shards.len(), 4);
        assert!(shards[0].lo.is_none());
        assert!(shards.last().unwrap().hi.is_none());
        for pair in shards.windows(2) {
            assert_eq!(pair[0].hi, pair[1].lo);
        }
        for shard in &shards {
            assert_eq!(shard.parents.len(), 1);
            // The single base run spans every shard.
            assert_eq!(shard.base.len(), 1);
        }
    }

    #[test]
    fn level0_base_splits_when_parents_exist() {
        let opts = Options::default();
        let mut c = Compaction::new(&opts, 0);
        // Overlapping level-0 runs above two disjoint level-1 runs: the
        // parent range still carves cleanly.
        c.inputs[0] = vec![run(1, 4 << 20, b"a", b"z"), run(2, 4 << 20, b"c", b"x")];
        c.inputs[1] = vec![run(10, 4 << 20, b"a", b"m"), run(11, 4 << 20, b"n", b"z")];
        let shards = plan_shards(&c, &opts, 4).expect("parent range splits");
        assert_eq!(shards.len(), 2);
        // Both level-0 runs feed both shards.
        assert_eq!(shards[0].base.len(), 2);
        assert_eq!(shards[1].base.len(), 2);
    }

    #[test]
    fn pure_level0_compaction_never_splits() {
        let opts = Options::default();
        let mut c = Compaction::new(&opts, 0);
        c.inputs[0] = vec![run(1, 4 << 20, b"a", b"z"), run(2, 4 << 20, b"a", b"z")];
        assert!(plan_shards(&c, &opts, 4).is_none());
    }

    #[test]
    fn small_compactions_never_split() {
        let opts = Options::default();
        let mut c = Compaction::new(&opts, 1);
        c.inputs[0] = vec![run(1, 1024, b"a", b"z")];
        c.inputs[1] = vec![run(10, 1024, b"a", b"m"), run(11, 1024, b"n", b"z")];
        assert!(plan_shards(&c, &opts, 4).is_none());
    }

    #[test]
    fn boundary_sharing_a_user_key_is_ineligible() {
        let opts = Options::default();
        let mut c = Compaction::new(&opts, 1);
        c.inputs[0] = vec![run(1, 4 << 20, b"a", b"z")];
        // Runs 10 and 11 share user key "m" at their boundary: versions of
        // "m" continue into run 11. Runs 11 and 12 split cleanly.
        c.inputs[1] = vec![
            Arc::new(RunMeta::new(10, 4 << 20, ikey(b"a", 100), ikey(b"m", 50))),
            Arc::new(RunMeta::new(11, 4 << 20, ikey(b"m", 40), ikey(b"r", 10))),
            Arc::new(RunMeta::new(12, 4 << 20, ikey(b"s", 9), ikey(b"z", 1))),
        ];

        let shards = plan_shards(&c, &opts, 4).expect("one eligible boundary remains");
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].parents.len(), 2);
        assert_eq!(shards[1].parents.len(), 1);
        assert_eq!(shards[0].hi.as_deref(), Some(b"s".as_slice()));
    }

    #[test]
    fn no_eligible_boundary_means_no_split() {
        let opts = Options::default();
        let mut c = Compaction::new(&opts, 1);
        c.inputs[0] = vec![run(1, 4 << 20, b"a", b"z")];
        c.inputs[1] = vec![
            Arc::new(RunMeta::new(10, 4 << 20, ikey(b"a", 100), ikey(b"m", 50))),
            Arc::new(RunMeta::new(11, 4 << 20, ikey(b"m", 40), ikey(b"z", 10))),
        ];
        assert!(plan_shards(&c, &opts, 4).is_none());
    }

    #[test]
    fn base_runs_assigned_to_intersecting_shards_only() {
        let opts = Options::default();
        let mut c = Compaction::new(&opts, 1);
        c.inputs[0] = vec![
            run(1, 4 << 20, b"a", b"e"),
            run(2, 4 << 20, b"h", b"p"),
            run(3, 4 << 20, b"u", b"z"),
        ];
        c.inputs[1] = vec![
            run(10, 4 << 20, b"a", b"f"),
            run(11, 4 << 20, b"g", b"m"),
            run(12, 4 << 20, b"n", b"s"),
            run(13, 4 << 20, b"t", b"z"),
        ];
        let shards = plan_shards(&c, &opts, 4).expect("splits into four");

        // Shard owning [g, n) must see base run 2 (h..p) but not run 1 or 3.
        let second = &shards[1];
        assert_eq!(second.lo.as_deref(), Some(b"g".as_slice()));
        let nos: Vec<u64> = second.base.iter().map(|f| f.file_no).collect();
        assert_eq!(nos, vec![2]);
    }

    mod execution {
        use super::*;
        use crate::cache::TableCache;
        use crate::compaction::worker::{self, CompactionEnv, MergeBounds};
        use crate::files;
        use crate::sstable::builder::TableBuilder;
        use crate::sstable::reader::Table;
        use crate::version::Version;
        use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

        struct Fixture {
            _dir: tempfile::TempDir,
            env: CompactionEnv,
            next_file: Arc<AtomicU64>,
        }

        impl Fixture {
            fn new() -> Self {
                let dir = tempfile::tempdir().unwrap();
                let opts = Options::default().max_file_size(1024).block_size(256);
                let env = CompactionEnv {
                    dir: dir.path().to_path_buf(),
                    opts: opts.clone(),
                    cache: Arc::new(TableCache::new(dir.path().to_path_buf(), opts)),
                };
                Self {
                    _dir: dir,
                    env,
                    next_file: Arc::new(AtomicU64::new(100)),
                }
            }

            fn write_run(
                &self,
                entries: &[(Vec<u8>, u64, ValueKind, Vec<u8>)],
            ) -> Arc<RunMeta> {
                let file_no = self.next_file.fetch_add(1, Ordering::SeqCst);
                let path = files::run_path(&self.env.dir, file_no);
                let mut builder = TableBuilder::create(path, &self.env.opts).unwrap();
                for (key, seq, kind, value) in entries {
                    builder
                        .add(&InternalKey::new(key.clone(), *seq, *kind), value)
                        .unwrap();
                }
                let smallest = builder.smallest().unwrap().clone();
                let largest = builder.largest().unwrap().clone();
                let size = builder.finish().unwrap();
                Arc::new(RunMeta::new(file_no, size, smallest, largest))
            }

            fn alloc(&self) -> Arc<dyn Fn() -> u64 + Send + Sync> {
                let next = Arc::clone(&self.next_file);
                Arc::new(move || next.fetch_add(1, Ordering::SeqCst))
            }

            fn scan_outputs(
                &self,
                outputs: &[NewFile],
            ) -> Vec<(Vec<u8>, u64, ValueKind, Vec<u8>)> {
                use crate::iterator::InternalIterator;
                let mut outputs = outputs.to_vec();
                outputs.sort_by(|a, b| a.smallest.cmp(&b.smallest));
                let mut entries = Vec::new();
                for output in &outputs {
                    let table = Arc::new(
                        Table::open(
                            files::run_path(&self.env.dir, output.file_no),
                            &self.env.opts,
                        )
                        .unwrap(),
                    );
                    let mut iter = table.iter();
                    iter.seek_to_first();
                    while iter.valid() {
                        entries.push((
                            iter.key().user_key.clone(),
                            iter.key().sequence,
                            iter.key().kind,
                            iter.value().to_vec(),
                        ));
                        iter.next();
                    }
                }
                entries
            }
        }

        /// Builds the same plan twice; per-merge cursor state lives in the
        /// `Compaction`, so each execution needs its own.
        fn plan(
            fx: &Fixture,
            base: &[Arc<RunMeta>],
            parents: &[Arc<RunMeta>],
        ) -> Compaction {
            let mut c = Compaction::new(&fx.env.opts, 1);
            c.inputs[0] = base.to_vec();
            c.inputs[1] = parents.to_vec();
            c.input_version = Some(Arc::new(Version::new()));
            c
        }

        #[test]
        fn split_and_classical_produce_equivalent_output() {
            let fx = Fixture::new();

            // Four disjoint parent runs across the key space, older
            // versions.
            let mut parents = Vec::new();
            for chunk in 0..4u64 {
                let entries: Vec<_> = (0..50u64)
                    .map(|i| {
                        let n = chunk * 50 + i;
                        (
                            format!("k{n:04}").into_bytes(),
                            1000 + n,
                            ValueKind::Value,
                            format!("old{n}").into_bytes(),
                        )
                    })
                    .collect();
                parents.push(fx.write_run(&entries));
            }

            // One base run overwriting every third key and deleting every
            // seventh.
            let base_entries: Vec<_> = (0..200u64)
                .filter(|n| n % 3 == 0 || n % 7 == 0)
                .map(|n| {
                    if n % 7 == 0 {
                        (
                            format!("k{n:04}").into_bytes(),
                            5000 + n,
                            ValueKind::Tombstone,
                            Vec::new(),
                        )
                    } else {
                        (
                            format!("k{n:04}").into_bytes(),
                            5000 + n,
                            ValueKind::Value,
                            format!("new{n}").into_bytes(),
                        )
                    }
                })
                .collect();
            let base = vec![fx.write_run(&base_entries)];

            let shutdown = AtomicBool::new(false);
            let fence = 1100;

            let mut classical = plan(&fx, &base, &parents);
            let classical_outputs = worker::run_merge(
                &fx.env,
                &mut classical,
                &MergeBounds::all(),
                fence,
                fx.alloc().as_ref(),
                &shutdown,
            )
            .unwrap();

            let sharded = plan(&fx, &base, &parents);
            let shards =
                plan_shards(&sharded, &fx.env.opts, 4).expect("inputs are large enough");
            assert!(shards.len() >= 2);
            let pool = WorkerPool::new(4);
            let split_outputs = run_split(
                &fx.env,
                &sharded,
                shards,
                &pool,
                fence,
                fx.alloc(),
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap();

            let classical_entries = fx.scan_outputs(&classical_outputs);
            let split_entries = fx.scan_outputs(&split_outputs);
            assert!(!classical_entries.is_empty());
            assert_eq!(classical_entries, split_entries);
        }
    }

    #[test]
    fn shard_weights_are_balanced() {
        let opts = Options::default();
        let mut c = Compaction::new(&opts, 1);
        c.inputs[0] = vec![run(1, 1 << 20, b"a", b"z")];
        // Uneven parent sizes: 8MB, 1MB, 1MB, 1MB, 8MB, 1MB.
        c.inputs[1] = vec![
            run(10, 8 << 20, b"a", b"c"),
            run(11, 1 << 20, b"d", b"e"),
            run(12, 1 << 20, b"f", b"g"),
            run(13, 1 << 20, b"h", b"i"),
            run(14, 8 << 20, b"j", b"k"),
            run(15, 1 << 20, b"l", b"m"),
        ];
        let shards = plan_shards(&c, &opts, 2).expect("splits in two");
        assert_eq!(shards.len(), 2);
        let first: u64 = total_file_size(&shards[0].parents);
        let second: u64 = total_file_size(&shards[1].parents);
        // 20MB total; the bisection should land near 10/10, certainly not
        // 19/1.
        assert!(first >= 8 << 20 && second >= 8 << 20, "{first} vs {second}");
    }
}
