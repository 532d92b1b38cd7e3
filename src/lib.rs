//! EmberDB: an embedded, ordered key-value store.
//!
//! Writes land in a write-ahead log and a concurrent-skip-list memtable;
//! sealed memtables flush to immutable sorted runs arranged into levels,
//! tracked by a versioned catalog whose deltas are journaled in a manifest.
//! A background thread keeps the levels healthy with merging compactions;
//! large merges are partitioned into key-disjoint shards and executed in
//! parallel on a fixed worker pool, committed atomically as one catalog
//! edit. Reads — point lookups and bidirectional iterators — run against a
//! frozen `(version, sequence)` pair, so snapshots stay stable under
//! concurrent writes and compactions.
//!
//! ```no_run
//! use emberdb::{Db, Options};
//!
//! let db = Db::open("/tmp/demo-db", Options::default())?;
//! db.put(b"answer", b"42", true)?;
//! assert_eq!(db.get(b"answer")?, Some(b"42".to_vec()));
//!
//! let snapshot = db.snapshot();
//! db.put(b"answer", b"43", false)?;
//! assert_eq!(db.get_at(b"answer", Some(&snapshot))?, Some(b"42".to_vec()));
//! # Ok::<(), emberdb::Error>(())
//! ```

pub mod batch;
mod cache;
mod compaction;
pub mod config;
pub mod db;
pub mod error;
mod files;
mod flock;
mod iterator;
pub mod key;
mod memtable;
pub mod snapshot;
mod sstable;
mod version;
mod wal;

pub use batch::Batch;
pub use config::{Compression, Options};
pub use db::{Db, DbIterator, DbStats, LevelStats};
pub use error::{Error, Result};
pub use key::{SequenceNumber, ValueKind};
pub use snapshot::Snapshot;
