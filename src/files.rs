//! Database file naming.
//!
//! Everything under a database directory is identified by name alone:
//!
//! - `CURRENT` points at the live manifest,
//! - `MANIFEST-NNNNNN` is the version-edit journal,
//! - `NNNNNN.log` is a write-ahead log,
//! - `NNNNNN.sst` is an immutable sorted run,
//! - `LOCK` is the advisory directory lock,
//! - `NNNNNN.tmp` is a scratch file replaced via rename.
//!
//! Recovery and garbage collection both work by parsing a directory listing
//! back into `(FileKind, file_no)` pairs.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Current,
    Lock,
    Manifest,
    Wal,
    Run,
    Temp,
}

pub fn current_path(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

pub fn manifest_path(dir: &Path, file_no: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{file_no:06}"))
}

pub fn wal_path(dir: &Path, file_no: u64) -> PathBuf {
    dir.join(format!("{file_no:06}.log"))
}

pub fn run_path(dir: &Path, file_no: u64) -> PathBuf {
    dir.join(format!("{file_no:06}.sst"))
}

pub fn temp_path(dir: &Path, file_no: u64) -> PathBuf {
    dir.join(format!("{file_no:06}.tmp"))
}

/// Parses a file name back into its kind and number. Returns `None` for
/// names this store never writes.
pub fn parse_file_name(name: &str) -> Option<(FileKind, u64)> {
    match name {
        "CURRENT" => return Some((FileKind::Current, 0)),
        "LOCK" => return Some((FileKind::Lock, 0)),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return rest.parse().ok().map(|no| (FileKind::Manifest, no));
    }
    if let Some(stem) = name.strip_suffix(".log") {
        return stem.parse().ok().map(|no| (FileKind::Wal, no));
    }
    if let Some(stem) = name.strip_suffix(".sst") {
        return stem.parse().ok().map(|no| (FileKind::Run, no));
    }
    if let Some(stem) = name.strip_suffix(".tmp") {
        return stem.parse().ok().map(|no| (FileKind::Temp, no));
    }
    None
}
