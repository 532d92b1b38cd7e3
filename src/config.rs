/// Number of levels the catalog partitions runs into.
pub const NUM_LEVELS: usize = 7;

/// Number of level-0 runs that triggers a size-driven compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Number of level-0 runs at which writes are delayed by 1ms each.
pub const L0_SLOWDOWN_TRIGGER: usize = 8;

/// Number of level-0 runs at which writes stop until compaction catches up.
pub const L0_STOP_TRIGGER: usize = 12;

/// Largest key accepted by the write path. Longer keys are rejected as
/// invalid arguments; the block format stores key fragments with 16-bit
/// lengths.
pub const MAX_KEY_SIZE: usize = 64 * 1024;

/// Block compression applied by the run writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
}

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the database directory if it does not exist (default: true).
    pub create_if_missing: bool,

    /// Fail the open if the database already exists (default: false).
    pub error_if_exists: bool,

    /// Verify checksums on every read and surface tail corruption instead of
    /// truncating it during recovery (default: false).
    pub paranoid_checks: bool,

    /// Memtable size threshold that seals the active table (default: 4MB).
    pub write_buffer_size: usize,

    /// Capacity of the run reader cache (default: 1000).
    pub max_open_files: usize,

    /// Uncompressed size target for run data blocks (default: 4KB).
    pub block_size: usize,

    /// Entries between restart points inside a block (default: 16).
    pub block_restart_interval: usize,

    /// Compression for run data blocks (default: snappy).
    pub compression: Compression,

    /// Byte size at which an output run is cut during compaction
    /// (default: 2MB).
    pub max_file_size: u64,

    /// Append to the last write-ahead log on open instead of rotating, when
    /// its tail replays cleanly (default: false).
    pub reuse_logs: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            compression: Compression::Snappy,
            max_file_size: 2 * 1024 * 1024,
            reuse_logs: false,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_if_missing(mut self, yes: bool) -> Self {
        self.create_if_missing = yes;
        self
    }

    pub fn error_if_exists(mut self, yes: bool) -> Self {
        self.error_if_exists = yes;
        self
    }

    pub fn paranoid_checks(mut self, yes: bool) -> Self {
        self.paranoid_checks = yes;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = count;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    pub fn reuse_logs(mut self, yes: bool) -> Self {
        self.reuse_logs = yes;
        self
    }

    /// Soft byte budget for a level. Level 0 is scored by run count instead.
    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        let mut bytes = 10 * 1024 * 1024u64;
        let mut l = 1;
        while l < level {
            bytes *= 10;
            l += 1;
        }
        bytes
    }

    /// Cap on how many bytes of level+2 an output run may overlap before the
    /// run is cut. Bounds the input size of the future compaction that will
    /// consume the run.
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        10 * self.max_file_size
    }

    /// Cap on the combined input size when growing the lower-level input set
    /// of a compaction.
    pub fn expanded_compaction_byte_limit(&self) -> u64 {
        25 * self.max_file_size
    }

    /// Combined input size below which a split compaction is not worth the
    /// coordination overhead.
    pub fn split_compaction_min_bytes(&self) -> u64 {
        4 * self.max_file_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = Options::default();
        assert!(opts.create_if_missing);
        assert!(!opts.error_if_exists);
        assert_eq!(opts.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(opts.block_restart_interval, 16);
        assert_eq!(opts.compression, Compression::Snappy);
    }

    #[test]
    fn builder_chains() {
        let opts = Options::new()
            .write_buffer_size(1024)
            .max_file_size(4096)
            .compression(Compression::None)
            .paranoid_checks(true);
        assert_eq!(opts.write_buffer_size, 1024);
        assert_eq!(opts.max_file_size, 4096);
        assert_eq!(opts.compression, Compression::None);
        assert!(opts.paranoid_checks);
    }

    #[test]
    fn level_budget_grows_geometrically() {
        let opts = Options::default();
        assert_eq!(opts.max_bytes_for_level(1), 10 * 1024 * 1024);
        assert_eq!(opts.max_bytes_for_level(2), 100 * 1024 * 1024);
        assert_eq!(opts.max_bytes_for_level(3), 1000 * 1024 * 1024);
    }
}
