use std::cmp::Ordering;
use std::sync::Arc;

use crate::snapshot::Snapshot;

/// Number of levels in the tree, level 0 included.
pub const NUM_LEVELS: usize = 7;

/// A total order over user keys.
///
/// The same comparator must be supplied on every open of a database; the
/// name is recorded in the manifest and checked on recovery.
pub trait Comparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Identifies the ordering. Changing the order of a comparator without
    /// changing its name is undetectable and corrupts the database.
    fn name(&self) -> &str;
}

/// Default byte-lexicographic ordering.
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &str {
        "guarddb.BytewiseComparator"
    }
}

/// Block compression applied to SSTable data blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
}

/// Configuration for a database.
#[derive(Clone)]
pub struct Options {
    /// Create the database directory if it does not exist (default: true)
    pub create_if_missing: bool,

    /// Fail `open` when the database already exists (default: false)
    pub error_if_exists: bool,

    /// Treat background corruption as fatal instead of skipping past it
    /// (default: false)
    pub paranoid_checks: bool,

    /// Approximate memtable footprint before rotation (default: 4MB)
    pub write_buffer_size: usize,

    /// Number of tables kept open in the table cache (default: 1000)
    pub max_open_files: usize,

    /// Target uncompressed size of an SSTable data block (default: 4KB)
    pub block_size: usize,

    /// Keys between prefix-compression restart points (default: 16)
    pub block_restart_interval: usize,

    /// Size at which a compaction output file is rolled (default: 2MB)
    pub max_file_size: u64,

    /// Data block compression (default: Snappy)
    pub compression: Compression,

    /// Bits per key for the file-level Bloom filters; 0 disables filters
    /// (default: 10)
    pub bloom_bits_per_key: usize,

    /// User key ordering (default: bytewise)
    pub comparator: Arc<dyn Comparator>,

    /// Level-0 file count that triggers compaction (default: 4)
    pub l0_compaction_trigger: usize,

    /// Level-0 file count at which writers are delayed 1ms per round
    /// (default: 8)
    pub l0_slowdown_writes_trigger: usize,

    /// Level-0 file count at which writers stop entirely (default: 12)
    pub l0_stop_writes_trigger: usize,

    /// Low bits of the key hash that must be set for a level-0 guard
    /// (default: 17)
    pub guard_top_level_bits: u32,

    /// Bits subtracted per level; each deeper level roughly doubles guard
    /// density (default: 1)
    pub guard_bit_decrement: u32,
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
            max_file_size: 2 * 1024 * 1024,
            compression: Compression::Snappy,
            bloom_bits_per_key: 10,
            comparator: Arc::new(BytewiseComparator),
            l0_compaction_trigger: 4,
            l0_slowdown_writes_trigger: 8,
            l0_stop_writes_trigger: 12,
            guard_top_level_bits: 17,
            guard_bit_decrement: 1,
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

    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn max_open_files(mut self, n: usize) -> Self {
        self.max_open_files = n;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn block_restart_interval(mut self, n: usize) -> Self {
        self.block_restart_interval = n;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn bloom_bits_per_key(mut self, bits: usize) -> Self {
        self.bloom_bits_per_key = bits;
        self
    }

    pub fn comparator(mut self, cmp: Arc<dyn Comparator>) -> Self {
        self.comparator = cmp;
        self
    }

    pub fn l0_compaction_trigger(mut self, n: usize) -> Self {
        self.l0_compaction_trigger = n;
        self
    }

    pub fn l0_slowdown_writes_trigger(mut self, n: usize) -> Self {
        self.l0_slowdown_writes_trigger = n;
        self
    }

    pub fn l0_stop_writes_trigger(mut self, n: usize) -> Self {
        self.l0_stop_writes_trigger = n;
        self
    }

    pub fn guard_top_level_bits(mut self, bits: u32) -> Self {
        self.guard_top_level_bits = bits;
        self
    }

    pub fn guard_bit_decrement(mut self, bits: u32) -> Self {
        self.guard_bit_decrement = bits;
        self
    }

    /// Byte budget for a level; the compaction score of level L >= 1 is its
    /// total size divided by this.
    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        let mut budget = 10 * 1024 * 1024u64;
        for _ in 1..level {
            budget *= 10;
        }
        budget
    }
}

/// Per-read options.
#[derive(Clone)]
pub struct ReadOptions {
    /// Read as of this snapshot instead of the latest committed state.
    pub snapshot: Option<Arc<Snapshot>>,

    /// Verify block checksums on every read (default: false)
    pub verify_checksums: bool,

    /// Keep tables touched by this read in the table cache (default: true)
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            snapshot: None,
            verify_checksums: false,
            fill_cache: true,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(mut self, snapshot: Arc<Snapshot>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn verify_checksums(mut self, yes: bool) -> Self {
        self.verify_checksums = yes;
        self
    }
}

/// Per-write options.
#[derive(Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the write-ahead log before acknowledging (default: false)
    pub sync: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(mut self, yes: bool) -> Self {
        self.sync = yes;
        self
    }
}
