//! GuardDB: an embedded, persistent, ordered key-value store.
//!
//! The engine is a log-structured merge tree with *guard*-partitioned
//! levels. Writes land in a write-ahead log and an in-memory table;
//! frozen memtables flush to level-0 files cut along guard keys derived
//! deterministically from the keys themselves, and background compaction
//! merges one level's guard partitions into the next. Reads merge the
//! memtables with the on-disk levels, and snapshots pin a point in the
//! commit sequence.
//!
//! ```no_run
//! use guarddb::{Database, Options, ReadOptions, WriteOptions};
//!
//! let db = Database::open(Options::default(), "/tmp/my-db")?;
//! db.put(&WriteOptions::new(), b"name", b"guarddb")?;
//! assert_eq!(
//!     db.get(&ReadOptions::new(), b"name")?,
//!     Some(b"guarddb".to_vec())
//! );
//! # Ok::<(), guarddb::Error>(())
//! ```

pub mod batch;
mod compaction;
pub mod config;
pub mod db;
pub mod error;
pub mod filename;
pub mod flock;
mod flush;
pub mod guards;
pub mod ikey;
pub mod iterator;
pub mod memtable;
pub mod replay;
pub mod snapshot;
pub mod sstable;
pub mod table_cache;
#[cfg(test)]
pub(crate) mod tmpfs;
pub mod version;
pub mod wal;

pub use batch::WriteBatch;
pub use config::{
    BytewiseComparator, Comparator, Compression, Options, ReadOptions, WriteOptions,
};
pub use db::Database;
pub use error::{Error, Result};
pub use iterator::DbIterator;
pub use replay::ReplayIterator;
pub use snapshot::Snapshot;
