//! The database engine.
//!
//! # Write path
//!
//! Writers queue FIFO; the writer at the head becomes the leader,
//! coalesces the batches behind it (bounded by a ceiling scaled to the
//! first batch), passes admission control, appends the merged batch to
//! the WAL, applies it to the active memtable and publishes the new
//! sequence before waking the group. Admission delays writers 1ms per
//! round once level 0 reaches the slowdown trigger, and parks them
//! entirely at the stop trigger or while the immutable memtable is still
//! being flushed.
//!
//! # Background work
//!
//! Two workers run against shared state under the `mem_state` mutex:
//! the *flusher* turns the immutable memtable into guard-partitioned
//! level-0 tables, and the *compactor* merges a level's partitions into
//! the next level whenever a level's score reaches one or a manual
//! request is queued. Each role has its own condition variable so a
//! wake-up only reaches the worker that has work to do; `bg_fg_cv`
//! reports background progress to parked foreground threads, the
//! manifest writer is guarded by `bg_log_cv`, and `backup_cv` serializes
//! live backups. Catalog edits latch their first failure as a
//! background error that fails all subsequent writes until reopen.
//!
//! # Read path
//!
//! Reads snapshot the memtable pointers and the current version under a
//! brief lock, then run lock-free: active memtable, immutable memtable,
//! then the version's levels (level 0 newest first, deeper levels
//! through their guard partitions, Bloom filters consulted first).

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::batch::{BatchVisitor, WriteBatch};
use crate::compaction;
use crate::config::{Options, ReadOptions, WriteOptions, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::filename::{self, FileType};
use crate::flock::FileLock;
use crate::flush;
use crate::guards::guard_level;
use crate::ikey::{LookupKey, SeqNo, ValueKind};
use crate::iterator::{DbIterator, InternalIterator, IterPins, LevelIterator, MergingIterator};
use crate::memtable::{Memtable, MemtableIterator};
use crate::replay::{self, ReplayIterator};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::table_cache::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::set::{write_pending, VersionSet};
use crate::version::{LookupResult, Version};
use crate::wal::{LogReader, LogWriter};

const SLOWDOWN_SLEEP: Duration = Duration::from_millis(1);

/// Ceiling for group commit: small leading batches only pull in a
/// bounded amount of followers so their latency stays low.
const GROUP_COMMIT_SLACK: usize = 128 * 1024;
const GROUP_COMMIT_MAX: usize = 1 << 20;

struct WriterSlot {
    batch: Mutex<Option<WriteBatch>>,
    sync: bool,
    force_rotate: bool,
    done: AtomicBool,
    result: Mutex<Option<Result<()>>>,
}

struct ManualCompaction {
    level: usize,
    begin: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    done: AtomicBool,
    result: Mutex<Option<Result<()>>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct CompactionStats {
    bytes_read: u64,
    bytes_written: u64,
    count: u64,
}

pub(crate) struct MemState {
    pub(crate) mem: Arc<Memtable>,
    pub(crate) imm: Option<Arc<Memtable>>,
    /// Number of the active WAL.
    pub(crate) log_number: u64,
    /// Number of the immutable memtable's WAL; 0 when none.
    pub(crate) prev_log_number: u64,
    /// Guards discovered by writers, waiting for the next flush edit.
    pub(crate) pending_guards: Vec<(usize, Vec<u8>)>,
    snapshots: SnapshotList,
    /// Outstanding replay iterators: (id, first retained log, sequence).
    replay_floors: Vec<(u64, u64, SeqNo)>,
    next_replay_id: u64,
    bg_error: Option<Error>,
    manual: Option<Arc<ManualCompaction>>,
    backup_in_progress: bool,
    backup_deferred_delete: bool,
}

struct VersionsState {
    set: VersionSet,
    /// True while a thread holds the manifest writer.
    log_busy: bool,
}

pub(crate) struct DbInner {
    pub(crate) opts: Arc<Options>,
    pub(crate) dir: PathBuf,
    pub(crate) table_cache: Arc<TableCache>,

    pub(crate) mem_state: Mutex<MemState>,
    bg_memtable_cv: Condvar,
    bg_compaction_cv: Condvar,
    bg_fg_cv: Condvar,
    backup_cv: Condvar,

    versions: Mutex<VersionsState>,
    bg_log_cv: Condvar,

    log: Mutex<Option<LogWriter>>,

    current: RwLock<Arc<Version>>,
    last_sequence: AtomicU64,
    shutting_down: AtomicBool,
    pending_outputs: Mutex<HashSet<u64>>,
    stats: Mutex<[CompactionStats; NUM_LEVELS]>,

    writers: Mutex<VecDeque<Arc<WriterSlot>>>,
    writers_cv: Condvar,
}

impl DbInner {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(AtomicOrdering::Acquire)
    }

    /// Allocates a table file number and shields it from the
    /// obsolete-file sweeper until the file is installed or abandoned.
    pub(crate) fn new_table_file(&self) -> Result<(u64, PathBuf)> {
        let number = self.versions.lock()?.set.new_file_number();
        self.pending_outputs.lock()?.insert(number);
        Ok((number, filename::table_file(&self.dir, number)))
    }

    pub(crate) fn forget_pending_outputs(&self, numbers: &[u64]) {
        if let Ok(mut pending) = self.pending_outputs.lock() {
            for number in numbers {
                pending.remove(number);
            }
        }
    }

    /// Every guard known anywhere: the deepest level inherits all guard
    /// keys, plus whatever writers have proposed since the last flush.
    pub(crate) fn complete_guard_set(&self) -> Vec<Vec<u8>> {
        let version = self.current.read().unwrap().clone();
        let mut keys = version.guard_keys[NUM_LEVELS - 1].clone();
        let cmp = &self.opts.comparator;
        let st = self.mem_state.lock().unwrap();
        for (_, key) in &st.pending_guards {
            if let Err(pos) = keys.binary_search_by(|k| cmp.compare(k, key)) {
                keys.insert(pos, key.clone());
            }
        }
        keys
    }

    pub(crate) fn guard_known(&self, level: usize, key: &[u8]) -> bool {
        let version = self.current.read().unwrap().clone();
        version.guard_keys[level]
            .binary_search_by(|k| self.opts.comparator.compare(k, key))
            .is_ok()
    }

    pub(crate) fn add_stats(&self, level: usize, bytes_read: u64, bytes_written: u64) {
        if let Ok(mut stats) = self.stats.lock() {
            stats[level].bytes_read += bytes_read;
            stats[level].bytes_written += bytes_written;
            stats[level].count += 1;
        }
    }

    fn record_bg_error(&self, e: &Error) {
        let mut st = self.mem_state.lock().unwrap();
        if st.bg_error.is_none() {
            tracing::error!(error = %e, "background error latched");
            st.bg_error = Some(e.clone());
        }
        self.bg_fg_cv.notify_all();
    }

    /// Applies an edit under the manifest-writer discipline: exactly one
    /// thread holds the writer, the others wait on `bg_log_cv`, and the
    /// manifest IO runs without the catalog lock. A failed write
    /// poisons the catalog.
    pub(crate) fn apply_edit(&self, edit: &mut VersionEdit) -> Result<Arc<Version>> {
        let mut vs = self.versions.lock()?;
        while vs.log_busy {
            vs = self.bg_log_cv.wait(vs)?;
        }
        vs.log_busy = true;
        vs.set
            .set_last_sequence(self.last_sequence.load(AtomicOrdering::Acquire));
        let mut pending = match vs.set.prepare_apply(edit) {
            Ok(pending) => pending,
            Err(e) => {
                vs.log_busy = false;
                self.bg_log_cv.notify_one();
                drop(vs);
                self.record_bg_error(&e);
                return Err(e);
            }
        };
        drop(vs);

        let io = write_pending(&self.dir, &mut pending);

        let mut vs = self.versions.lock()?;
        let installed = match io {
            Ok(()) => Ok(vs.set.finish_apply(pending, edit)),
            Err(e) => {
                vs.set.abort_apply(pending);
                Err(e)
            }
        };
        vs.log_busy = false;
        self.bg_log_cv.notify_one();
        drop(vs);

        match installed {
            Ok(version) => {
                *self.current.write()? = Arc::clone(&version);
                Ok(version)
            }
            Err(e) => {
                self.record_bg_error(&e);
                Err(e)
            }
        }
    }

    fn smallest_snapshot(&self) -> SeqNo {
        let st = self.mem_state.lock().unwrap();
        st.snapshots
            .oldest()
            .unwrap_or_else(|| self.last_sequence.load(AtomicOrdering::Acquire))
    }

    /// Removes files the engine no longer references. Deferred while a
    /// live backup is copying the directory.
    fn delete_obsolete_files(&self) {
        let log_floor = {
            let mut st = self.mem_state.lock().unwrap();
            if st.backup_in_progress {
                st.backup_deferred_delete = true;
                return;
            }
            let mut floor = st.log_number;
            if st.imm.is_some() && st.prev_log_number != 0 {
                floor = floor.min(st.prev_log_number);
            }
            for (_, log, _) in &st.replay_floors {
                floor = floor.min(*log);
            }
            floor
        };
        let (live, manifest_number) = {
            let mut vs = self.versions.lock().unwrap();
            (vs.set.live_files(), vs.set.manifest_number())
        };
        let pending = self.pending_outputs.lock().unwrap().clone();

        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(file_type) = filename::parse_file_name(&name) else {
                continue;
            };
            let keep = match file_type {
                FileType::Log(n) => n >= log_floor,
                FileType::Table(n) => live.contains(&n) || pending.contains(&n),
                FileType::Manifest(n) => n >= manifest_number,
                FileType::Current | FileType::Lock | FileType::InfoLog => true,
            };
            if !keep {
                if let FileType::Table(n) = file_type {
                    self.table_cache.evict(n);
                }
                let _ = std::fs::remove_file(entry.path());
                tracing::debug!(file = %name, "removed obsolete file");
            }
        }
    }

    /// Admission control for the head writer. Returns the memtable the
    /// group commits into.
    fn make_room_for_write(&self, force_rotate: bool) -> Result<Arc<Memtable>> {
        let mut st = self.mem_state.lock()?;
        let mut allow_delay = true;
        let mut force = force_rotate;
        loop {
            if let Some(e) = &st.bg_error {
                return Err(e.clone());
            }
            if self.is_shutting_down() {
                return Err(Error::Io("database is shutting down".to_string()));
            }
            let l0_files = self.current.read()?.num_files(0);
            if allow_delay && l0_files >= self.opts.l0_slowdown_writes_trigger {
                // One delay round per writer: shed a little throughput to
                // the compactor without stalling outright.
                drop(st);
                std::thread::sleep(SLOWDOWN_SLEEP);
                allow_delay = false;
                st = self.mem_state.lock()?;
                continue;
            }
            let mem_full = st.mem.approximate_size() >= self.opts.write_buffer_size;
            if !mem_full && !(force && !st.mem.is_empty()) {
                break;
            }
            if st.imm.is_some() {
                st = self.bg_fg_cv.wait(st)?;
                continue;
            }
            if l0_files >= self.opts.l0_stop_writes_trigger {
                tracing::warn!(l0_files, "level-0 at stop trigger; stalling writes");
                st = self.bg_fg_cv.wait(st)?;
                continue;
            }
            self.rotate_memtable_locked(&mut st)?;
            force = false;
        }
        Ok(Arc::clone(&st.mem))
    }

    /// Freezes the active memtable, opens a fresh WAL and memtable, and
    /// signals the flusher. Caller holds the `mem_state` lock and the
    /// head-writer role.
    fn rotate_memtable_locked(&self, st: &mut MemState) -> Result<()> {
        let new_log_number = self.versions.lock()?.set.new_file_number();
        let writer = LogWriter::create(filename::log_file(&self.dir, new_log_number), new_log_number)?;
        {
            let mut log = self.log.lock()?;
            if let Some(old) = log.as_mut() {
                old.flush()?;
            }
            *log = Some(writer);
        }
        st.prev_log_number = st.log_number;
        st.log_number = new_log_number;
        let fresh = Arc::new(Memtable::new(
            Arc::clone(&self.opts.comparator),
            new_log_number,
        ));
        let frozen = std::mem::replace(&mut st.mem, fresh);
        st.imm = Some(frozen);
        self.bg_memtable_cv.notify_one();
        tracing::debug!(log = new_log_number, "rotated memtable");
        Ok(())
    }

    /// WAL append, fsync on demand, memtable apply, sequence publish.
    fn commit_group(&self, batch: &mut WriteBatch, sync: bool, mem: &Arc<Memtable>) -> Result<()> {
        let mut finder = GuardFinder {
            db: self,
            found: Vec::new(),
        };
        batch.iterate(&mut finder)?;
        for (level, key) in &finder.found {
            batch.add_guard(*level, key);
        }

        let seq = self.last_sequence.load(AtomicOrdering::Acquire);
        batch.set_sequence(seq + 1);
        let count = batch.count() as u64;

        if count > 0 || !finder.found.is_empty() || sync {
            let mut log = self.log.lock()?;
            let log = log
                .as_mut()
                .ok_or_else(|| Error::Io("write-ahead log closed".to_string()))?;
            let appended = if count > 0 || !finder.found.is_empty() {
                log.add_record(batch.encoded()).and_then(|_| log.flush())
            } else {
                Ok(())
            };
            let synced = appended.and_then(|_| if sync { log.sync() } else { Ok(()) });
            if let Err(e) = synced {
                drop(log);
                self.record_bg_error(&e);
                return Err(e);
            }
        }

        let mut inserter = MemtableInserter {
            seq: seq + 1,
            mem: mem.as_ref(),
        };
        batch.iterate(&mut inserter)?;

        self.last_sequence
            .store(seq + count, AtomicOrdering::Release);

        if !finder.found.is_empty() {
            let mut st = self.mem_state.lock()?;
            for (level, key) in finder.found {
                if !st
                    .pending_guards
                    .iter()
                    .any(|(l, k)| *l == level && *k == key)
                {
                    st.pending_guards.push((level, key));
                }
            }
        }
        Ok(())
    }
}

struct GuardFinder<'a> {
    db: &'a DbInner,
    found: Vec<(usize, Vec<u8>)>,
}

impl GuardFinder<'_> {
    fn observe(&mut self, key: &[u8]) {
        if let Some(level) = guard_level(key, &self.db.opts) {
            let known = self.db.guard_known(level, key)
                || self
                    .found
                    .iter()
                    .any(|(l, k)| *l == level && k.as_slice() == key);
            if !known {
                self.found.push((level, key.to_vec()));
            }
        }
    }
}

impl BatchVisitor for GuardFinder<'_> {
    fn put(&mut self, key: &[u8], _value: &[u8]) -> Result<()> {
        self.observe(key);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.observe(key);
        Ok(())
    }
}

struct MemtableInserter<'a> {
    seq: SeqNo,
    mem: &'a Memtable,
}

impl BatchVisitor for MemtableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.mem.add(self.seq, ValueKind::Value, key, value);
        self.seq += 1;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.mem.add(self.seq, ValueKind::Deletion, key, b"");
        self.seq += 1;
        Ok(())
    }
}

/// A handle to an open database directory.
pub struct Database {
    inner: Arc<DbInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    _lock: FileLock,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (and if permitted, creates) the database at `path`,
    /// recovering the catalog and replaying any write-ahead logs.
    pub fn open(opts: Options, path: impl AsRef<Path>) -> Result<Database> {
        let opts = Arc::new(opts);
        let dir = path.as_ref().to_path_buf();

        if opts.create_if_missing {
            std::fs::create_dir_all(&dir)?;
        } else if !dir.exists() {
            return Err(Error::InvalidArgument(format!(
                "{} does not exist",
                dir.display()
            )));
        }

        let lock = FileLock::lock(filename::lock_file(&dir))?;

        let current_exists = filename::current_file(&dir).exists();
        if current_exists && opts.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "{} already exists",
                dir.display()
            )));
        }
        if !current_exists && !opts.create_if_missing {
            return Err(Error::InvalidArgument(format!(
                "{} has no database",
                dir.display()
            )));
        }

        let mut versions = VersionSet::new(dir.clone(), Arc::clone(&opts));
        if current_exists {
            versions.recover()?;
        } else {
            versions.create_new()?;
            tracing::info!(dir = %dir.display(), "created new database");
        }

        let table_cache = Arc::new(TableCache::new(dir.clone(), Arc::clone(&opts)));

        // Replay WALs newer than the catalog, writing their contents
        // straight to level-0 tables.
        let mut edit = VersionEdit::new();
        let mut max_seq = versions.last_sequence();
        recover_log_files(&dir, &opts, &mut versions, &mut edit, &mut max_seq)?;

        let new_log_number = versions.new_file_number();
        let log_writer = LogWriter::create(filename::log_file(&dir, new_log_number), new_log_number)?;
        edit.log_number = Some(new_log_number);
        edit.prev_log_number = Some(0);
        versions.set_last_sequence(max_seq);
        let current = versions.log_and_apply(&mut edit)?;

        let mem = Arc::new(Memtable::new(Arc::clone(&opts.comparator), new_log_number));
        let inner = Arc::new(DbInner {
            opts: Arc::clone(&opts),
            dir,
            table_cache,
            mem_state: Mutex::new(MemState {
                mem,
                imm: None,
                log_number: new_log_number,
                prev_log_number: 0,
                pending_guards: Vec::new(),
                snapshots: SnapshotList::new(),
                replay_floors: Vec::new(),
                next_replay_id: 1,
                bg_error: None,
                manual: None,
                backup_in_progress: false,
                backup_deferred_delete: false,
            }),
            bg_memtable_cv: Condvar::new(),
            bg_compaction_cv: Condvar::new(),
            bg_fg_cv: Condvar::new(),
            backup_cv: Condvar::new(),
            versions: Mutex::new(VersionsState {
                set: versions,
                log_busy: false,
            }),
            bg_log_cv: Condvar::new(),
            log: Mutex::new(Some(log_writer)),
            current: RwLock::new(current),
            last_sequence: AtomicU64::new(max_seq),
            shutting_down: AtomicBool::new(false),
            pending_outputs: Mutex::new(HashSet::new()),
            stats: Mutex::new([CompactionStats::default(); NUM_LEVELS]),
            writers: Mutex::new(VecDeque::new()),
            writers_cv: Condvar::new(),
        });

        inner.delete_obsolete_files();

        let mut threads = Vec::new();
        {
            let db = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("guarddb-flush".to_string())
                    .spawn(move || flusher_loop(db))?,
            );
        }
        {
            let db = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("guarddb-compact".to_string())
                    .spawn(move || compactor_loop(db))?,
            );
        }

        Ok(Database {
            inner,
            threads: Mutex::new(threads),
            _lock: lock,
        })
    }

    /// Removes every engine-owned file under `path` and the directory
    /// itself if nothing else remains.
    pub fn destroy(path: impl AsRef<Path>, _opts: &Options) -> Result<()> {
        let dir = path.as_ref();
        if !dir.exists() {
            return Ok(());
        }
        let lock = FileLock::lock(filename::lock_file(dir))?;
        for entry in std::fs::read_dir(dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(file_type) = filename::parse_file_name(&name) {
                if file_type != FileType::Lock {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        drop(lock);
        let _ = std::fs::remove_file(filename::lock_file(dir));
        let _ = std::fs::remove_dir(dir);
        Ok(())
    }

    pub fn put(&self, opts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(opts, batch)
    }

    pub fn delete(&self, opts: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(opts, batch)
    }

    /// Commits `batch` atomically.
    pub fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.write_impl(opts, batch, false)
    }

    fn write_impl(&self, opts: &WriteOptions, batch: WriteBatch, force_rotate: bool) -> Result<()> {
        let inner = &self.inner;
        let slot = Arc::new(WriterSlot {
            batch: Mutex::new(Some(batch)),
            sync: opts.sync,
            force_rotate,
            done: AtomicBool::new(false),
            result: Mutex::new(None),
        });

        {
            let mut queue = inner.writers.lock()?;
            queue.push_back(Arc::clone(&slot));
            while !slot.done.load(AtomicOrdering::Acquire)
                && !Arc::ptr_eq(queue.front().expect("queue non-empty"), &slot)
            {
                queue = inner.writers_cv.wait(queue)?;
            }
            if slot.done.load(AtomicOrdering::Acquire) {
                return slot.result.lock()?.take().unwrap_or(Ok(()));
            }
        }

        // Head of the queue: lead the group commit. Followers cannot
        // start until this group is popped.
        let admission = inner.make_room_for_write(slot.force_rotate);
        let (group, result) = match admission {
            Err(e) => (vec![Arc::clone(&slot)], Err(e)),
            Ok(mem) => {
                let (group, mut merged, sync) = {
                    let queue = inner.writers.lock()?;
                    build_group(&queue)?
                };
                let result = inner.commit_group(&mut merged, sync, &mem);
                (group, result)
            }
        };

        {
            let mut queue = inner.writers.lock()?;
            for member in &group {
                let popped = queue.pop_front().expect("group members queued");
                debug_assert!(Arc::ptr_eq(&popped, member));
                *member.result.lock()? = Some(result.clone());
                member.done.store(true, AtomicOrdering::Release);
            }
            inner.writers_cv.notify_all();
        }
        result
    }

    /// Point lookup at the latest state or the read options' snapshot.
    pub fn get(&self, opts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;
        let seq = opts
            .snapshot
            .as_ref()
            .map(|s| s.sequence())
            .unwrap_or_else(|| inner.last_sequence.load(AtomicOrdering::Acquire));
        let (mem, imm) = {
            let st = inner.mem_state.lock()?;
            (Arc::clone(&st.mem), st.imm.clone())
        };
        let version = inner.current.read()?.clone();

        if let Some(hit) = mem.get(key, seq) {
            return Ok(hit);
        }
        if let Some(imm) = imm {
            if let Some(hit) = imm.get(key, seq) {
                return Ok(hit);
            }
        }
        let lookup = LookupKey::new(key, seq);
        match version.get(&lookup, &inner.table_cache, opts.verify_checksums, opts.fill_cache)? {
            LookupResult::Value(value) => Ok(Some(value)),
            LookupResult::Deleted | LookupResult::NotFound => Ok(None),
        }
    }

    /// A bidirectional iterator over the user-visible mapping.
    pub fn new_iterator(&self, opts: &ReadOptions) -> Result<DbIterator> {
        let inner = &self.inner;
        let seq = opts
            .snapshot
            .as_ref()
            .map(|s| s.sequence())
            .unwrap_or_else(|| inner.last_sequence.load(AtomicOrdering::Acquire));
        let (mem, imm) = {
            let st = inner.mem_state.lock()?;
            (Arc::clone(&st.mem), st.imm.clone())
        };
        let version = inner.current.read()?.clone();

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        children.push(Box::new(MemtableIterator::new(Arc::clone(&mem))));
        if let Some(imm) = &imm {
            children.push(Box::new(MemtableIterator::new(Arc::clone(imm))));
        }
        for file in &version.files[0] {
            let table = inner.table_cache.get(file.number, opts.fill_cache)?;
            children.push(Box::new(table.iter(opts.verify_checksums)));
        }
        for level in 1..NUM_LEVELS {
            if version.files[level].is_empty() {
                continue;
            }
            children.push(Box::new(LevelIterator::new(
                &version,
                level,
                Arc::clone(&inner.table_cache),
                opts.verify_checksums,
                opts.fill_cache,
            )));
        }

        let merging = MergingIterator::new(Arc::clone(&inner.opts.comparator), children);
        let pins = IterPins { mem, imm, version };
        Ok(DbIterator::new(
            merging,
            Arc::clone(&inner.opts.comparator),
            seq,
            Some(pins),
        ))
    }

    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        let mut st = self.inner.mem_state.lock().unwrap();
        st.snapshots
            .acquire(self.inner.last_sequence.load(AtomicOrdering::Acquire))
    }

    pub fn release_snapshot(&self, snapshot: Arc<Snapshot>) {
        let mut st = self.inner.mem_state.lock().unwrap();
        st.snapshots.release(&snapshot);
    }

    /// Introspection properties. Unrecognized names return `None`.
    pub fn get_property(&self, name: &str) -> Option<String> {
        let version = self.inner.current.read().ok()?.clone();
        if let Some(level) = parse_level(name, "num-files-at-level") {
            return Some(version.num_files(level).to_string());
        }
        if let Some(level) = parse_level(name, "num-guards-at-level") {
            return Some(version.guard_keys[level].len().to_string());
        }
        if let Some(level) = parse_level(name, "num-guard-files-at-level") {
            let count: usize = version.guards[level].iter().map(|g| g.files.len()).sum();
            return Some(count.to_string());
        }
        if let Some(level) = parse_level(name, "num-sentinel-files-at-level") {
            return Some(version.sentinels[level].len().to_string());
        }
        if let Some(level) = parse_level(name, "guard-details-at-level") {
            return Some(version.guard_details(level));
        }
        if let Some(level) = parse_level(name, "sentinel-details-at-level") {
            return Some(version.sentinel_details(level));
        }
        match name {
            "sstables" => {
                let stats = self.inner.stats.lock().ok()?;
                let mut out = String::new();
                for level in 0..NUM_LEVELS {
                    out.push_str(&format!(
                        "level {level} ({} files, {} bytes, {} compactions):\n",
                        version.num_files(level),
                        version.total_bytes(level),
                        stats[level].count
                    ));
                    for file in &version.files[level] {
                        out.push_str(&format!(
                            "  {}: {} bytes [{:?}..{:?}]\n",
                            file.number,
                            file.file_size,
                            String::from_utf8_lossy(file.smallest_user()),
                            String::from_utf8_lossy(file.largest_user()),
                        ));
                    }
                }
                Some(out)
            }
            "current-version-state" => Some(version.debug_string()),
            _ => None,
        }
    }

    /// Synchronously compacts every level whose files overlap the range;
    /// `None` bounds are open-ended.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.force_flush()?;
        let max_level = self.inner.current.read()?.max_level_with_files();
        for level in 0..=max_level.min(NUM_LEVELS - 2) {
            self.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Flushes the active memtable and waits for the tables to land.
    /// Diagnostic aid; the steady-state path rotates on size.
    pub fn force_flush(&self) -> Result<()> {
        {
            let st = self.inner.mem_state.lock()?;
            if st.mem.is_empty() && st.imm.is_none() {
                return Ok(());
            }
        }
        self.write_impl(&WriteOptions::new(), WriteBatch::new(), true)?;
        let mut st = self.inner.mem_state.lock()?;
        while st.imm.is_some() {
            if let Some(e) = &st.bg_error {
                return Err(e.clone());
            }
            st = self.inner.bg_fg_cv.wait(st)?;
        }
        Ok(())
    }

    /// Compacts every populated level once. Diagnostic aid.
    pub fn force_compact(&self) -> Result<()> {
        self.compact_range(None, None)
    }

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let inner = &self.inner;
        let request = Arc::new(ManualCompaction {
            level,
            begin: begin.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            done: AtomicBool::new(false),
            result: Mutex::new(None),
        });

        let mut st = inner.mem_state.lock()?;
        loop {
            if let Some(e) = &st.bg_error {
                return Err(e.clone());
            }
            if inner.is_shutting_down() {
                return Err(Error::Io("database is shutting down".to_string()));
            }
            if st.manual.is_none() {
                st.manual = Some(Arc::clone(&request));
                inner.bg_compaction_cv.notify_all();
                break;
            }
            st = inner.bg_fg_cv.wait(st)?;
        }
        while !request.done.load(AtomicOrdering::Acquire) {
            if let Some(e) = &st.bg_error {
                return Err(e.clone());
            }
            st = inner.bg_fg_cv.wait(st)?;
        }
        let result = request.result.lock()?.take().unwrap_or(Ok(()));
        result
    }

    /// Rough on-disk byte counts for user-key ranges; `None` bounds are
    /// open-ended.
    pub fn get_approximate_sizes(&self, ranges: &[(Option<&[u8]>, Option<&[u8]>)]) -> Vec<u64> {
        let version = self.inner.current.read().unwrap().clone();
        ranges
            .iter()
            .map(|(begin, end)| version.approximate_size(*begin, *end))
            .collect()
    }

    /// An opaque token marking the current position in the change log.
    pub fn get_replay_timestamp(&self) -> Vec<u8> {
        let st = self.inner.mem_state.lock().unwrap();
        replay::encode_timestamp(
            self.inner.last_sequence.load(AtomicOrdering::Acquire),
            st.log_number,
        )
    }

    pub fn validate_timestamp(&self, ts: &[u8]) -> bool {
        replay::validate_timestamp(ts)
    }

    pub fn compare_timestamps(&self, lhs: &[u8], rhs: &[u8]) -> Result<std::cmp::Ordering> {
        replay::compare_timestamps(lhs, rhs)
    }

    /// Replays every operation committed at or after the timestamp. The
    /// WAL segments involved are retained until the iterator is
    /// released.
    pub fn get_replay_iterator(&self, ts: &[u8]) -> Result<ReplayIterator> {
        let inner = &self.inner;
        let (seq, log_start) = replay::decode_timestamp(ts)?;

        {
            let mut log = inner.log.lock()?;
            if let Some(log) = log.as_mut() {
                log.flush()?;
            }
        }

        let id = {
            let mut st = inner.mem_state.lock()?;
            let id = st.next_replay_id;
            st.next_replay_id += 1;
            st.replay_floors.push((id, log_start, seq));
            id
        };

        let read = || -> Result<Vec<replay::ReplayEntry>> {
            let mut log_numbers: Vec<u64> = Vec::new();
            for entry in std::fs::read_dir(&inner.dir)?.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(FileType::Log(n)) = filename::parse_file_name(&name) {
                    if n >= log_start {
                        log_numbers.push(n);
                    }
                }
            }
            log_numbers.sort_unstable();
            let mut entries = Vec::new();
            for number in log_numbers {
                replay::read_log_entries(
                    &filename::log_file(&inner.dir, number),
                    seq,
                    &mut entries,
                )?;
            }
            Ok(entries)
        };

        match read() {
            Ok(entries) => Ok(ReplayIterator::new(id, entries)),
            Err(e) => {
                let mut st = inner.mem_state.lock()?;
                st.replay_floors.retain(|(floor_id, _, _)| *floor_id != id);
                Err(e)
            }
        }
    }

    /// Releases a replay iterator, allowing its WAL segments to be
    /// reclaimed.
    pub fn release_replay_iterator(&self, iter: ReplayIterator) {
        {
            let mut st = self.inner.mem_state.lock().unwrap();
            st.replay_floors.retain(|(id, _, _)| *id != iter.id);
        }
        self.inner.delete_obsolete_files();
    }

    /// Copies every live file into the sibling directory
    /// `<db>-backup-<name>`, atomically with respect to catalog changes.
    pub fn live_backup(&self, name: &str) -> Result<()> {
        let inner = &self.inner;
        {
            let mut st = inner.mem_state.lock()?;
            while st.backup_in_progress {
                st = inner.backup_cv.wait(st)?;
            }
            st.backup_in_progress = true;
        }

        let result = self.do_backup(name);

        {
            let mut st = inner.mem_state.lock().unwrap();
            st.backup_in_progress = false;
            let deferred = std::mem::take(&mut st.backup_deferred_delete);
            drop(st);
            inner.backup_cv.notify_all();
            if deferred {
                inner.delete_obsolete_files();
            }
        }
        result
    }

    fn do_backup(&self, name: &str) -> Result<()> {
        let inner = &self.inner;

        // Push acked writes into the log file before copying it.
        {
            let mut log = inner.log.lock()?;
            if let Some(log) = log.as_mut() {
                log.sync()?;
            }
        }

        // Hold the manifest writer so the copied manifest has no torn
        // tail and the live set cannot shift mid-copy.
        let (live, manifest_number) = {
            let mut vs = inner.versions.lock()?;
            while vs.log_busy {
                vs = inner.bg_log_cv.wait(vs)?;
            }
            vs.log_busy = true;
            (vs.set.live_files(), vs.set.manifest_number())
        };

        let copy = || -> Result<PathBuf> {
            let dir_name = inner
                .dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "db".to_string());
            let backup_dir = inner
                .dir
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(format!("{dir_name}-backup-{name}"));
            std::fs::create_dir_all(&backup_dir)?;

            for entry in std::fs::read_dir(&inner.dir)?.flatten() {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let Some(file_type) = filename::parse_file_name(&file_name) else {
                    continue;
                };
                let wanted = match file_type {
                    FileType::Current => true,
                    FileType::Manifest(n) => n == manifest_number,
                    FileType::Table(n) => live.contains(&n),
                    FileType::Log(_) => true,
                    FileType::Lock | FileType::InfoLog => false,
                };
                if !wanted {
                    continue;
                }
                let target = backup_dir.join(&file_name);
                let _ = std::fs::remove_file(&target);
                // Tables are immutable, so a hard link is a true snapshot;
                // CURRENT, manifest and logs keep changing and must be
                // copied byte-for-byte.
                let linkable = matches!(file_type, FileType::Table(_));
                if !linkable || std::fs::hard_link(entry.path(), &target).is_err() {
                    std::fs::copy(entry.path(), &target)?;
                }
            }
            Ok(backup_dir)
        };
        let copied = copy();

        {
            let mut vs = inner.versions.lock()?;
            vs.log_busy = false;
            inner.bg_log_cv.notify_one();
        }

        let backup_dir = copied?;
        tracing::info!(backup = %backup_dir.display(), "live backup complete");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        {
            let _st = self.inner.mem_state.lock();
            self.inner.shutting_down.store(true, AtomicOrdering::Release);
            self.inner.bg_memtable_cv.notify_all();
            self.inner.bg_compaction_cv.notify_all();
            self.inner.bg_fg_cv.notify_all();
        }
        if let Ok(mut threads) = self.threads.lock() {
            for thread in threads.drain(..) {
                let _ = thread.join();
            }
        }
        if let Ok(mut log) = self.inner.log.lock() {
            if let Some(log) = log.as_mut() {
                let _ = log.flush();
            }
        }
        tracing::debug!(dir = %self.inner.dir.display(), "database closed");
    }
}

/// Collects the head writer's group: contiguous queued writers whose
/// batches fit the ceiling, never folding a sync write into a non-sync
/// group.
#[allow(clippy::type_complexity)]
fn build_group(
    queue: &VecDeque<Arc<WriterSlot>>,
) -> Result<(Vec<Arc<WriterSlot>>, WriteBatch, bool)> {
    let head = queue.front().expect("head present");
    let head_batch = head
        .batch
        .lock()?
        .take()
        .expect("head batch untaken");
    let sync = head.sync;
    let head_size = head_batch.approximate_size();
    let max_size = if head_size <= GROUP_COMMIT_SLACK {
        head_size + GROUP_COMMIT_SLACK
    } else {
        GROUP_COMMIT_MAX
    };

    let mut group = vec![Arc::clone(head)];
    let mut merged = head_batch;
    let mut size = head_size;

    for slot in queue.iter().skip(1) {
        if slot.sync && !sync {
            break;
        }
        if slot.force_rotate {
            break;
        }
        let mut batch_slot = slot.batch.lock()?;
        let Some(batch) = batch_slot.as_ref() else {
            break;
        };
        if size + batch.approximate_size() > max_size {
            break;
        }
        size += batch.approximate_size();
        let batch = batch_slot.take().expect("batch present");
        drop(batch_slot);
        merged.append(&batch);
        group.push(Arc::clone(slot));
    }

    Ok((group, merged, sync))
}

fn parse_level(name: &str, prefix: &str) -> Option<usize> {
    let rest = name.strip_prefix(prefix)?;
    let level: usize = rest.parse().ok()?;
    (level < NUM_LEVELS).then_some(level)
}

/// Replays WALs at or above the catalog's log number into level-0
/// tables, re-deriving guards from the replayed keys.
fn recover_log_files(
    dir: &Path,
    opts: &Arc<Options>,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
    max_seq: &mut SeqNo,
) -> Result<()> {
    let min_log = versions.log_number();
    let mut log_numbers: Vec<u64> = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(FileType::Log(n)) = filename::parse_file_name(&name) {
            if n >= min_log {
                log_numbers.push(n);
            }
        }
    }
    log_numbers.sort_unstable();
    if log_numbers.is_empty() {
        return Ok(());
    }

    let base = versions.current();
    let mut pending_guards: Vec<(usize, Vec<u8>)> = Vec::new();
    let mut mem = Arc::new(Memtable::new(Arc::clone(&opts.comparator), 0));

    // One recovery memtable's worth of entries becomes one guard-cut
    // batch of level-0 tables, same as a live flush.
    fn spill(
        mem: &Arc<Memtable>,
        dir: &Path,
        opts: &Arc<Options>,
        versions: &mut VersionSet,
        base_guards: &[Vec<Vec<u8>>],
        pending_guards: &mut Vec<(usize, Vec<u8>)>,
        edit: &mut VersionEdit,
    ) -> Result<()> {
        if mem.is_empty() {
            return Ok(());
        }
        let mut guard_keys = base_guards[NUM_LEVELS - 1].clone();
        let cmp = &opts.comparator;
        for (_, key) in pending_guards.iter() {
            if let Err(pos) = guard_keys.binary_search_by(|k| cmp.compare(k, key)) {
                guard_keys.insert(pos, key.clone());
            }
        }
        let (outputs, discovered) = flush::build_guarded_tables(
            mem,
            opts,
            &guard_keys,
            || {
                let number = versions.new_file_number();
                Ok((number, filename::table_file(dir, number)))
            },
            |level, key| {
                base_guards[level]
                    .binary_search_by(|k| opts.comparator.compare(k, key))
                    .is_ok()
            },
        )?;
        for (meta, filter) in outputs {
            edit.add_file_filter(meta.number, filter);
            edit.add_file(0, meta);
        }
        for (level, key) in discovered {
            if !pending_guards.iter().any(|(l, k)| *l == level && *k == key) {
                pending_guards.push((level, key));
            }
        }
        Ok(())
    }

    for number in &log_numbers {
        let path = filename::log_file(dir, *number);
        let reader = LogReader::open(&path)?;
        let mut records = 0usize;
        for record in reader {
            let record = match record {
                Ok(record) => record,
                Err(e @ Error::Corruption(_)) => {
                    if opts.paranoid_checks {
                        return Err(e);
                    }
                    tracing::warn!(log = number, error = %e, "dropping corrupt log tail");
                    break;
                }
                Err(e) => return Err(e),
            };
            let batch = WriteBatch::decode(&record)?;
            let seq = batch.sequence();
            let mut applier = RecoveryApplier {
                opts,
                mem: &mem,
                seq,
                guard_keys: &base.guard_keys,
                pending: &mut pending_guards,
            };
            batch.iterate(&mut applier)?;
            let last = seq + batch.count() as u64;
            if batch.count() > 0 && last.saturating_sub(1) > *max_seq {
                *max_seq = last - 1;
            }
            records += 1;

            if mem.approximate_size() >= opts.write_buffer_size {
                spill(
                    &mem,
                    dir,
                    opts,
                    versions,
                    &base.guard_keys,
                    &mut pending_guards,
                    edit,
                )?;
                mem = Arc::new(Memtable::new(Arc::clone(&opts.comparator), 0));
            }
        }
        tracing::info!(log = number, records, "replayed write-ahead log");
    }

    spill(
        &mem,
        dir,
        opts,
        versions,
        &base.guard_keys,
        &mut pending_guards,
        edit,
    )?;
    for (level, key) in pending_guards {
        edit.add_guard(level, key);
    }
    Ok(())
}

struct RecoveryApplier<'a> {
    opts: &'a Options,
    mem: &'a Arc<Memtable>,
    seq: SeqNo,
    guard_keys: &'a [Vec<Vec<u8>>],
    pending: &'a mut Vec<(usize, Vec<u8>)>,
}

impl RecoveryApplier<'_> {
    fn observe(&mut self, key: &[u8]) {
        if let Some(level) = guard_level(key, self.opts) {
            let known = self.guard_keys[level]
                .binary_search_by(|k| self.opts.comparator.compare(k, key))
                .is_ok()
                || self
                    .pending
                    .iter()
                    .any(|(l, k)| *l == level && k.as_slice() == key);
            if !known {
                self.pending.push((level, key.to_vec()));
            }
        }
    }
}

impl BatchVisitor for RecoveryApplier<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.observe(key);
        self.mem.add(self.seq, ValueKind::Value, key, value);
        self.seq += 1;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.observe(key);
        self.mem.add(self.seq, ValueKind::Deletion, key, b"");
        self.seq += 1;
        Ok(())
    }

    fn guard(&mut self, level: usize, key: &[u8]) -> Result<()> {
        if !self
            .pending
            .iter()
            .any(|(l, k)| *l == level && k.as_slice() == key)
        {
            self.pending.push((level, key.to_vec()));
        }
        Ok(())
    }
}

fn flusher_loop(db: Arc<DbInner>) {
    loop {
        let imm = {
            let mut st = db.mem_state.lock().unwrap();
            loop {
                if st.bg_error.is_some() {
                    return;
                }
                if let Some(imm) = st.imm.clone() {
                    break imm;
                }
                if db.is_shutting_down() {
                    return;
                }
                st = db.bg_memtable_cv.wait(st).unwrap();
            }
        };
        match flush::flush_memtable(&db, imm) {
            Ok(()) => {
                {
                    let mut st = db.mem_state.lock().unwrap();
                    st.imm = None;
                    st.prev_log_number = 0;
                    db.bg_fg_cv.notify_all();
                    db.bg_compaction_cv.notify_all();
                }
                db.delete_obsolete_files();
            }
            Err(e) => {
                db.record_bg_error(&e);
                return;
            }
        }
    }
}

fn compactor_loop(db: Arc<DbInner>) {
    enum Work {
        Manual(Arc<ManualCompaction>),
        Auto,
    }

    loop {
        let work = {
            let mut st = db.mem_state.lock().unwrap();
            loop {
                if st.bg_error.is_some() {
                    return;
                }
                if let Some(manual) = st.manual.clone() {
                    break Work::Manual(manual);
                }
                if db.is_shutting_down() {
                    return;
                }
                let version = db.current.read().unwrap().clone();
                if version.pick_compaction_level(&db.opts).is_some() {
                    break Work::Auto;
                }
                st = db.bg_compaction_cv.wait(st).unwrap();
            }
        };

        match work {
            Work::Manual(manual) => {
                let smallest = db.smallest_snapshot();
                let version = db.current.read().unwrap().clone();
                let job = compaction::pick_manual(
                    &version,
                    manual.level,
                    manual.begin.as_deref(),
                    manual.end.as_deref(),
                    smallest,
                );
                let result = match job {
                    Some(job) => compaction::run(&db, &job),
                    None => Ok(()),
                };
                {
                    let mut st = db.mem_state.lock().unwrap();
                    st.manual = None;
                    *manual.result.lock().unwrap() = Some(result.clone());
                    manual.done.store(true, AtomicOrdering::Release);
                    db.bg_fg_cv.notify_all();
                }
                match result {
                    Ok(()) => db.delete_obsolete_files(),
                    Err(e) => {
                        db.record_bg_error(&e);
                        return;
                    }
                }
            }
            Work::Auto => {
                let smallest = db.smallest_snapshot();
                let version = db.current.read().unwrap().clone();
                let Some(job) = compaction::pick_compaction(&version, &db.opts, smallest) else {
                    continue;
                };
                match compaction::run(&db, &job) {
                    Ok(()) => {
                        {
                            let _st = db.mem_state.lock().unwrap();
                            db.bg_fg_cv.notify_all();
                        }
                        db.delete_obsolete_files();
                    }
                    Err(e) => {
                        db.record_bg_error(&e);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Comparator;
    use crate::tmpfs::TempDir;

    fn open_default(dir: &TempDir) -> Database {
        Database::open(Options::default(), dir.path()).expect("open")
    }

    fn wopts() -> WriteOptions {
        WriteOptions::new()
    }

    fn ropts() -> ReadOptions {
        ReadOptions::new()
    }

    fn get_str(db: &Database, key: &[u8]) -> Option<String> {
        db.get(&ropts(), key)
            .expect("get")
            .map(|v| String::from_utf8_lossy(&v).into_owned())
    }

    fn level_property(db: &Database, prefix: &str, level: usize) -> usize {
        db.get_property(&format!("{prefix}{level}"))
            .expect("property")
            .parse()
            .expect("numeric property")
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        db.put(&wopts(), b"k", b"v").unwrap();
        assert_eq!(get_str(&db, b"k"), Some("v".to_string()));

        db.put(&wopts(), b"k", b"v2").unwrap();
        assert_eq!(get_str(&db, b"k"), Some("v2".to_string()));

        db.delete(&wopts(), b"k").unwrap();
        assert_eq!(get_str(&db, b"k"), None);
    }

    #[test]
    fn test_write_batch_is_atomic() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        db.put(&wopts(), b"old", b"1").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"old");
        db.write(&wopts(), batch).unwrap();

        assert_eq!(get_str(&db, b"a"), Some("1".to_string()));
        assert_eq!(get_str(&db, b"b"), Some("2".to_string()));
        assert_eq!(get_str(&db, b"old"), None);
    }

    #[test]
    fn test_sync_write() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);
        db.put(&WriteOptions::new().sync(true), b"durable", b"yes")
            .unwrap();
        assert_eq!(get_str(&db, b"durable"), Some("yes".to_string()));
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        db.put(&wopts(), b"foo", b"v1").unwrap();
        let s1 = db.get_snapshot();
        db.put(&wopts(), b"foo", b"v2").unwrap();

        assert_eq!(get_str(&db, b"foo"), Some("v2".to_string()));
        let snap_read = ReadOptions::new().snapshot(Arc::clone(&s1));
        assert_eq!(
            db.get(&snap_read, b"foo").unwrap(),
            Some(b"v1".to_vec())
        );

        // The snapshot keeps its view across flush and compaction.
        db.force_flush().unwrap();
        db.force_compact().unwrap();
        assert_eq!(
            db.get(&snap_read, b"foo").unwrap(),
            Some(b"v1".to_vec())
        );

        db.release_snapshot(s1);
        assert_eq!(get_str(&db, b"foo"), Some("v2".to_string()));
    }

    #[test]
    fn test_reopen_recovers_wal_contents() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_default(&dir);
            for i in 0..500 {
                let key = format!("key_{i:04}");
                let value = format!("value_{i}");
                db.put(&wopts(), key.as_bytes(), value.as_bytes()).unwrap();
            }
        }
        let db = open_default(&dir);
        for i in 0..500 {
            let key = format!("key_{i:04}");
            assert_eq!(get_str(&db, key.as_bytes()), Some(format!("value_{i}")));
        }
    }

    #[test]
    fn test_reopen_random_records() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let dir = TempDir::new().unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut expected = std::collections::BTreeMap::new();
        {
            let db = open_default(&dir);
            for _ in 0..400 {
                let key: u32 = rng.gen_range(0..10_000);
                let value: u64 = rng.gen();
                let key = format!("r{key:06}");
                let value = format!("{value:x}");
                db.put(&wopts(), key.as_bytes(), value.as_bytes()).unwrap();
                expected.insert(key, value);
            }
        }
        let db = open_default(&dir);
        for (key, value) in &expected {
            assert_eq!(get_str(&db, key.as_bytes()), Some(value.clone()));
        }
    }

    #[test]
    fn test_visible_mapping_survives_flush_and_compaction() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        for i in 0..200 {
            db.put(
                &wopts(),
                format!("k{i:03}").as_bytes(),
                format!("v{i}").as_bytes(),
            )
            .unwrap();
        }
        db.delete(&wopts(), b"k050").unwrap();
        db.force_flush().unwrap();
        db.force_compact().unwrap();

        assert_eq!(get_str(&db, b"k050"), None);
        for i in (0..200).filter(|&i| i != 50) {
            assert_eq!(
                get_str(&db, format!("k{i:03}").as_bytes()),
                Some(format!("v{i}"))
            );
        }
    }

    #[test]
    fn test_deletion_markers_collapse_after_compaction() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        db.put(&wopts(), b"foo", b"v1").unwrap();
        db.force_flush().unwrap();
        db.put(&wopts(), b"a", b"begin").unwrap();
        db.put(&wopts(), b"z", b"end").unwrap();
        db.force_flush().unwrap();
        db.delete(&wopts(), b"foo").unwrap();
        db.put(&wopts(), b"foo", b"v2").unwrap();
        db.force_flush().unwrap();

        db.compact_range(None, None).unwrap();

        assert_eq!(get_str(&db, b"foo"), Some("v2".to_string()));
        assert_eq!(get_str(&db, b"a"), Some("begin".to_string()));
        assert_eq!(get_str(&db, b"z"), Some("end".to_string()));
        assert_eq!(level_property(&db, "num-files-at-level", 0), 0);
    }

    #[test]
    fn test_level0_files_probed_newest_first() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        db.put(&wopts(), b"300", b"v300").unwrap();
        db.put(&wopts(), b"500", b"v500").unwrap();
        db.force_flush().unwrap();

        db.put(&wopts(), b"200", b"v200").unwrap();
        db.put(&wopts(), b"600", b"v600").unwrap();
        db.put(&wopts(), b"900", b"v900").unwrap();
        db.force_flush().unwrap();

        for (key, value) in [
            (b"200".as_slice(), "v200"),
            (b"300", "v300"),
            (b"500", "v500"),
            (b"600", "v600"),
            (b"900", "v900"),
        ] {
            assert_eq!(get_str(&db, key), Some(value.to_string()));
        }

        db.delete(&wopts(), b"600").unwrap();
        db.force_flush().unwrap();
        assert_eq!(get_str(&db, b"600"), None);
        assert_eq!(get_str(&db, b"900"), Some("v900".to_string()));
    }

    // Counted against one version so a concurrent compaction cannot
    // skew the tally between property reads.
    fn count_partition_files(db: &Database) -> (usize, usize, usize) {
        let version = db.inner.current.read().unwrap().clone();
        let mut total = 0;
        let mut guard_files = 0;
        let mut sentinel_files = 0;
        for level in 0..NUM_LEVELS {
            total += version.num_files(level);
            guard_files += version.guards[level]
                .iter()
                .map(|g| g.files.len())
                .sum::<usize>();
            sentinel_files += version.sentinels[level].len();
        }
        (total, guard_files, sentinel_files)
    }

    fn total_guards(db: &Database) -> usize {
        let version = db.inner.current.read().unwrap().clone();
        (0..NUM_LEVELS)
            .map(|level| version.guard_keys[level].len())
            .sum()
    }

    #[test]
    fn test_guard_partitioning_covers_all_files() {
        let dir = TempDir::new().unwrap();
        let opts = Options::default().guard_top_level_bits(10);
        let n = 5000;
        {
            let db = Database::open(opts.clone(), dir.path()).unwrap();
            db.put(&wopts(), b"A", b"va").unwrap();
            for i in 0..n {
                let key = format!("B{i:010}");
                db.put(&wopts(), key.as_bytes(), b"x").unwrap();
            }
            db.put(&wopts(), b"C", b"vc").unwrap();
            db.force_flush().unwrap();

            let (total, guard_files, sentinel_files) = count_partition_files(&db);
            assert!(total > 1, "expected the flush to cut multiple files");
            assert_eq!(total, guard_files + sentinel_files);
        }

        let db = Database::open(opts, dir.path()).unwrap();
        let (total, guard_files, sentinel_files) = count_partition_files(&db);
        assert_eq!(total, guard_files + sentinel_files);

        // Every key is retrievable and iteration is globally ordered.
        assert_eq!(get_str(&db, b"A"), Some("va".to_string()));
        assert_eq!(get_str(&db, b"C"), Some("vc".to_string()));
        for i in (0..n).step_by(97) {
            let key = format!("B{i:010}");
            assert_eq!(get_str(&db, key.as_bytes()), Some("x".to_string()));
        }

        let mut iter = db.new_iterator(&ropts()).unwrap();
        iter.seek_to_first().unwrap();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"A");
        let mut count = 0;
        let mut last = Vec::new();
        while iter.valid() {
            assert!(iter.key() > last.as_slice() || count == 0);
            last = iter.key().to_vec();
            count += 1;
            iter.next().unwrap();
        }
        assert_eq!(last, b"C");
        assert_eq!(count, n + 2);
    }

    #[test]
    fn test_guard_set_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let opts = Options::default().guard_top_level_bits(10);
        let before = {
            let db = Database::open(opts.clone(), dir.path()).unwrap();
            for i in 0..3000 {
                let key = format!("G{i:08}");
                db.put(&wopts(), key.as_bytes(), b"payload").unwrap();
            }
            db.force_flush().unwrap();
            let guards = total_guards(&db);
            assert!(guards > 0, "expected guards among 3000 hashed keys");
            guards
        };

        let db = Database::open(opts, dir.path()).unwrap();
        assert_eq!(total_guards(&db), before);
    }

    #[test]
    fn test_compact_range_moves_level0_down() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        for i in 0..100 {
            db.put(
                &wopts(),
                format!("m{i:04}").as_bytes(),
                format!("v{i}").as_bytes(),
            )
            .unwrap();
        }
        db.force_flush().unwrap();
        assert!(level_property(&db, "num-files-at-level", 0) >= 1);

        db.compact_range(None, None).unwrap();
        assert_eq!(level_property(&db, "num-files-at-level", 0), 0);
        let deeper: usize = (1..NUM_LEVELS)
            .map(|l| level_property(&db, "num-files-at-level", l))
            .sum();
        assert!(deeper >= 1);
        assert_eq!(get_str(&db, b"m0042"), Some("v42".to_string()));
    }

    #[test]
    fn test_memtable_rotation_keeps_triggering_write() {
        let dir = TempDir::new().unwrap();
        let opts = Options::default().write_buffer_size(4096);
        let db = Database::open(opts, dir.path()).unwrap();

        for i in 0..1000 {
            let key = format!("rot{i:05}");
            let value = format!("value-{i:05}-padding-padding");
            db.put(&wopts(), key.as_bytes(), value.as_bytes()).unwrap();
        }
        for i in (0..1000).step_by(53) {
            let key = format!("rot{i:05}");
            assert_eq!(
                get_str(&db, key.as_bytes()),
                Some(format!("value-{i:05}-padding-padding"))
            );
        }
    }

    #[test]
    fn test_concurrent_writers_all_visible() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        std::thread::scope(|scope| {
            for t in 0..8 {
                let db = &db;
                scope.spawn(move || {
                    for i in 0..100 {
                        let key = format!("t{t}-{i:03}");
                        let value = format!("{t}:{i}");
                        db.put(&wopts(), key.as_bytes(), value.as_bytes()).unwrap();
                    }
                });
            }
        });

        for t in 0..8 {
            for i in 0..100 {
                let key = format!("t{t}-{i:03}");
                assert_eq!(get_str(&db, key.as_bytes()), Some(format!("{t}:{i}")));
            }
        }
    }

    #[test]
    fn test_iterator_spans_memtable_and_tables() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        db.put(&wopts(), b"b", b"2").unwrap();
        db.put(&wopts(), b"d", b"4").unwrap();
        db.force_flush().unwrap();
        db.put(&wopts(), b"a", b"1").unwrap();
        db.put(&wopts(), b"c", b"3").unwrap();
        db.delete(&wopts(), b"d").unwrap();

        let mut iter = db.new_iterator(&ropts()).unwrap();
        iter.seek_to_first().unwrap();
        let mut forward = Vec::new();
        while iter.valid() {
            forward.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next().unwrap();
        }
        assert_eq!(
            forward,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );

        iter.seek_to_last().unwrap();
        assert_eq!(iter.key(), b"c");
        iter.prev().unwrap();
        assert_eq!(iter.key(), b"b");
        iter.next().unwrap();
        assert_eq!(iter.key(), b"c");
    }

    #[test]
    fn test_open_locked_directory_fails() {
        let dir = TempDir::new().unwrap();
        let _db = open_default(&dir);
        match Database::open(Options::default(), dir.path()) {
            Err(Error::Io(_)) => {}
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn test_open_with_mismatched_comparator() {
        struct ReverseComparator;
        impl Comparator for ReverseComparator {
            fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
                b.cmp(a)
            }
            fn name(&self) -> &str {
                "test.ReverseComparator"
            }
        }

        let dir = TempDir::new().unwrap();
        {
            let db = open_default(&dir);
            db.put(&wopts(), b"k", b"v").unwrap();
        }
        let opts = Options::default().comparator(Arc::new(ReverseComparator));
        match Database::open(opts, dir.path()) {
            Err(Error::InvalidArgument(msg)) => assert!(msg.contains("comparator")),
            other => panic!("expected invalid argument, got {other:?}"),
        }
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let opts = Options::default().create_if_missing(false);
        assert!(matches!(
            Database::open(opts, dir.path().join("absent")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_open_error_if_exists() {
        let dir = TempDir::new().unwrap();
        {
            let _db = open_default(&dir);
        }
        let opts = Options::default().error_if_exists(true);
        assert!(matches!(
            Database::open(opts, dir.path()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_destroy_removes_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("victim");
        {
            let db = Database::open(Options::default(), &path).unwrap();
            db.put(&wopts(), b"k", b"v").unwrap();
        }
        Database::destroy(&path, &Options::default()).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_replay_iterator_yields_newest_value() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        let ts = db.get_replay_timestamp();
        assert!(db.validate_timestamp(&ts));

        for i in 0..10 {
            db.put(&wopts(), b"key", format!("v{i}").as_bytes()).unwrap();
        }

        let mut iter = db.get_replay_iterator(&ts).unwrap();
        let mut values = Vec::new();
        while iter.valid() {
            assert_eq!(iter.key(), b"key");
            assert!(iter.has_value());
            values.push(String::from_utf8_lossy(iter.value()).into_owned());
            iter.next();
        }
        assert!(values.contains(&"v9".to_string()));
        db.release_replay_iterator(iter);

        db.delete(&wopts(), b"key").unwrap();
        let mut iter = db.get_replay_iterator(&ts).unwrap();
        let mut saw_deletion = false;
        while iter.valid() {
            if !iter.has_value() {
                assert_eq!(iter.key(), b"key");
                saw_deletion = true;
            }
            iter.next();
        }
        assert!(saw_deletion, "deletion must surface as a valueless record");
        db.release_replay_iterator(iter);
    }

    #[test]
    fn test_replay_timestamps_compare_by_commit_order() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        let older = db.get_replay_timestamp();
        db.put(&wopts(), b"k", b"v").unwrap();
        let newer = db.get_replay_timestamp();

        assert_eq!(
            db.compare_timestamps(&older, &newer).unwrap(),
            std::cmp::Ordering::Less
        );
        assert!(!db.validate_timestamp(b"garbage"));
        assert!(db.compare_timestamps(b"garbage", &newer).is_err());
    }

    #[test]
    fn test_live_backup_is_openable() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("main");
        let db = Database::open(Options::default(), &db_path).unwrap();

        for i in 0..50 {
            db.put(
                &wopts(),
                format!("b{i:03}").as_bytes(),
                format!("v{i}").as_bytes(),
            )
            .unwrap();
        }
        db.force_flush().unwrap();
        db.put(&wopts(), b"unflushed", b"still-here").unwrap();

        db.live_backup("snap").unwrap();
        drop(db);

        let backup_path = dir.path().join("main-backup-snap");
        assert!(backup_path.exists());
        let backup = Database::open(Options::default(), &backup_path).unwrap();
        for i in 0..50 {
            assert_eq!(
                get_str(&backup, format!("b{i:03}").as_bytes()),
                Some(format!("v{i}"))
            );
        }
        assert_eq!(get_str(&backup, b"unflushed"), Some("still-here".to_string()));
    }

    #[test]
    fn test_approximate_sizes() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);

        for i in 0..200 {
            let value = vec![b'x'; 256];
            db.put(&wopts(), format!("s{i:04}").as_bytes(), &value).unwrap();
        }
        db.force_flush().unwrap();

        let sizes = db.get_approximate_sizes(&[
            (None, None),
            (Some(b"s0000"), Some(b"s9999")),
            (Some(b"zzz"), None),
        ]);
        assert!(sizes[0] > 0);
        assert!(sizes[1] > 0);
        assert_eq!(sizes[2], 0);
    }

    #[test]
    fn test_properties_exist() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);
        db.put(&wopts(), b"p", b"v").unwrap();
        db.force_flush().unwrap();

        assert!(level_property(&db, "num-files-at-level", 0) >= 1);
        assert!(db.get_property("sstables").is_some());
        assert!(db.get_property("current-version-state").is_some());
        assert!(db.get_property("guard-details-at-level1").is_some());
        assert!(db.get_property("sentinel-details-at-level0").is_some());
        assert!(db.get_property("unknown-property").is_none());
    }

    #[test]
    fn test_empty_database_iterator() {
        let dir = TempDir::new().unwrap();
        let db = open_default(&dir);
        let mut iter = db.new_iterator(&ropts()).unwrap();
        iter.seek_to_first().unwrap();
        assert!(!iter.valid());
        iter.seek_to_last().unwrap();
        assert!(!iter.valid());
    }
}
