//! Catalog persistence.
//!
//! The `VersionSet` owns the counters (next file number, last sequence,
//! WAL numbers), the current version pointer, and the manifest writer.
//! Applying an edit is a three-step dance: build the successor version in
//! memory, append the edit to the manifest and fsync, then swap the
//! current pointer. Recovery replays the manifest named by `CURRENT` from
//! its leading snapshot record forward.
//!
//! Every version ever installed is also tracked through a weak reference,
//! so the obsolete-file sweep can see files still pinned by long-lived
//! iterators of superseded versions.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crate::config::{Options, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::filename;
use crate::ikey::SeqNo;
use crate::version::edit::VersionEdit;
use crate::version::{Version, VersionBuilder};
use crate::wal::{LogReader, LogWriter};

pub struct VersionSet {
    dir: PathBuf,
    opts: Arc<Options>,

    next_file_number: u64,
    manifest_number: u64,
    last_sequence: SeqNo,
    /// WALs numbered below this are fully represented by table files.
    log_number: u64,
    prev_log_number: u64,

    current: Arc<Version>,
    pinned: Vec<Weak<Version>>,
    manifest: Option<LogWriter>,
    compaction_pointers: Vec<Vec<u8>>,
}

impl VersionSet {
    pub fn new(dir: PathBuf, opts: Arc<Options>) -> Self {
        let current = Arc::new(Version::empty(Arc::clone(&opts.comparator)));
        Self {
            dir,
            opts,
            next_file_number: 2,
            manifest_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            current: Arc::clone(&current),
            pinned: vec![Arc::downgrade(&current)],
            manifest: None,
            compaction_pointers: vec![Vec::new(); NUM_LEVELS],
        }
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn last_sequence(&self) -> SeqNo {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, seq: SeqNo) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    pub fn next_file_number(&self) -> u64 {
        self.next_file_number
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn compaction_pointer(&self, level: usize) -> &[u8] {
        &self.compaction_pointers[level]
    }

    /// Initializes a fresh database: an empty manifest holding only the
    /// comparator name, then `CURRENT`.
    pub fn create_new(&mut self) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some(self.opts.comparator.name().to_string());
        edit.log_number = Some(0);
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(0);

        let manifest_number = self.new_file_number();
        let path = filename::manifest_file(&self.dir, manifest_number);
        let mut manifest = LogWriter::create(&path, manifest_number)?;
        manifest.add_record(&edit.encode())?;
        manifest.sync()?;
        filename::set_current_file(&self.dir, manifest_number)?;

        self.manifest_number = manifest_number;
        self.manifest = Some(manifest);
        Ok(())
    }

    /// Rebuilds the catalog from `CURRENT` and its manifest. A fresh
    /// manifest is started so the old one can be dropped.
    pub fn recover(&mut self) -> Result<()> {
        let manifest_number = filename::read_current_file(&self.dir)?;
        let path = filename::manifest_file(&self.dir, manifest_number);
        let reader = LogReader::open(&path)
            .map_err(|e| Error::Corruption(format!("manifest unreadable: {e}")))?;

        let base = Version::empty(Arc::clone(&self.opts.comparator));
        let mut builder = VersionBuilder::new(&base);
        let mut next_file = None;
        let mut last_seq = None;
        let mut log_number = None;
        let mut prev_log_number = 0;

        for record in reader {
            let record = record?;
            let edit = VersionEdit::decode(&record)?;
            if let Some(name) = &edit.comparator_name {
                if name != self.opts.comparator.name() {
                    return Err(Error::InvalidArgument(format!(
                        "comparator: database uses {name}, options supply {}",
                        self.opts.comparator.name()
                    )));
                }
            }
            for (level, key) in &edit.compaction_pointers {
                self.compaction_pointers[*level] = key.clone();
            }
            if let Some(n) = edit.next_file_number {
                next_file = Some(n);
            }
            if let Some(n) = edit.last_sequence {
                last_seq = Some(n);
            }
            if let Some(n) = edit.log_number {
                log_number = Some(n);
            }
            if let Some(n) = edit.prev_log_number {
                prev_log_number = n;
            }
            builder.apply(&edit);
        }

        let next_file =
            next_file.ok_or_else(|| Error::corruption("manifest missing next file number"))?;
        let last_seq =
            last_seq.ok_or_else(|| Error::corruption("manifest missing last sequence"))?;
        let log_number =
            log_number.ok_or_else(|| Error::corruption("manifest missing log number"))?;

        let version = Arc::new(builder.finish());
        self.pinned.push(Arc::downgrade(&version));
        self.current = version;
        self.next_file_number = next_file;
        self.last_sequence = last_seq;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.mark_file_number_used(manifest_number);
        self.mark_file_number_used(log_number);

        tracing::info!(
            manifest = manifest_number,
            next_file,
            last_sequence = last_seq,
            log_number,
            "recovered catalog"
        );
        Ok(())
    }

    /// First half of an edit application, run under the catalog lock:
    /// fills in the edit's counters, builds the successor version, and
    /// hands out the manifest writer together with the records to append.
    ///
    /// At most one `PendingApply` may exist at a time; the db layer parks
    /// concurrent applicants on its manifest condition variable. The
    /// manifest IO itself happens outside the lock via
    /// [`write_pending`], and [`finish_apply`] installs the result.
    pub fn prepare_apply(&mut self, edit: &mut VersionEdit) -> Result<PendingApply> {
        if edit.log_number.is_none() {
            edit.log_number = Some(self.log_number);
        }

        let created_manifest = self.manifest.is_none();
        if created_manifest {
            let manifest_number = self.new_file_number();
            let path = filename::manifest_file(&self.dir, manifest_number);
            self.manifest = Some(LogWriter::create(&path, manifest_number)?);
            self.manifest_number = manifest_number;
        }

        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);

        let mut builder = VersionBuilder::new(&self.current);
        builder.apply(edit);
        let version = Arc::new(builder.finish());

        let mut records = Vec::new();
        if created_manifest {
            records.push(self.snapshot_edit().encode());
        }
        records.push(edit.encode());

        Ok(PendingApply {
            version,
            records,
            created_manifest,
            manifest_number: self.manifest_number,
            manifest: self.manifest.take().expect("manifest open"),
        })
    }

    /// Installs a successfully written edit and returns the manifest
    /// writer. Must run under the catalog lock.
    pub fn finish_apply(&mut self, pending: PendingApply, edit: &VersionEdit) -> Arc<Version> {
        self.manifest = Some(pending.manifest);
        for (level, key) in &edit.compaction_pointers {
            self.compaction_pointers[*level] = key.clone();
        }
        if let Some(n) = edit.log_number {
            self.log_number = n;
        }
        if let Some(n) = edit.prev_log_number {
            self.prev_log_number = n;
        }
        self.pinned.push(Arc::downgrade(&pending.version));
        self.current = Arc::clone(&pending.version);
        pending.version
    }

    /// Returns the manifest writer after a failed write. The catalog is
    /// left unchanged; the caller latches the background error.
    pub fn abort_apply(&mut self, pending: PendingApply) {
        self.manifest = Some(pending.manifest);
    }

    /// Applies `edit` in one step. Convenience for recovery and tests;
    /// the running database goes through the prepare/write/finish split
    /// so manifest IO happens outside the catalog lock.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<Arc<Version>> {
        let mut pending = self.prepare_apply(edit)?;
        match write_pending(&self.dir, &mut pending) {
            Ok(()) => Ok(self.finish_apply(pending, edit)),
            Err(e) => {
                self.abort_apply(pending);
                Err(e)
            }
        }
    }

    /// One edit carrying the entire current state; written first into
    /// each new manifest so replay never needs the previous one.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some(self.opts.comparator.name().to_string());
        for (level, key) in self.compaction_pointers.iter().enumerate() {
            if !key.is_empty() {
                edit.compaction_pointers.push((level, key.clone()));
            }
        }
        for level in 0..NUM_LEVELS {
            for key in &self.current.guard_keys[level] {
                edit.add_guard(level, key.clone());
            }
            for file in &self.current.files[level] {
                edit.add_file(level, (**file).clone());
                if let Some(filter) = self.current.filters.get(&file.number) {
                    edit.add_file_filter(file.number, (**filter).clone());
                }
            }
        }
        edit
    }

    /// Table files referenced by the current version or by any superseded
    /// version still pinned by a reader.
    pub fn live_files(&mut self) -> HashSet<u64> {
        let mut live = HashSet::new();
        self.pinned.retain(|weak| {
            let Some(version) = weak.upgrade() else {
                return false;
            };
            for level in 0..NUM_LEVELS {
                for file in &version.files[level] {
                    live.insert(file.number);
                }
            }
            true
        });
        live
    }

    pub fn manifest_number(&self) -> u64 {
        self.manifest_number
    }
}

/// An edit whose manifest records have been prepared but not yet written.
pub struct PendingApply {
    version: Arc<Version>,
    records: Vec<Vec<u8>>,
    created_manifest: bool,
    manifest_number: u64,
    manifest: LogWriter,
}

/// Appends and fsyncs the pending records, pointing `CURRENT` at a newly
/// created manifest. Safe to run without the catalog lock: the pending
/// apply owns the manifest writer.
pub fn write_pending(dir: &std::path::Path, pending: &mut PendingApply) -> Result<()> {
    for record in &pending.records {
        pending.manifest.add_record(record)?;
    }
    pending.manifest.sync()?;
    if pending.created_manifest {
        filename::set_current_file(dir, pending.manifest_number)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Comparator;
    use crate::ikey::{make_internal_key, ValueKind};
    use crate::tmpfs::TempDir;
    use crate::version::FileMeta;

    fn meta(number: u64, smallest: &[u8], largest: &[u8]) -> FileMeta {
        FileMeta {
            number,
            file_size: 512,
            smallest: make_internal_key(smallest, 2, ValueKind::Value),
            largest: make_internal_key(largest, 1, ValueKind::Value),
        }
    }

    fn open_set(dir: &TempDir, opts: Arc<Options>) -> VersionSet {
        VersionSet::new(dir.path().to_path_buf(), opts)
    }

    #[test]
    fn test_create_and_recover_empty() {
        let dir = TempDir::new().unwrap();
        let opts = Arc::new(Options::default());

        {
            let mut set = open_set(&dir, Arc::clone(&opts));
            set.create_new().unwrap();
        }

        let mut set = open_set(&dir, opts);
        set.recover().unwrap();
        assert_eq!(set.last_sequence(), 0);
        assert_eq!(set.current().num_files(0), 0);
    }

    #[test]
    fn test_log_and_apply_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let opts = Arc::new(Options::default());

        {
            let mut set = open_set(&dir, Arc::clone(&opts));
            set.create_new().unwrap();

            let mut edit = VersionEdit::new();
            edit.add_file(0, meta(5, b"a", b"m"));
            edit.add_guard(1, b"g".to_vec());
            edit.add_file_filter(5, vec![1, 2, 3]);
            set.set_last_sequence(44);
            set.mark_file_number_used(5);
            set.log_and_apply(&mut edit).unwrap();
        }

        let mut set = open_set(&dir, opts);
        set.recover().unwrap();
        let current = set.current();
        assert_eq!(current.num_files(0), 1);
        assert_eq!(current.files[0][0].number, 5);
        assert_eq!(current.guard_keys[1], vec![b"g".to_vec()]);
        assert_eq!(current.filters[&5].as_slice(), &[1, 2, 3]);
        assert_eq!(set.last_sequence(), 44);
        assert!(set.next_file_number() > 5);
    }

    #[test]
    fn test_comparator_mismatch() {
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
            let mut set = open_set(&dir, Arc::new(Options::default()));
            set.create_new().unwrap();
        }

        let opts = Arc::new(Options::default().comparator(Arc::new(ReverseComparator)));
        let mut set = open_set(&dir, opts);
        match set.recover() {
            Err(Error::InvalidArgument(msg)) => assert!(msg.contains("comparator")),
            other => panic!("expected invalid argument, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_current_is_corruption() {
        let dir = TempDir::new().unwrap();
        let mut set = open_set(&dir, Arc::new(Options::default()));
        assert!(matches!(set.recover(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_live_files_include_pinned_versions() {
        let dir = TempDir::new().unwrap();
        let mut set = open_set(&dir, Arc::new(Options::default()));
        set.create_new().unwrap();

        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(9, b"a", b"z"));
        set.mark_file_number_used(9);
        set.log_and_apply(&mut edit).unwrap();

        // A reader pins the version holding file 9.
        let pinned = set.current();

        let mut edit = VersionEdit::new();
        edit.delete_file(1, 9);
        edit.add_file(1, meta(10, b"a", b"z"));
        set.mark_file_number_used(10);
        set.log_and_apply(&mut edit).unwrap();

        let live = set.live_files();
        assert!(live.contains(&9), "pinned version keeps file 9 live");
        assert!(live.contains(&10));

        drop(pinned);
        let live = set.live_files();
        assert!(!live.contains(&9));
        assert!(live.contains(&10));
    }

    #[test]
    fn test_file_numbers_monotone() {
        let dir = TempDir::new().unwrap();
        let mut set = open_set(&dir, Arc::new(Options::default()));
        set.create_new().unwrap();
        let a = set.new_file_number();
        let b = set.new_file_number();
        assert!(b > a);
        set.mark_file_number_used(100);
        assert!(set.new_file_number() > 100);
    }
}
