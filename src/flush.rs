//! Memtable flush.
//!
//! The flusher turns the immutable memtable into level-0 tables cut
//! along the complete guard set (every guard known on any level): keys
//! below the smallest guard form the sentinel file, keys in `[guard[i],
//! guard[i+1])` form one file per populated partition. Keys observed
//! during the sweep are also tested for guard eligibility, so freshly
//! qualified guards enter the manifest with the same edit that installs
//! the tables. Files from successive flushes may overlap inside one
//! partition; the next compaction of level 0 reconciles them.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Options;
use crate::db::DbInner;
use crate::error::Result;
use crate::guards::{guard_level, partition_of};
use crate::ikey;
use crate::iterator::InternalIterator;
use crate::memtable::{Memtable, MemtableIterator};
use crate::sstable::TableBuilder;
use crate::version::edit::VersionEdit;
use crate::version::FileMeta;

/// Writes `mem` out as one table per populated guard partition.
///
/// `alloc` provides file numbers and paths; `guard_known` reports
/// whether a key is already a guard at a level, so only new discoveries
/// are returned. The discovered guards are reported with the shallowest
/// level each key qualifies for.
pub(crate) fn build_guarded_tables(
    mem: &Arc<Memtable>,
    opts: &Options,
    guard_keys: &[Vec<u8>],
    mut alloc: impl FnMut() -> Result<(u64, PathBuf)>,
    guard_known: impl Fn(usize, &[u8]) -> bool,
) -> Result<(Vec<(FileMeta, Vec<u8>)>, Vec<(usize, Vec<u8>)>)> {
    let cmp = Arc::clone(&opts.comparator);
    let mut outputs: Vec<(FileMeta, Vec<u8>)> = Vec::new();
    let mut new_guards: Vec<(usize, Vec<u8>)> = Vec::new();
    let mut builder: Option<(u64, TableBuilder)> = None;
    let mut current_partition: Option<Option<usize>> = None;

    let mut finish_current = |builder: &mut Option<(u64, TableBuilder)>,
                              outputs: &mut Vec<(FileMeta, Vec<u8>)>|
     -> Result<()> {
        if let Some((number, b)) = builder.take() {
            let built = b.finish()?;
            outputs.push((
                FileMeta {
                    number,
                    file_size: built.file_size,
                    smallest: built.smallest,
                    largest: built.largest,
                },
                built.filter,
            ));
        }
        Ok(())
    };

    let mut iter = MemtableIterator::new(Arc::clone(mem));
    iter.seek_to_first()?;
    while iter.valid() {
        let key = iter.key().to_vec();
        let value = iter.value().to_vec();
        let (user, _, _) = ikey::split_internal_key(&key)?;

        if let Some(level) = guard_level(user, opts) {
            let known = guard_known(level, user)
                || new_guards
                    .iter()
                    .any(|(l, k)| *l == level && k.as_slice() == user);
            if !known {
                new_guards.push((level, user.to_vec()));
            }
        }

        let partition = partition_of(guard_keys, user, cmp.as_ref());
        if current_partition != Some(partition) {
            finish_current(&mut builder, &mut outputs)?;
            current_partition = Some(partition);
        }

        if builder.is_none() {
            let (number, path) = alloc()?;
            builder = Some((number, TableBuilder::create(path, opts)?));
        }
        builder.as_mut().expect("builder open").1.add(&key, &value)?;

        iter.next()?;
    }
    finish_current(&mut builder, &mut outputs)?;

    Ok((outputs, new_guards))
}

/// Flushes the immutable memtable into level 0 and installs the result.
pub(crate) fn flush_memtable(db: &Arc<DbInner>, mem: Arc<Memtable>) -> Result<()> {
    let (active_log_number, pending_guards) = {
        let mut st = db.mem_state.lock()?;
        (st.log_number, std::mem::take(&mut st.pending_guards))
    };
    let guard_keys = db.complete_guard_set();

    let mut numbers: Vec<u64> = Vec::new();
    let built = build_guarded_tables(
        &mem,
        &db.opts,
        &guard_keys,
        || {
            let (number, path) = db.new_table_file()?;
            numbers.push(number);
            Ok((number, path))
        },
        |level, key| db.guard_known(level, key),
    );

    let (outputs, discovered) = match built {
        Ok(result) => result,
        Err(e) => {
            for number in &numbers {
                let _ = std::fs::remove_file(crate::filename::table_file(&db.dir, *number));
            }
            db.forget_pending_outputs(&numbers);
            return Err(e);
        }
    };

    let mut edit = VersionEdit::new();
    edit.log_number = Some(active_log_number);
    for (meta, filter) in &outputs {
        edit.add_file(0, meta.clone());
        edit.add_file_filter(meta.number, filter.clone());
    }
    let mut guards = pending_guards;
    for (level, key) in discovered {
        if !guards.iter().any(|(l, k)| *l == level && *k == key) {
            guards.push((level, key));
        }
    }
    for (level, key) in &guards {
        edit.add_guard(*level, key.clone());
    }

    let table_count = outputs.len();
    let bytes_written: u64 = outputs.iter().map(|(m, _)| m.file_size).sum();
    db.apply_edit(&mut edit)?;
    db.forget_pending_outputs(&numbers);
    db.add_stats(0, 0, bytes_written);

    tracing::info!(
        tables = table_count,
        entries = mem.len(),
        bytes = bytes_written,
        new_guards = guards.len(),
        wal = mem.log_number(),
        "flushed memtable to level 0"
    );
    Ok(())
}
