//! Background compaction.
//!
//! The planner picks the level with the highest score (level 0: file
//! count over the trigger; deeper levels: bytes over budget), then a
//! partition of that level — the guard or sentinel holding the most
//! bytes — and gathers the overlapping files of the next level. The
//! executor merge-sorts the inputs and rewrites them as tables on the
//! target level, cut along the target level's guard set; an output also
//! rolls when it reaches the file-size cap or overlaps too much of the
//! grandparent level.
//!
//! Records are dropped when a newer record of the same user key is
//! already visible at or below the oldest live snapshot, and a deletion
//! marker is dropped once it is the oldest record of its key and no
//! deeper level can contain that key.

use std::sync::Arc;

use crate::config::{Options, NUM_LEVELS};
use crate::db::DbInner;
use crate::error::{Error, Result};
use crate::guards::{guard_level, partition_of};
use crate::ikey::{self, SeqNo, ValueKind};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::sstable::TableBuilder;
use crate::version::edit::VersionEdit;
use crate::version::{FileMeta, Version};

/// How much grandparent data one output may overlap before rolling.
fn max_grandparent_overlap(opts: &Options) -> u64 {
    10 * opts.max_file_size
}

/// A planned compaction: inputs fixed against one version.
pub(crate) struct CompactionJob {
    pub version: Arc<Version>,
    pub level: usize,
    pub out_level: usize,
    /// Files from `level`.
    pub inputs: Vec<Arc<FileMeta>>,
    /// Overlapping files already on `out_level`.
    pub next_inputs: Vec<Arc<FileMeta>>,
    /// Files on `out_level + 1`, for the overlap roll condition.
    pub grandparents: Vec<Arc<FileMeta>>,
    /// Records at or below this sequence may be collapsed.
    pub smallest_snapshot: SeqNo,
}

fn user_range(files: &[Arc<FileMeta>], version: &Version) -> Option<(Vec<u8>, Vec<u8>)> {
    let cmp = version.comparator().as_ref();
    let mut smallest: Option<&[u8]> = None;
    let mut largest: Option<&[u8]> = None;
    for f in files {
        if smallest.map_or(true, |s| cmp.compare(f.smallest_user(), s) == std::cmp::Ordering::Less)
        {
            smallest = Some(f.smallest_user());
        }
        if largest.map_or(true, |l| cmp.compare(f.largest_user(), l) == std::cmp::Ordering::Greater)
        {
            largest = Some(f.largest_user());
        }
    }
    Some((smallest?.to_vec(), largest?.to_vec()))
}

fn finish_job(
    version: &Arc<Version>,
    level: usize,
    mut inputs: Vec<Arc<FileMeta>>,
    smallest_snapshot: SeqNo,
) -> Option<CompactionJob> {
    if inputs.is_empty() {
        return None;
    }
    if level == 0 {
        // Level-0 files overlap freely; every file overlapping the input
        // range must come along, or an older version left behind would
        // shadow the newer one pushed down to level 1.
        loop {
            let (begin, end) = user_range(&inputs, version)?;
            let expanded = version.overlapping_files(0, Some(&begin), Some(&end));
            if expanded.len() == inputs.len() {
                break;
            }
            inputs = expanded;
        }
    }
    let out_level = level + 1;
    let (begin, end) = user_range(&inputs, version)?;
    let next_inputs = version.overlapping_files(out_level, Some(&begin), Some(&end));
    let grandparents = if out_level + 1 < NUM_LEVELS {
        version.overlapping_files(out_level + 1, Some(&begin), Some(&end))
    } else {
        Vec::new()
    };
    Some(CompactionJob {
        version: Arc::clone(version),
        level,
        out_level,
        inputs,
        next_inputs,
        grandparents,
        smallest_snapshot,
    })
}

/// Size-triggered compaction: the highest-scoring level, one partition at
/// a time. Level 0 compacts as a whole since its files overlap freely.
pub(crate) fn pick_compaction(
    version: &Arc<Version>,
    opts: &Options,
    smallest_snapshot: SeqNo,
) -> Option<CompactionJob> {
    let level = version.pick_compaction_level(opts)?;

    let inputs = if level == 0 {
        version.files[0].clone()
    } else {
        // The fattest partition of the level.
        let mut best: Option<(u64, Vec<Arc<FileMeta>>)> = None;
        let sentinel_bytes: u64 = version.sentinels[level].iter().map(|f| f.file_size).sum();
        if !version.sentinels[level].is_empty() {
            best = Some((sentinel_bytes, version.sentinels[level].clone()));
        }
        for guard in &version.guards[level] {
            let bytes = guard.total_bytes();
            if !guard.files.is_empty() && best.as_ref().map_or(true, |(b, _)| bytes > *b) {
                best = Some((bytes, guard.files.clone()));
            }
        }
        best.map(|(_, files)| files)?
    };

    finish_job(version, level, inputs, smallest_snapshot)
}

/// Range-restricted compaction of one level, for `compact_range`.
pub(crate) fn pick_manual(
    version: &Arc<Version>,
    level: usize,
    begin: Option<&[u8]>,
    end: Option<&[u8]>,
    smallest_snapshot: SeqNo,
) -> Option<CompactionJob> {
    if level + 1 >= NUM_LEVELS {
        return None;
    }
    let inputs = version.overlapping_files(level, begin, end);
    finish_job(version, level, inputs, smallest_snapshot)
}

struct OutputState {
    builder: Option<(u64, TableBuilder)>,
    outputs: Vec<(FileMeta, Vec<u8>)>,
    numbers: Vec<u64>,
    partition: Option<Option<usize>>,
    overlap_bytes: u64,
}

impl OutputState {
    fn roll(&mut self) -> Result<()> {
        if let Some((number, builder)) = self.builder.take() {
            let built = builder.finish()?;
            self.outputs.push((
                FileMeta {
                    number,
                    file_size: built.file_size,
                    smallest: built.smallest,
                    largest: built.largest,
                },
                built.filter,
            ));
        }
        self.overlap_bytes = 0;
        Ok(())
    }
}

/// Merges the job's inputs into new tables on the target level and
/// installs the swap atomically. On failure every produced output is
/// removed and the inputs stay current.
pub(crate) fn run(db: &Arc<DbInner>, job: &CompactionJob) -> Result<()> {
    let mut state = OutputState {
        builder: None,
        outputs: Vec::new(),
        numbers: Vec::new(),
        partition: None,
        overlap_bytes: 0,
    };
    let mut new_guards: Vec<(usize, Vec<u8>)> = Vec::new();

    let result = do_compaction_work(db, job, &mut state, &mut new_guards);

    if let Err(e) = result {
        if let Some((_, builder)) = state.builder.take() {
            let _ = builder.abandon();
        }
        for number in &state.numbers {
            let _ = std::fs::remove_file(crate::filename::table_file(&db.dir, *number));
        }
        db.forget_pending_outputs(&state.numbers);
        return Err(e);
    }

    let mut edit = VersionEdit::new();
    for f in &job.inputs {
        edit.delete_file(job.level, f.number);
    }
    for f in &job.next_inputs {
        edit.delete_file(job.out_level, f.number);
    }
    for (meta, filter) in &state.outputs {
        edit.add_file(job.out_level, meta.clone());
        edit.add_file_filter(meta.number, filter.clone());
    }
    for (level, key) in &new_guards {
        edit.add_guard(*level, key.clone());
    }
    if let Some(largest) = job.inputs.iter().map(|f| &f.largest).max_by(|a, b| {
        ikey::compare_internal(job.version.comparator().as_ref(), a, b)
    }) {
        edit.compaction_pointers.push((job.level, largest.clone()));
    }

    db.apply_edit(&mut edit)?;
    db.forget_pending_outputs(&state.numbers);
    for f in job.inputs.iter().chain(job.next_inputs.iter()) {
        db.table_cache.evict(f.number);
    }
    let bytes_read: u64 = job
        .inputs
        .iter()
        .chain(job.next_inputs.iter())
        .map(|f| f.file_size)
        .sum();
    let bytes_written: u64 = state.outputs.iter().map(|(m, _)| m.file_size).sum();
    db.add_stats(job.out_level, bytes_read, bytes_written);

    tracing::info!(
        level = job.level,
        out_level = job.out_level,
        inputs = job.inputs.len() + job.next_inputs.len(),
        outputs = state.outputs.len(),
        new_guards = new_guards.len(),
        "compaction installed"
    );
    Ok(())
}

fn do_compaction_work(
    db: &Arc<DbInner>,
    job: &CompactionJob,
    state: &mut OutputState,
    new_guards: &mut Vec<(usize, Vec<u8>)>,
) -> Result<()> {
    let cmp = Arc::clone(job.version.comparator());
    let opts = &db.opts;

    let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
    for file in job.inputs.iter().chain(job.next_inputs.iter()) {
        let table = db.table_cache.get(file.number, true)?;
        children.push(Box::new(table.iter(false)));
    }
    let mut input = MergingIterator::new(Arc::clone(&cmp), children);
    input.seek_to_first()?;

    let mut out_guards: Vec<Vec<u8>> = job.version.guard_keys[job.out_level].clone();
    let mut last_user_key: Option<Vec<u8>> = None;
    let mut last_seq_for_key = u64::MAX;
    let mut gp_index = 0usize;

    while input.valid() {
        if db.is_shutting_down() {
            return Err(Error::Io("shutting down during compaction".to_string()));
        }

        let key = input.key().to_vec();
        let value = input.value().to_vec();
        let (user, seq, kind) = ikey::split_internal_key(&key)?;

        let new_user_key = match &last_user_key {
            None => true,
            Some(last) => cmp.compare(last, user) != std::cmp::Ordering::Equal,
        };
        if new_user_key {
            // Entering a new user key: decide guards and output cuts
            // before its first record is emitted.
            if let Some(level) = guard_level(user, opts) {
                let known = job.version.guard_keys[level]
                    .binary_search_by(|k| cmp.compare(k, user))
                    .is_ok()
                    || new_guards
                        .iter()
                        .any(|(l, k)| *l == level && k.as_slice() == user);
                if !known {
                    new_guards.push((level, user.to_vec()));
                }
                if level <= job.out_level {
                    if let Err(pos) =
                        out_guards.binary_search_by(|k| cmp.compare(k, user))
                    {
                        out_guards.insert(pos, user.to_vec());
                    }
                }
            }

            while gp_index < job.grandparents.len()
                && cmp.compare(job.grandparents[gp_index].largest_user(), user)
                    == std::cmp::Ordering::Less
            {
                state.overlap_bytes += job.grandparents[gp_index].file_size;
                gp_index += 1;
            }

            let partition = partition_of(&out_guards, user, cmp.as_ref());
            let should_roll = match (&state.builder, state.partition) {
                (Some((_, builder)), Some(open_partition)) => {
                    open_partition != partition
                        || builder.estimated_size() >= opts.max_file_size
                        || state.overlap_bytes > max_grandparent_overlap(opts)
                }
                _ => false,
            };
            if should_roll {
                state.roll()?;
            }
            state.partition = Some(partition);
            last_user_key = Some(user.to_vec());
            last_seq_for_key = u64::MAX;
        }

        let should_drop = if last_seq_for_key <= job.smallest_snapshot {
            // A newer record of this key is visible to every snapshot.
            true
        } else {
            kind == ValueKind::Deletion
                && seq <= job.smallest_snapshot
                && job.version.is_base_level_for_key(job.out_level, user)
        };
        last_seq_for_key = seq;

        if !should_drop {
            if state.builder.is_none() {
                let (number, path) = db.new_table_file()?;
                state.numbers.push(number);
                state.builder = Some((number, TableBuilder::create(path, opts)?));
            }
            state
                .builder
                .as_mut()
                .expect("builder open")
                .1
                .add(&key, &value)?;
        }

        input.next()?;
    }

    state.roll()
}
