//! The file catalog.
//!
//! A [`Version`] is one immutable snapshot of the tree: which table files
//! live on which level, the guard keys partitioning each level, and the
//! per-file Bloom filters. Readers clone an `Arc<Version>` and work
//! against it lock-free; installing a [`edit::VersionEdit`] produces a
//! fresh version and swaps the catalog's current pointer. A version stays
//! alive for as long as any iterator holds its `Arc`, which is what keeps
//! a long scan safe across concurrent compactions.
//!
//! Level 0 files may overlap arbitrarily and are probed newest first.
//! On deeper levels the guard keys split the key space into a sentinel
//! partition (below the smallest guard) and one partition per guard; a
//! lookup binary-searches for its partition and probes only the files
//! there.

pub mod edit;
pub mod set;

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;

use crate::config::{Comparator, Options, NUM_LEVELS};
use crate::error::Result;
use crate::guards::{partition_of, GuardFiles};
use crate::ikey::{self, LookupKey, ValueKind};
use crate::sstable::bloom;
use crate::table_cache::TableCache;

/// Metadata for one table file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub number: u64,
    pub file_size: u64,
    /// Smallest internal key in the file.
    pub smallest: Vec<u8>,
    /// Largest internal key in the file.
    pub largest: Vec<u8>,
}

impl FileMeta {
    pub fn smallest_user(&self) -> &[u8] {
        ikey::user_key(&self.smallest)
    }

    pub fn largest_user(&self) -> &[u8] {
        ikey::user_key(&self.largest)
    }

    fn covers(&self, cmp: &dyn Comparator, user_key: &[u8]) -> bool {
        cmp.compare(user_key, self.smallest_user()) != std::cmp::Ordering::Less
            && cmp.compare(user_key, self.largest_user()) != std::cmp::Ordering::Greater
    }
}

/// The outcome of probing the catalog for one user key.
pub enum LookupResult {
    Value(Vec<u8>),
    Deleted,
    NotFound,
}

pub struct Version {
    cmp: Arc<dyn Comparator>,
    /// All files per level. Level 0 is ordered newest first; deeper
    /// levels ascending by smallest key.
    pub files: Vec<Vec<Arc<FileMeta>>>,
    /// Guard keys per level, ascending. A guard present on level L is
    /// present on every deeper level.
    pub guard_keys: Vec<Vec<Vec<u8>>>,
    /// Files grouped under each guard, aligned with `guard_keys`.
    pub guards: Vec<Vec<GuardFiles>>,
    /// Files below the smallest guard of each level.
    pub sentinels: Vec<Vec<Arc<FileMeta>>>,
    /// File-level Bloom filters, keyed by file number.
    pub filters: HashMap<u64, Arc<Vec<u8>>>,
}

impl Version {
    pub fn empty(cmp: Arc<dyn Comparator>) -> Self {
        Self {
            cmp,
            files: vec![Vec::new(); NUM_LEVELS],
            guard_keys: vec![Vec::new(); NUM_LEVELS],
            guards: vec![Vec::new(); NUM_LEVELS],
            sentinels: vec![Vec::new(); NUM_LEVELS],
            filters: HashMap::new(),
        }
    }

    pub fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.cmp
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn total_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.file_size).sum()
    }

    pub fn max_level_with_files(&self) -> usize {
        (0..NUM_LEVELS)
            .rev()
            .find(|&l| !self.files[l].is_empty())
            .unwrap_or(0)
    }

    /// Compaction pressure for a level; >= 1.0 means compact.
    pub fn score(&self, level: usize, opts: &Options) -> f64 {
        if level == 0 {
            self.files[0].len() as f64 / opts.l0_compaction_trigger as f64
        } else {
            self.total_bytes(level) as f64 / opts.max_bytes_for_level(level) as f64
        }
    }

    /// The level most in need of compaction, when any scores >= 1.
    pub fn pick_compaction_level(&self, opts: &Options) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for level in 0..NUM_LEVELS - 1 {
            let score = self.score(level, opts);
            if score >= 1.0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((level, score));
            }
        }
        best.map(|(level, _)| level)
    }

    fn may_contain(&self, file: &FileMeta, user_key: &[u8]) -> bool {
        match self.filters.get(&file.number) {
            Some(filter) => bloom::key_may_match(user_key, filter),
            None => true,
        }
    }

    /// Files on `level` that may hold `user_key`, newest first.
    fn candidates(&self, level: usize, user_key: &[u8]) -> Vec<Arc<FileMeta>> {
        let cmp = self.cmp.as_ref();
        if level == 0 {
            return self.files[0]
                .iter()
                .filter(|f| f.covers(cmp, user_key))
                .cloned()
                .collect();
        }
        let bucket = match partition_of(&self.guard_keys[level], user_key, cmp) {
            Some(i) => &self.guards[level][i].files,
            None => &self.sentinels[level],
        };
        let mut found: Vec<Arc<FileMeta>> = bucket
            .iter()
            .filter(|f| f.covers(cmp, user_key))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.number.cmp(&a.number));
        found
    }

    /// Probes the levels for the newest record of the lookup key visible
    /// at its sequence.
    pub fn get(
        &self,
        lookup: &LookupKey,
        cache: &TableCache,
        verify_checksums: bool,
        fill_cache: bool,
    ) -> Result<LookupResult> {
        let user_key = lookup.user_key();
        for level in 0..NUM_LEVELS {
            for file in self.candidates(level, user_key) {
                if !self.may_contain(&file, user_key) {
                    continue;
                }
                let table = cache.get(file.number, fill_cache)?;
                let Some((found_key, value)) =
                    table.get(lookup.internal_key(), verify_checksums)?
                else {
                    continue;
                };
                let (found_user, _, kind) = ikey::split_internal_key(&found_key)?;
                if self.cmp.compare(found_user, user_key) != std::cmp::Ordering::Equal {
                    continue;
                }
                return Ok(match kind {
                    ValueKind::Value => LookupResult::Value(value),
                    ValueKind::Deletion => LookupResult::Deleted,
                });
            }
        }
        Ok(LookupResult::NotFound)
    }

    /// Files on `level` overlapping the user-key range. `None` bounds are
    /// open-ended.
    pub fn overlapping_files(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMeta>> {
        let cmp = self.cmp.as_ref();
        self.files[level]
            .iter()
            .filter(|f| {
                let above_begin = begin.map_or(true, |b| {
                    cmp.compare(f.largest_user(), b) != std::cmp::Ordering::Less
                });
                let below_end = end.map_or(true, |e| {
                    cmp.compare(f.smallest_user(), e) != std::cmp::Ordering::Greater
                });
                above_begin && below_end
            })
            .cloned()
            .collect()
    }

    /// Whether any level deeper than `level` could hold `user_key`. Used
    /// to decide when a deletion marker has reached the bottom of the key
    /// and may be discarded.
    pub fn is_base_level_for_key(&self, level: usize, user_key: &[u8]) -> bool {
        for deeper in level + 1..NUM_LEVELS {
            if !self.candidates(deeper, user_key).is_empty() {
                return false;
            }
        }
        true
    }

    /// Rough byte count attributable to the user-key range.
    pub fn approximate_size(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> u64 {
        let cmp = self.cmp.as_ref();
        let mut total = 0u64;
        for level in 0..NUM_LEVELS {
            for file in &self.files[level] {
                let above_begin = begin.map_or(true, |b| {
                    cmp.compare(file.largest_user(), b) != std::cmp::Ordering::Less
                });
                let below_end = end.map_or(true, |e| {
                    cmp.compare(file.smallest_user(), e) != std::cmp::Ordering::Greater
                });
                if !(above_begin && below_end) {
                    continue;
                }
                let fully_inside = begin.map_or(true, |b| {
                    cmp.compare(file.smallest_user(), b) != std::cmp::Ordering::Less
                }) && end.map_or(true, |e| {
                    cmp.compare(file.largest_user(), e) != std::cmp::Ordering::Greater
                });
                total += if fully_inside {
                    file.file_size
                } else {
                    file.file_size / 2
                };
            }
        }
        total
    }

    pub fn guard_details(&self, level: usize) -> String {
        self.guards[level]
            .iter()
            .map(|g| {
                format!(
                    "guard {}: {} files [{}]",
                    format_key(&g.key),
                    g.files.len(),
                    g.files.iter().map(|f| f.number).join(", ")
                )
            })
            .join("\n")
    }

    pub fn sentinel_details(&self, level: usize) -> String {
        format!(
            "sentinel: {} files [{}]",
            self.sentinels[level].len(),
            self.sentinels[level].iter().map(|f| f.number).join(", ")
        )
    }

    /// Multi-line dump of the whole catalog, one level per line.
    pub fn debug_string(&self) -> String {
        (0..NUM_LEVELS)
            .map(|level| {
                format!(
                    "level {level}: {} files, {} guards, {} sentinel files, {} bytes",
                    self.num_files(level),
                    self.guard_keys[level].len(),
                    self.sentinels[level].len(),
                    self.total_bytes(level)
                )
            })
            .join("\n")
    }
}

fn format_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => format!("{s:?}"),
        _ => key.iter().map(|b| format!("{b:02x}")).join(""),
    }
}

/// Accumulates edits on top of a base version and produces the successor.
pub struct VersionBuilder {
    cmp: Arc<dyn Comparator>,
    files: Vec<Vec<Arc<FileMeta>>>,
    guard_keys: Vec<Vec<Vec<u8>>>,
    filters: HashMap<u64, Arc<Vec<u8>>>,
}

impl VersionBuilder {
    pub fn new(base: &Version) -> Self {
        Self {
            cmp: Arc::clone(&base.cmp),
            files: base.files.clone(),
            guard_keys: base.guard_keys.clone(),
            filters: base.filters.clone(),
        }
    }

    pub fn apply(&mut self, edit: &edit::VersionEdit) {
        for (level, number) in &edit.deleted_files {
            self.files[*level].retain(|f| f.number != *number);
            self.filters.remove(number);
        }
        for (level, meta) in &edit.new_files {
            self.files[*level].push(Arc::new(meta.clone()));
        }
        for (level, key) in &edit.new_guards {
            // A guard on a level is inherited by every deeper level.
            for deeper in *level..NUM_LEVELS {
                let keys = &mut self.guard_keys[deeper];
                match keys.binary_search_by(|k| self.cmp.compare(k, key)) {
                    Ok(_) => {}
                    Err(pos) => keys.insert(pos, key.clone()),
                }
            }
        }
        for (number, filter) in &edit.file_filters {
            self.filters.insert(*number, Arc::new(filter.clone()));
        }
    }

    /// Sorts the file lists and rebuilds the guard partitions.
    pub fn finish(self) -> Version {
        let cmp = self.cmp;
        let mut files = self.files;
        for (level, level_files) in files.iter_mut().enumerate() {
            if level == 0 {
                level_files.sort_by(|a, b| b.number.cmp(&a.number));
            } else {
                level_files.sort_by(|a, b| {
                    ikey::compare_internal(cmp.as_ref(), &a.smallest, &b.smallest)
                });
            }
        }

        let mut guards = Vec::with_capacity(NUM_LEVELS);
        let mut sentinels = Vec::with_capacity(NUM_LEVELS);
        for level in 0..NUM_LEVELS {
            let keys = &self.guard_keys[level];
            let mut level_guards: Vec<GuardFiles> =
                keys.iter().map(|k| GuardFiles::new(k.clone())).collect();
            let mut level_sentinels = Vec::new();
            for file in &files[level] {
                match partition_of(keys, file.smallest_user(), cmp.as_ref()) {
                    Some(i) => level_guards[i].files.push(Arc::clone(file)),
                    None => level_sentinels.push(Arc::clone(file)),
                }
            }
            guards.push(level_guards);
            sentinels.push(level_sentinels);
        }

        Version {
            cmp,
            files,
            guard_keys: self.guard_keys,
            guards,
            sentinels,
            filters: self.filters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BytewiseComparator;
    use crate::ikey::make_internal_key;
    use crate::version::edit::VersionEdit;

    fn meta(number: u64, smallest: &[u8], largest: &[u8]) -> FileMeta {
        FileMeta {
            number,
            file_size: 1000,
            smallest: make_internal_key(smallest, 5, ValueKind::Value),
            largest: make_internal_key(largest, 1, ValueKind::Value),
        }
    }

    fn build(edit: &VersionEdit) -> Version {
        let base = Version::empty(Arc::new(BytewiseComparator));
        let mut builder = VersionBuilder::new(&base);
        builder.apply(edit);
        builder.finish()
    }

    #[test]
    fn test_level0_ordered_newest_first() {
        let mut edit = VersionEdit::new();
        edit.add_file(0, meta(3, b"a", b"m"));
        edit.add_file(0, meta(7, b"c", b"z"));
        edit.add_file(0, meta(5, b"b", b"x"));

        let version = build(&edit);
        let numbers: Vec<_> = version.files[0].iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![7, 5, 3]);
    }

    #[test]
    fn test_deeper_levels_ordered_by_key() {
        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(3, b"m", b"p"));
        edit.add_file(1, meta(7, b"a", b"c"));

        let version = build(&edit);
        let numbers: Vec<_> = version.files[1].iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![7, 3]);
    }

    #[test]
    fn test_guard_partitioning() {
        let mut edit = VersionEdit::new();
        edit.add_guard(1, b"k".to_vec());
        edit.add_file(1, meta(1, b"a", b"c"));
        edit.add_file(1, meta(2, b"k", b"m"));
        edit.add_file(1, meta(3, b"n", b"z"));

        let version = build(&edit);
        assert_eq!(version.sentinels[1].len(), 1);
        assert_eq!(version.guards[1].len(), 1);
        assert_eq!(version.guards[1][0].files.len(), 2);
        // Partitions cover the level disjointly.
        assert_eq!(
            version.num_files(1),
            version.sentinels[1].len()
                + version.guards[1]
                    .iter()
                    .map(|g| g.files.len())
                    .sum::<usize>()
        );
    }

    #[test]
    fn test_guard_inherited_by_deeper_levels() {
        let mut edit = VersionEdit::new();
        edit.add_guard(2, b"g".to_vec());

        let version = build(&edit);
        assert!(version.guard_keys[0].is_empty());
        assert!(version.guard_keys[1].is_empty());
        for level in 2..NUM_LEVELS {
            assert_eq!(version.guard_keys[level], vec![b"g".to_vec()]);
        }
    }

    #[test]
    fn test_guard_set_deduplicated() {
        let mut edit = VersionEdit::new();
        edit.add_guard(1, b"g".to_vec());
        edit.add_guard(1, b"g".to_vec());
        edit.add_guard(3, b"g".to_vec());

        let version = build(&edit);
        assert_eq!(version.guard_keys[1], vec![b"g".to_vec()]);
        assert_eq!(version.guard_keys[3], vec![b"g".to_vec()]);
    }

    #[test]
    fn test_delete_file() {
        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(1, b"a", b"c"));
        edit.add_file(1, meta(2, b"d", b"f"));
        let version = build(&edit);

        let mut builder = VersionBuilder::new(&version);
        let mut second = VersionEdit::new();
        second.delete_file(1, 1);
        builder.apply(&second);
        let next = builder.finish();

        assert_eq!(next.num_files(1), 1);
        assert_eq!(next.files[1][0].number, 2);
        // The original version is untouched.
        assert_eq!(version.num_files(1), 2);
    }

    #[test]
    fn test_overlapping_files() {
        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(1, b"a", b"c"));
        edit.add_file(1, meta(2, b"d", b"f"));
        edit.add_file(1, meta(3, b"g", b"i"));
        let version = build(&edit);

        let hits = version.overlapping_files(1, Some(b"e"), Some(b"h"));
        let numbers: Vec<_> = hits.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);

        assert_eq!(version.overlapping_files(1, None, None).len(), 3);
        assert_eq!(version.overlapping_files(1, Some(b"z"), None).len(), 0);
    }

    #[test]
    fn test_score() {
        let opts = Options::default().l0_compaction_trigger(4);
        let mut edit = VersionEdit::new();
        for n in 1..=8 {
            edit.add_file(0, meta(n, b"a", b"z"));
        }
        let version = build(&edit);
        assert_eq!(version.score(0, &opts), 2.0);
        assert_eq!(version.pick_compaction_level(&opts), Some(0));
    }

    #[test]
    fn test_is_base_level_for_key() {
        let mut edit = VersionEdit::new();
        edit.add_file(2, meta(1, b"m", b"p"));
        let version = build(&edit);

        assert!(!version.is_base_level_for_key(1, b"n"));
        assert!(version.is_base_level_for_key(1, b"a"));
        assert!(version.is_base_level_for_key(2, b"n"));
    }
}
