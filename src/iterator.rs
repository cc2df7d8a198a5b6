//! The iterator stack.
//!
//! Three layers sit between a scan and the bytes on disk:
//!
//! * [`InternalIterator`] — the bidirectional cursor interface shared by
//!   memtables, table files and the combinators below. Keys are internal
//!   keys.
//! * [`MergingIterator`] — k-way merge over child cursors with a
//!   direction flag. Flipping direction repositions every child on the
//!   other side of the current key before the min/max selection resumes.
//! * [`LevelIterator`] — concatenation across one level's partitions:
//!   sentinel files first, then each guard's files, lazily opening one
//!   table at a time.
//!
//! [`DbIterator`] sits on top and turns internal records into the
//! user-visible sequence: newest visible version per user key, deletion
//! markers filtered, snapshot sequence respected.

use std::sync::Arc;

use crate::config::Comparator;
use crate::error::Result;
use crate::ikey::{self, SeqNo, ValueKind, KIND_FOR_SEEK};
use crate::memtable::Memtable;
use crate::sstable::TableIterator;
use crate::table_cache::TableCache;
use crate::version::{FileMeta, Version};

/// Bidirectional cursor over internal keys.
pub trait InternalIterator {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self) -> Result<()>;
    fn seek_to_last(&mut self) -> Result<()>;
    /// Positions at the first entry with internal key >= `target`.
    fn seek(&mut self, target: &[u8]) -> Result<()>;
    fn next(&mut self) -> Result<()>;
    fn prev(&mut self) -> Result<()>;
    /// Valid only while `valid()`.
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// K-way merge preserving internal-key order across child iterators.
pub struct MergingIterator {
    cmp: Arc<dyn Comparator>,
    children: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    pub fn new(cmp: Arc<dyn Comparator>, children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if ikey::compare_internal(self.cmp.as_ref(), child.key(), self.children[s].key())
                        == std::cmp::Ordering::Less
                    {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if ikey::compare_internal(self.cmp.as_ref(), child.key(), self.children[l].key())
                        == std::cmp::Ordering::Greater
                    {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.seek_to_first()?;
        }
        self.direction = Direction::Forward;
        self.find_smallest();
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.seek_to_last()?;
        }
        self.direction = Direction::Reverse;
        self.find_largest();
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        for child in &mut self.children {
            child.seek(target)?;
        }
        self.direction = Direction::Forward;
        self.find_smallest();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };

        if self.direction == Direction::Reverse {
            // Every non-current child sits at or before the current key;
            // move each to the first entry after it.
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key)?;
                if child.valid()
                    && ikey::compare_internal(self.cmp.as_ref(), child.key(), &key)
                        == std::cmp::Ordering::Equal
                {
                    child.next()?;
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next()?;
        self.find_smallest();
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };

        if self.direction == Direction::Forward {
            // Every non-current child sits at or after the current key;
            // move each to the last entry before it.
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key)?;
                if child.valid() {
                    child.prev()?;
                } else {
                    child.seek_to_last()?;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev()?;
        self.find_largest();
        Ok(())
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("iterator valid")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("iterator valid")].value()
    }
}

/// Concatenating iterator over one level's sentinel and guard partitions.
///
/// On levels >= 1 the partitions tile the key space in order and files
/// within a partition are disjoint, so the flattened file list is sorted
/// and a single cursor can walk it, opening one table at a time.
pub struct LevelIterator {
    cmp: Arc<dyn Comparator>,
    files: Vec<Arc<FileMeta>>,
    cache: Arc<TableCache>,
    verify_checksums: bool,
    fill_cache: bool,
    file_idx: usize,
    iter: Option<TableIterator>,
}

impl LevelIterator {
    pub fn new(
        version: &Version,
        level: usize,
        cache: Arc<TableCache>,
        verify_checksums: bool,
        fill_cache: bool,
    ) -> Self {
        debug_assert!(level >= 1);
        let mut files: Vec<Arc<FileMeta>> = version.sentinels[level].to_vec();
        for guard in &version.guards[level] {
            files.extend(guard.files.iter().cloned());
        }
        Self {
            cmp: Arc::clone(version.comparator()),
            files,
            cache,
            verify_checksums,
            fill_cache,
            file_idx: 0,
            iter: None,
        }
    }

    fn open_file(&mut self, idx: usize) -> Result<()> {
        if idx >= self.files.len() {
            self.iter = None;
            return Ok(());
        }
        let table = self
            .cache
            .get(self.files[idx].number, self.fill_cache)?;
        self.iter = Some(table.iter(self.verify_checksums));
        self.file_idx = idx;
        Ok(())
    }

    fn skip_empty_forward(&mut self) -> Result<()> {
        loop {
            match &self.iter {
                None => break,
                Some(iter) if iter.valid() => break,
                Some(_) => {}
            }
            let next = self.file_idx + 1;
            self.open_file(next)?;
            if let Some(iter) = &mut self.iter {
                iter.seek_to_first()?;
            }
        }
        Ok(())
    }

    fn skip_empty_backward(&mut self) -> Result<()> {
        loop {
            match &self.iter {
                None => break,
                Some(iter) if iter.valid() => break,
                Some(_) => {}
            }
            if self.file_idx == 0 {
                self.iter = None;
                break;
            }
            let prev = self.file_idx - 1;
            self.open_file(prev)?;
            if let Some(iter) = &mut self.iter {
                iter.seek_to_last()?;
            }
        }
        Ok(())
    }
}

impl InternalIterator for LevelIterator {
    fn valid(&self) -> bool {
        self.iter.as_ref().is_some_and(|i| i.valid())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.open_file(0)?;
        if let Some(iter) = &mut self.iter {
            iter.seek_to_first()?;
        }
        self.skip_empty_forward()
    }

    fn seek_to_last(&mut self) -> Result<()> {
        if self.files.is_empty() {
            self.iter = None;
            return Ok(());
        }
        self.open_file(self.files.len() - 1)?;
        if let Some(iter) = &mut self.iter {
            iter.seek_to_last()?;
        }
        self.skip_empty_backward()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let idx = self.files.partition_point(|f| {
            ikey::compare_internal(self.cmp.as_ref(), &f.largest, target)
                == std::cmp::Ordering::Less
        });
        self.open_file(idx)?;
        if let Some(iter) = &mut self.iter {
            iter.seek(target)?;
        }
        self.skip_empty_forward()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(iter) = &mut self.iter {
            iter.next()?;
        }
        self.skip_empty_forward()
    }

    fn prev(&mut self) -> Result<()> {
        if let Some(iter) = &mut self.iter {
            iter.prev()?;
        }
        self.skip_empty_backward()
    }

    fn key(&self) -> &[u8] {
        self.iter.as_ref().expect("iterator valid").key()
    }

    fn value(&self) -> &[u8] {
        self.iter.as_ref().expect("iterator valid").value()
    }
}

/// Resources a database iterator keeps alive: the memtables it reads and
/// the version whose files it may open.
pub struct IterPins {
    pub mem: Arc<Memtable>,
    pub imm: Option<Arc<Memtable>>,
    pub version: Arc<Version>,
}

/// User-facing bidirectional iterator.
///
/// Surfaces each user key at most once, carrying the newest version
/// visible at the iterator's sequence; deletion markers hide older
/// versions and are themselves hidden.
pub struct DbIterator {
    inner: MergingIterator,
    cmp: Arc<dyn Comparator>,
    sequence: SeqNo,
    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    _pins: Option<IterPins>,
}

impl DbIterator {
    pub fn new(
        inner: MergingIterator,
        cmp: Arc<dyn Comparator>,
        sequence: SeqNo,
        pins: Option<IterPins>,
    ) -> Self {
        Self {
            inner,
            cmp,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            _pins: pins,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current user key. Only while `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => ikey::user_key(self.inner.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    /// Current value. Only while `valid()`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first()?;
        if self.inner.valid() {
            self.find_next_user_entry(false)
        } else {
            self.valid = false;
            Ok(())
        }
    }

    pub fn seek_to_last(&mut self) -> Result<()> {
        self.direction = Direction::Reverse;
        self.saved_key.clear();
        self.saved_value.clear();
        self.inner.seek_to_last()?;
        self.find_prev_user_entry()
    }

    pub fn seek(&mut self, user_key: &[u8]) -> Result<()> {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        let target = ikey::make_internal_key(user_key, self.sequence, KIND_FOR_SEEK);
        self.inner.seek(&target)?;
        if self.inner.valid() {
            self.find_next_user_entry(false)
        } else {
            self.valid = false;
            Ok(())
        }
    }

    pub fn next(&mut self) -> Result<()> {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            // The inner iterator sits before all entries of saved_key (or
            // is exhausted backwards); step it into the forward range.
            self.direction = Direction::Forward;
            if !self.inner.valid() {
                self.inner.seek_to_first()?;
            } else {
                self.inner.next()?;
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return Ok(());
            }
        } else {
            self.saved_key = ikey::user_key(self.inner.key()).to_vec();
            self.inner.next()?;
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return Ok(());
            }
        }

        self.find_next_user_entry(true)
    }

    pub fn prev(&mut self) -> Result<()> {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // Walk backwards past every entry of the current user key.
            self.saved_key = ikey::user_key(self.inner.key()).to_vec();
            loop {
                self.inner.prev()?;
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return Ok(());
                }
                if self
                    .cmp
                    .compare(ikey::user_key(self.inner.key()), &self.saved_key)
                    == std::cmp::Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry()
    }

    /// Scans forward for the newest visible, non-deleted user entry.
    /// With `skipping`, entries for user keys <= `saved_key` are hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) -> Result<()> {
        debug_assert!(self.direction == Direction::Forward);

        while self.inner.valid() {
            if let Ok((user_key, seq, kind)) = ikey::split_internal_key(self.inner.key()) {
                if seq <= self.sequence {
                    match kind {
                        ValueKind::Deletion => {
                            // Hide all older entries of this key.
                            self.saved_key = user_key.to_vec();
                            skipping = true;
                        }
                        ValueKind::Value => {
                            if skipping
                                && self.cmp.compare(user_key, &self.saved_key)
                                    != std::cmp::Ordering::Greater
                            {
                                // Shadowed by a deletion or already yielded.
                            } else {
                                self.valid = true;
                                self.saved_key.clear();
                                return Ok(());
                            }
                        }
                    }
                }
            }
            self.inner.next()?;
        }

        self.saved_key.clear();
        self.valid = false;
        Ok(())
    }

    /// Scans backward accumulating the newest visible entry of the user
    /// key preceding the cursor.
    fn find_prev_user_entry(&mut self) -> Result<()> {
        debug_assert!(self.direction == Direction::Reverse);

        let mut kind_of_saved = ValueKind::Deletion;
        while self.inner.valid() {
            if let Ok((user_key, seq, kind)) = ikey::split_internal_key(self.inner.key()) {
                if seq <= self.sequence {
                    if kind_of_saved != ValueKind::Deletion
                        && self.cmp.compare(user_key, &self.saved_key) == std::cmp::Ordering::Less
                    {
                        // Crossed into the previous user key; the saved
                        // entry is the answer.
                        break;
                    }
                    kind_of_saved = kind;
                    match kind {
                        ValueKind::Deletion => {
                            self.saved_key.clear();
                            self.saved_value.clear();
                        }
                        ValueKind::Value => {
                            self.saved_key = user_key.to_vec();
                            self.saved_value = self.inner.value().to_vec();
                        }
                    }
                }
            }
            self.inner.prev()?;
        }

        if kind_of_saved == ValueKind::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
        Ok(())
    }
}
