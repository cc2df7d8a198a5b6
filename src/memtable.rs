//! In-memory write buffer over a concurrent skip list.
//!
//! The memtable holds recent writes keyed by internal key, so multiple
//! versions of one user key coexist and order newest-first. Writes come
//! only from the single writer at the head of the write queue; reads and
//! iteration are lock-free through `crossbeam_skiplist::SkipMap`.
//!
//! A memtable is paired with the WAL that made its contents durable. When
//! rotated into the immutable slot it stops changing, and it is dropped
//! once its flushed tables land in the current version and no iterator
//! pins it.

use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::config::Comparator;
use crate::error::Result;
use crate::ikey::{self, LookupKey, SeqNo, ValueKind};
use crate::iterator::InternalIterator;

/// Skip list key: an encoded internal key ordered by the user comparator
/// then descending sequence.
pub struct MemKey {
    rep: Vec<u8>,
    cmp: Arc<dyn Comparator>,
}

impl MemKey {
    fn new(rep: Vec<u8>, cmp: Arc<dyn Comparator>) -> Self {
        Self { rep, cmp }
    }
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        ikey::compare_internal(self.cmp.as_ref(), &self.rep, &other.rep)
    }
}

pub struct Memtable {
    table: SkipMap<MemKey, Vec<u8>>,
    cmp: Arc<dyn Comparator>,
    size: AtomicUsize,
    log_number: u64,
}

impl Memtable {
    /// Creates an empty memtable backed by WAL `log_number`.
    pub fn new(cmp: Arc<dyn Comparator>, log_number: u64) -> Self {
        Self {
            table: SkipMap::new(),
            cmp,
            size: AtomicUsize::new(0),
            log_number,
        }
    }

    /// Inserts one record. `value` is ignored for deletions.
    pub fn add(&self, seq: SeqNo, kind: ValueKind, user_key: &[u8], value: &[u8]) {
        let ikey = ikey::make_internal_key(user_key, seq, kind);
        let value = match kind {
            ValueKind::Value => value.to_vec(),
            ValueKind::Deletion => Vec::new(),
        };
        let entry_size = ikey.len() + value.len() + 8;
        self.table
            .insert(MemKey::new(ikey, Arc::clone(&self.cmp)), value);
        self.size.fetch_add(entry_size, AtomicOrdering::Relaxed);
    }

    /// Newest record for `user_key` visible at `seq`.
    ///
    /// Returns `None` when the memtable holds nothing for the key,
    /// `Some(Some(value))` for a live value and `Some(None)` when a
    /// deletion marker shadows it.
    pub fn get(&self, user_key: &[u8], seq: SeqNo) -> Option<Option<Vec<u8>>> {
        let lookup = LookupKey::new(user_key, seq);
        let start = MemKey::new(lookup.internal_key().to_vec(), Arc::clone(&self.cmp));
        let entry = self.table.lower_bound(Bound::Included(&start))?;
        let (found_user, _, kind) =
            ikey::split_internal_key(&entry.key().rep).expect("memtable key well-formed");
        if self
            .cmp
            .compare(found_user, user_key)
            != std::cmp::Ordering::Equal
        {
            return None;
        }
        match kind {
            ValueKind::Value => Some(Some(entry.value().clone())),
            ValueKind::Deletion => Some(None),
        }
    }

    /// Approximate footprint in bytes.
    pub fn approximate_size(&self) -> usize {
        self.size.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// The WAL whose replay reproduces this memtable.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }
}

/// Bidirectional cursor over a memtable's internal keys.
pub struct MemtableIterator {
    memtable: Arc<Memtable>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemtableIterator {
    pub fn new(memtable: Arc<Memtable>) -> Self {
        Self {
            memtable,
            current: None,
        }
    }

    fn bound_key(&self, ikey: &[u8]) -> MemKey {
        MemKey::new(ikey.to_vec(), Arc::clone(&self.memtable.cmp))
    }

    fn set_from(
        current: &mut Option<(Vec<u8>, Vec<u8>)>,
        entry: Option<crossbeam_skiplist::map::Entry<'_, MemKey, Vec<u8>>>,
    ) {
        *current = entry.map(|e| (e.key().rep.clone(), e.value().clone()));
    }
}

impl InternalIterator for MemtableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        let entry = self.memtable.table.front();
        Self::set_from(&mut self.current, entry);
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        let entry = self.memtable.table.back();
        Self::set_from(&mut self.current, entry);
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let bound = self.bound_key(target);
        let entry = self.memtable.table.lower_bound(Bound::Included(&bound));
        Self::set_from(&mut self.current, entry);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let Some((cur, _)) = self.current.take() else {
            return Ok(());
        };
        let bound = self.bound_key(&cur);
        let entry = self
            .memtable
            .table
            .range((Bound::Excluded(&bound), Bound::Unbounded))
            .next();
        Self::set_from(&mut self.current, entry);
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        let Some((cur, _)) = self.current.take() else {
            return Ok(());
        };
        let bound = self.bound_key(&cur);
        let entry = self.memtable.table.upper_bound(Bound::Excluded(&bound));
        Self::set_from(&mut self.current, entry);
        Ok(())
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator valid").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator valid").1
    }
}
