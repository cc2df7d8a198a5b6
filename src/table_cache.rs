//! Cache of open table files.
//!
//! Opening a table reads its footer, index and filter; the cache keeps
//! recently used tables open so reads and compactions do not repeat that
//! work. Capacity is `max_open_files`; eviction closes the file handle.
//! Evicted tables stay alive while an iterator still holds their `Arc`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::Options;
use crate::error::Result;
use crate::filename;
use crate::sstable::Table;

struct CacheState {
    tables: HashMap<u64, Arc<Table>>,
    // Most recent at the back; evict from the front.
    order: VecDeque<u64>,
}

pub struct TableCache {
    dir: PathBuf,
    opts: Arc<Options>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl TableCache {
    pub fn new(dir: PathBuf, opts: Arc<Options>) -> Self {
        let capacity = opts.max_open_files.max(16);
        Self {
            dir,
            opts,
            capacity,
            state: Mutex::new(CacheState {
                tables: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// The open table for `number`, opening it on a miss. With
    /// `fill_cache` false a miss bypasses the cache entirely.
    pub fn get(&self, number: u64, fill_cache: bool) -> Result<Arc<Table>> {
        {
            let mut state = self.state.lock()?;
            if let Some(table) = state.tables.get(&number).cloned() {
                state.order.retain(|&n| n != number);
                state.order.push_back(number);
                return Ok(table);
            }
        }

        let path = filename::table_file(&self.dir, number);
        let table = Arc::new(Table::open(
            &path,
            number,
            Arc::clone(&self.opts.comparator),
        )?);

        if fill_cache {
            let mut state = self.state.lock()?;
            if state.tables.insert(number, Arc::clone(&table)).is_none() {
                state.order.push_back(number);
            }
            while state.tables.len() > self.capacity {
                if let Some(evict) = state.order.pop_front() {
                    state.tables.remove(&evict);
                } else {
                    break;
                }
            }
        }
        Ok(table)
    }

    /// Drops a deleted file's entry.
    pub fn evict(&self, number: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.tables.remove(&number);
            state.order.retain(|&n| n != number);
        }
    }
}
