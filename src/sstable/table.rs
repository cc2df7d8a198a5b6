//! Sorted table files.
//!
//! ## File layout
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Filter Block      |
//! +-------------------+
//! | Index Block       |
//! +-------------------+
//! | Footer (36 bytes) |
//! +-------------------+
//! ```
//!
//! Each written block carries a one-byte compression tag and a CRC32 over
//! payload+tag. The index block maps each data block's last internal key
//! to its position; the footer locates the index and filter blocks and
//! ends in a magic number.
//!
//! A `TableBuilder` accepts entries in ascending internal-key order and
//! produces an immutable file; `Table` serves point lookups and a
//! bidirectional iterator.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crc::{Crc, CRC_32_ISCSI};

use crate::config::{Comparator, Compression, Options};
use crate::error::{Error, Result};
use crate::ikey;
use crate::iterator::InternalIterator;
use crate::sstable::block::{Block, BlockBuilder};
use crate::sstable::bloom;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const TABLE_MAGIC: u32 = 0x67647462;
const FOOTER_LEN: u64 = 36;
const BLOCK_TRAILER_LEN: u64 = 5;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_SNAPPY: u8 = 1;

#[derive(Debug, Clone)]
struct IndexEntry {
    last_key: Vec<u8>,
    offset: u64,
    len: u64,
}

/// Summary of a finished table, fed into the file's manifest record.
#[derive(Debug, Clone)]
pub struct BuiltTable {
    pub file_size: u64,
    pub num_entries: u64,
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
    pub filter: Vec<u8>,
}

pub struct TableBuilder {
    writer: BufWriter<File>,
    file: File,
    path: PathBuf,
    cmp: Arc<dyn Comparator>,
    block_size: usize,
    restart_interval: usize,
    compression: Compression,
    bloom_bits_per_key: usize,

    block: BlockBuilder,
    index: Vec<IndexEntry>,
    user_keys: Vec<Vec<u8>>,
    last_key: Vec<u8>,
    smallest: Vec<u8>,
    offset: u64,
    num_entries: u64,
}

impl TableBuilder {
    pub fn create(path: impl Into<PathBuf>, opts: &Options) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file.try_clone()?),
            file,
            path,
            cmp: Arc::clone(&opts.comparator),
            block_size: opts.block_size,
            restart_interval: opts.block_restart_interval,
            compression: opts.compression,
            bloom_bits_per_key: opts.bloom_bits_per_key,
            block: BlockBuilder::new(opts.block_restart_interval),
            index: Vec::new(),
            user_keys: Vec::new(),
            last_key: Vec::new(),
            smallest: Vec::new(),
            offset: 0,
            num_entries: 0,
        })
    }

    /// Adds one entry. Keys must arrive in strictly ascending internal
    /// order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(
            self.num_entries == 0
                || ikey::compare_internal(self.cmp.as_ref(), &self.last_key, key)
                    == std::cmp::Ordering::Less,
            "table entries out of order"
        );

        if self.num_entries == 0 {
            self.smallest = key.to_vec();
        }

        let user = ikey::user_key(key);
        if self
            .user_keys
            .last()
            .map_or(true, |prev| prev.as_slice() != user)
        {
            self.user_keys.push(user.to_vec());
        }

        self.block.add(key, value);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;

        if self.block.size_estimate() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far plus the pending block; used for output
    /// rolling decisions.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.size_estimate() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(&mut self.block, BlockBuilder::new(self.restart_interval));
        let payload = block.finish();
        let (offset, len) = self.write_block(&payload, self.compression)?;
        self.index.push(IndexEntry {
            last_key: self.last_key.clone(),
            offset,
            len,
        });
        Ok(())
    }

    fn write_block(&mut self, payload: &[u8], compression: Compression) -> Result<(u64, u64)> {
        let (body, tag) = match compression {
            Compression::Snappy => {
                let compressed = snap::raw::Encoder::new().compress_vec(payload)?;
                if compressed.len() < payload.len() {
                    (compressed, COMPRESSION_SNAPPY)
                } else {
                    (payload.to_vec(), COMPRESSION_NONE)
                }
            }
            Compression::None => (payload.to_vec(), COMPRESSION_NONE),
        };

        let mut digest = CRC32.digest();
        digest.update(&body);
        digest.update(&[tag]);

        let offset = self.offset;
        self.writer.write_all(&body)?;
        self.writer.write_u8(tag)?;
        self.writer.write_u32::<BigEndian>(digest.finalize())?;
        self.offset += body.len() as u64 + BLOCK_TRAILER_LEN;
        Ok((offset, body.len() as u64))
    }

    /// Writes filter, index and footer, then fsyncs. Returns the table
    /// summary.
    pub fn finish(mut self) -> Result<BuiltTable> {
        self.flush_data_block()?;

        let filter = bloom::create_filter(&self.user_keys, self.bloom_bits_per_key);
        let (filter_off, filter_len) = self.write_block(&filter, Compression::None)?;

        let mut index_payload = Vec::new();
        index_payload
            .write_u32::<BigEndian>(self.index.len() as u32)
            .expect("vec write");
        for entry in &self.index {
            index_payload
                .write_u32::<BigEndian>(entry.last_key.len() as u32)
                .expect("vec write");
            index_payload.extend_from_slice(&entry.last_key);
            index_payload
                .write_u64::<BigEndian>(entry.offset)
                .expect("vec write");
            index_payload
                .write_u64::<BigEndian>(entry.len)
                .expect("vec write");
        }
        let (index_off, index_len) = self.write_block(&index_payload, Compression::None)?;

        self.writer.write_u64::<BigEndian>(index_off)?;
        self.writer.write_u64::<BigEndian>(index_len)?;
        self.writer.write_u64::<BigEndian>(filter_off)?;
        self.writer.write_u64::<BigEndian>(filter_len)?;
        self.writer.write_u32::<BigEndian>(TABLE_MAGIC)?;
        self.writer.flush()?;
        self.file.sync_all()?;

        Ok(BuiltTable {
            file_size: self.offset + FOOTER_LEN,
            num_entries: self.num_entries,
            smallest: self.smallest,
            largest: self.last_key,
            filter,
        })
    }

    /// Drops the builder and removes the partially written file.
    pub fn abandon(self) -> Result<()> {
        drop(self.writer);
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// An open, immutable table file.
pub struct Table {
    file: Mutex<File>,
    number: u64,
    index: Vec<IndexEntry>,
    filter: Vec<u8>,
    cmp: Arc<dyn Comparator>,
}

impl Table {
    pub fn open(path: &Path, number: u64, cmp: Arc<dyn Comparator>) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_LEN {
            return Err(Error::Corruption(format!(
                "table {number} too short: {file_size} bytes"
            )));
        }

        file.seek(SeekFrom::Start(file_size - FOOTER_LEN))?;
        let mut footer = [0u8; FOOTER_LEN as usize];
        file.read_exact(&mut footer)?;
        let mut cursor = Cursor::new(&footer[..]);
        let index_off = cursor.read_u64::<BigEndian>()?;
        let index_len = cursor.read_u64::<BigEndian>()?;
        let filter_off = cursor.read_u64::<BigEndian>()?;
        let filter_len = cursor.read_u64::<BigEndian>()?;
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!("table {number} bad magic")));
        }

        let index_payload = read_raw_block(&mut file, index_off, index_len, true)?;
        let mut cursor = Cursor::new(&index_payload[..]);
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut index = Vec::with_capacity(count);
        for _ in 0..count {
            let klen = cursor.read_u32::<BigEndian>()? as usize;
            let mut last_key = vec![0u8; klen];
            cursor
                .read_exact(&mut last_key)
                .map_err(|_| Error::corruption("table index truncated"))?;
            let offset = cursor.read_u64::<BigEndian>()?;
            let len = cursor.read_u64::<BigEndian>()?;
            index.push(IndexEntry {
                last_key,
                offset,
                len,
            });
        }

        let filter = read_raw_block(&mut file, filter_off, filter_len, true)?;

        Ok(Self {
            file: Mutex::new(file),
            number,
            index,
            filter,
            cmp,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// The filter built when the table was written.
    pub fn filter(&self) -> &[u8] {
        &self.filter
    }

    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        bloom::key_may_match(user_key, &self.filter)
    }

    /// First entry at or after `target` in internal-key order.
    pub fn get(&self, target: &[u8], verify_checksums: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let block_idx = self.index.partition_point(|e| {
            ikey::compare_internal(self.cmp.as_ref(), &e.last_key, target)
                == std::cmp::Ordering::Less
        });
        if block_idx >= self.index.len() {
            return Ok(None);
        }
        let block = self.read_block(block_idx, verify_checksums)?;
        let i = block.seek(self.cmp.as_ref(), target);
        // The index placed target at or before this block's last key.
        match block.entries().get(i) {
            Some((key, value)) => Ok(Some((key.clone(), value.clone()))),
            None => Ok(None),
        }
    }

    fn read_block(&self, block_idx: usize, verify_checksums: bool) -> Result<Block> {
        let entry = &self.index[block_idx];
        let payload = {
            let mut file = self.file.lock()?;
            read_raw_block(&mut file, entry.offset, entry.len, verify_checksums)?
        };
        Block::decode(&payload)
    }

    pub fn iter(self: Arc<Self>, verify_checksums: bool) -> TableIterator {
        TableIterator {
            table: self,
            verify_checksums,
            block_idx: 0,
            block: None,
            entry_idx: 0,
        }
    }
}

/// Reads one block (payload + trailer) and undoes compression.
fn read_raw_block(file: &mut File, offset: u64, len: u64, verify: bool) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; (len + BLOCK_TRAILER_LEN) as usize];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;

    let body_len = len as usize;
    let tag = buf[body_len];
    if verify {
        let stored = u32::from_be_bytes(buf[body_len + 1..body_len + 5].try_into().expect("crc"));
        let mut digest = CRC32.digest();
        digest.update(&buf[..body_len + 1]);
        if digest.finalize() != stored {
            return Err(Error::corruption("block checksum mismatch"));
        }
    }

    buf.truncate(body_len);
    match tag {
        COMPRESSION_NONE => Ok(buf),
        COMPRESSION_SNAPPY => Ok(snap::raw::Decoder::new().decompress_vec(&buf)?),
        other => Err(Error::Corruption(format!("unknown block compression: {other}"))),
    }
}

/// Bidirectional cursor over one table's entries.
pub struct TableIterator {
    table: Arc<Table>,
    verify_checksums: bool,
    block_idx: usize,
    block: Option<Block>,
    entry_idx: usize,
}

impl TableIterator {
    fn load_block(&mut self, block_idx: usize) -> Result<()> {
        if block_idx >= self.table.index.len() {
            self.block = None;
            return Ok(());
        }
        self.block = Some(self.table.read_block(block_idx, self.verify_checksums)?);
        self.block_idx = block_idx;
        Ok(())
    }
}

impl InternalIterator for TableIterator {
    fn valid(&self) -> bool {
        self.block
            .as_ref()
            .is_some_and(|b| self.entry_idx < b.len())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.load_block(0)?;
        self.entry_idx = 0;
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        if self.table.index.is_empty() {
            self.block = None;
            return Ok(());
        }
        self.load_block(self.table.index.len() - 1)?;
        self.entry_idx = self.block.as_ref().map_or(0, |b| b.len().saturating_sub(1));
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let cmp = Arc::clone(&self.table.cmp);
        let block_idx = self.table.index.partition_point(|e| {
            ikey::compare_internal(cmp.as_ref(), &e.last_key, target) == std::cmp::Ordering::Less
        });
        if block_idx >= self.table.index.len() {
            self.block = None;
            return Ok(());
        }
        self.load_block(block_idx)?;
        if let Some(block) = &self.block {
            self.entry_idx = block.seek(cmp.as_ref(), target);
            if self.entry_idx >= block.len() {
                // Target sorts past this block's entries; resume at the
                // next block's first entry.
                self.load_block(block_idx + 1)?;
                self.entry_idx = 0;
            }
        }
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }
        self.entry_idx += 1;
        if self.block.as_ref().is_some_and(|b| self.entry_idx >= b.len()) {
            let next = self.block_idx + 1;
            self.load_block(next)?;
            self.entry_idx = 0;
        }
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }
        if self.entry_idx > 0 {
            self.entry_idx -= 1;
            return Ok(());
        }
        if self.block_idx == 0 {
            self.block = None;
            return Ok(());
        }
        let prev = self.block_idx - 1;
        self.load_block(prev)?;
        self.entry_idx = self.block.as_ref().map_or(0, |b| b.len().saturating_sub(1));
        Ok(())
    }

    fn key(&self) -> &[u8] {
        &self.block.as_ref().expect("iterator valid").entries()[self.entry_idx].0
    }

    fn value(&self) -> &[u8] {
        &self.block.as_ref().expect("iterator valid").entries()[self.entry_idx].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::ikey::{make_internal_key, ValueKind};
    use crate::tmpfs::TempDir;

    fn build_table(dir: &TempDir, opts: &Options, n: usize) -> Arc<Table> {
        let path = dir.path().join("000001.sst");
        let mut builder = TableBuilder::create(&path, opts).unwrap();
        for i in 0..n {
            let key = make_internal_key(format!("key_{i:05}").as_bytes(), 7, ValueKind::Value);
            builder.add(&key, format!("value_{i}").as_bytes()).unwrap();
        }
        let built = builder.finish().unwrap();
        assert_eq!(built.num_entries, n as u64);
        Arc::new(Table::open(&path, 1, Arc::clone(&opts.comparator)).unwrap())
    }

    #[test]
    fn test_build_and_get() {
        let dir = TempDir::new().unwrap();
        let opts = Options::default().block_size(256);
        let table = build_table(&dir, &opts, 100);

        for i in [0, 1, 42, 99] {
            let target = make_internal_key(format!("key_{i:05}").as_bytes(), 10, ValueKind::Value);
            let (key, value) = table.get(&target, true).unwrap().expect("found");
            assert_eq!(ikey::user_key(&key), format!("key_{i:05}").as_bytes());
            assert_eq!(value, format!("value_{i}").as_bytes());
        }

        let past_end = make_internal_key(b"zzz", 10, ValueKind::Value);
        assert!(table.get(&past_end, true).unwrap().is_none());
    }

    #[test]
    fn test_uncompressed_tables() {
        let dir = TempDir::new().unwrap();
        let opts = Options::default()
            .block_size(128)
            .compression(Compression::None);
        let table = build_table(&dir, &opts, 50);
        let target = make_internal_key(b"key_00030", 10, ValueKind::Value);
        assert!(table.get(&target, true).unwrap().is_some());
    }

    #[test]
    fn test_filter_skips_absent_keys() {
        let dir = TempDir::new().unwrap();
        let opts = Options::default();
        let table = build_table(&dir, &opts, 200);

        for i in 0..200 {
            assert!(table.may_contain(format!("key_{i:05}").as_bytes()));
        }
        let mut misses = 0;
        for i in 0..1000 {
            if !table.may_contain(format!("absent_{i}").as_bytes()) {
                misses += 1;
            }
        }
        assert!(misses > 900, "filter rejected only {misses}/1000 absent keys");
    }

    #[test]
    fn test_iterator_forward_and_backward() {
        let dir = TempDir::new().unwrap();
        let opts = Options::default().block_size(128);
        let table = build_table(&dir, &opts, 20);

        let mut iter = table.iter(true);
        iter.seek_to_first().unwrap();
        let mut forward = Vec::new();
        while iter.valid() {
            forward.push(ikey::user_key(iter.key()).to_vec());
            iter.next().unwrap();
        }
        assert_eq!(forward.len(), 20);
        assert!(forward.windows(2).all(|w| w[0] < w[1]));

        iter.seek_to_last().unwrap();
        let mut backward = Vec::new();
        while iter.valid() {
            backward.push(ikey::user_key(iter.key()).to_vec());
            iter.prev().unwrap();
        }
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_iterator_seek_lands_on_next_key() {
        let dir = TempDir::new().unwrap();
        let opts = Options::default().block_size(128);
        let table = build_table(&dir, &opts, 20);

        let mut iter = table.iter(true);
        iter.seek(&make_internal_key(b"key_00005x", 10, ValueKind::Value))
            .unwrap();
        assert!(iter.valid());
        assert_eq!(ikey::user_key(iter.key()), b"key_00006");
    }

    #[test]
    fn test_abandon_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000009.sst");
        let opts = Options::default();
        let mut builder = TableBuilder::create(&path, &opts).unwrap();
        builder
            .add(&make_internal_key(b"k", 1, ValueKind::Value), b"v")
            .unwrap();
        assert!(path.exists());
        builder.abandon().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_block_detected() {
        let dir = TempDir::new().unwrap();
        let opts = Options::default().compression(Compression::None);
        let path = dir.path().join("000001.sst");
        {
            let mut builder = TableBuilder::create(&path, &opts).unwrap();
            for i in 0..50 {
                let key =
                    make_internal_key(format!("key_{i:05}").as_bytes(), 7, ValueKind::Value);
                builder.add(&key, b"some value bytes").unwrap();
            }
            builder.finish().unwrap();
        }

        // Flip a byte inside the first data block.
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(20)).unwrap();
            file.write_all(&[0xff]).unwrap();
        }

        let table = Table::open(&path, 1, Arc::clone(&opts.comparator)).unwrap();
        let target = make_internal_key(b"key_00000", 10, ValueKind::Value);
        match table.get(&target, true) {
            Err(Error::Corruption(_)) => {}
            other => panic!("expected corruption, got {other:?}"),
        }
    }
}
