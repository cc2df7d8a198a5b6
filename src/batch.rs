//! Write batches.
//!
//! A batch is the unit of atomic commit and the payload of every WAL
//! record:
//!
//! ```text
//! +--------------+-----------+-----------------------------+
//! | sequence:u64 | count:u32 | tagged records              |
//! +--------------+-----------+-----------------------------+
//! ```
//!
//! Record kinds: `Put {key, value}`, `Delete {key}` and `Guard {level,
//! key}`. Guard records ride along with the writes that discovered them so
//! that crash recovery re-learns pending guards from the log; they do not
//! consume sequence numbers and are invisible to the memtable.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};
use crate::ikey::SeqNo;

const HEADER_LEN: usize = 12;

const RECORD_PUT: u8 = 0x01;
const RECORD_DELETE: u8 = 0x02;
const RECORD_GUARD: u8 = 0x03;

/// Callback target for [`WriteBatch::iterate`].
pub trait BatchVisitor {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, key: &[u8]) -> Result<()>;
    fn guard(&mut self, level: usize, key: &[u8]) -> Result<()> {
        let _ = (level, key);
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0u8; HEADER_LEN],
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.rep.push(RECORD_PUT);
        self.append_slice(key);
        self.append_slice(value);
        self.set_count(self.count() + 1);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.rep.push(RECORD_DELETE);
        self.append_slice(key);
        self.set_count(self.count() + 1);
    }

    /// Records a newly discovered guard key for `level`. Does not count
    /// toward the batch's sequence range.
    pub fn add_guard(&mut self, level: usize, key: &[u8]) {
        self.rep.push(RECORD_GUARD);
        self.rep
            .write_u32::<BigEndian>(level as u32)
            .expect("vec write");
        self.append_slice(key);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_LEN, 0);
    }

    /// Number of Put/Delete records.
    pub fn count(&self) -> u32 {
        u32::from_be_bytes(self.rep[8..12].try_into().expect("header"))
    }

    pub fn sequence(&self) -> SeqNo {
        u64::from_be_bytes(self.rep[..8].try_into().expect("header"))
    }

    pub fn set_sequence(&mut self, seq: SeqNo) {
        self.rep[..8].copy_from_slice(&seq.to_be_bytes());
    }

    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Appends all records of `other` to this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[HEADER_LEN..]);
    }

    /// The serialized form written to the WAL.
    pub fn encoded(&self) -> &[u8] {
        &self.rep
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::corruption("write batch header truncated"));
        }
        let batch = Self { rep: data.to_vec() };
        // Validate the record structure up front so later iteration at
        // apply time cannot fail halfway through a memtable insert.
        batch.iterate(&mut NullVisitor)?;
        Ok(batch)
    }

    /// Walks the records in insertion order, dispatching each to the
    /// visitor. Put/Delete records are visited in the order their sequence
    /// numbers are assigned.
    pub fn iterate<V: BatchVisitor + ?Sized>(&self, visitor: &mut V) -> Result<()> {
        let mut cursor = Cursor::new(&self.rep[HEADER_LEN..]);
        let mut visited = 0u32;
        loop {
            let tag = match cursor.read_u8() {
                Ok(tag) => tag,
                Err(_) => break,
            };
            match tag {
                RECORD_PUT => {
                    let key = read_slice(&mut cursor)?;
                    let value = read_slice(&mut cursor)?;
                    visitor.put(&key, &value)?;
                    visited += 1;
                }
                RECORD_DELETE => {
                    let key = read_slice(&mut cursor)?;
                    visitor.delete(&key)?;
                    visited += 1;
                }
                RECORD_GUARD => {
                    let level = cursor
                        .read_u32::<BigEndian>()
                        .map_err(|_| Error::corruption("guard record truncated"))?;
                    let key = read_slice(&mut cursor)?;
                    visitor.guard(level as usize, &key)?;
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown write batch record tag: {other}"
                    )))
                }
            }
        }
        if visited != self.count() {
            return Err(Error::Corruption(format!(
                "write batch count mismatch: header {} walked {visited}",
                self.count()
            )));
        }
        Ok(())
    }

    fn append_slice(&mut self, data: &[u8]) {
        self.rep
            .write_u32::<BigEndian>(data.len() as u32)
            .expect("vec write");
        self.rep.extend_from_slice(data);
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_be_bytes());
    }
}

fn read_slice(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| Error::corruption("write batch record truncated"))? as usize;
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| Error::corruption("write batch record truncated"))?;
    Ok(buf)
}

struct NullVisitor;

impl BatchVisitor for NullVisitor {
    fn put(&mut self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn delete(&mut self, _key: &[u8]) -> Result<()> {
        Ok(())
    }
}
