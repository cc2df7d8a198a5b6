//! Table data blocks.
//!
//! A block is a run of prefix-compressed entries followed by a restart
//! array:
//!
//! ```text
//! +------------+--------------+-------+-------+
//! |shared:u32  | unshared:u32 |vlen:u32| key suffix | value |   ... per entry
//! +------------+--------------+-------+-------+
//! | restart positions: u32 * n | n:u32 |
//! +----------------------------+-------+
//! ```
//!
//! Every `restart_interval` entries the full key is written (shared = 0).
//! Readers decode a block into its entry list on load; blocks are small
//! (one `block_size` unit), and a decoded block makes backward iteration
//! over the table trivial.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::config::Comparator;
use crate::error::{Error, Result};
use crate::ikey;

pub struct BlockBuilder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    restart_interval: usize,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            restart_interval: restart_interval.max(1),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.entry_count % self.restart_interval == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_len(&self.last_key, key)
        };
        let unshared = key.len() - shared;

        self.buffer
            .write_u32::<BigEndian>(shared as u32)
            .expect("vec write");
        self.buffer
            .write_u32::<BigEndian>(unshared as u32)
            .expect("vec write");
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .expect("vec write");
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).expect("vec write");
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .expect("vec write");
        self.buffer
    }

    /// Bytes the finished block will occupy, restart array included.
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restart_positions.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(x, y)| x == y).count()
}

/// A decoded block: its entries in ascending internal-key order.
pub struct Block {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Block {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("block too short"));
        }
        let num_restarts_offset = data.len() - 4;
        let num_restarts =
            Cursor::new(&data[num_restarts_offset..]).read_u32::<BigEndian>()? as usize;
        let restart_bytes = num_restarts * 4;
        if num_restarts_offset < restart_bytes {
            return Err(Error::corruption("block restart array out of bounds"));
        }
        let entries_end = num_restarts_offset - restart_bytes;

        let mut entries = Vec::new();
        let mut last_key: Vec<u8> = Vec::new();
        let mut pos = 0usize;
        let body = &data[..entries_end];
        while pos < body.len() {
            let mut cursor = Cursor::new(&body[pos..]);
            let shared = cursor.read_u32::<BigEndian>()? as usize;
            let unshared = cursor.read_u32::<BigEndian>()? as usize;
            let vlen = cursor.read_u32::<BigEndian>()? as usize;
            pos += 12;

            if shared > last_key.len() || pos + unshared + vlen > body.len() {
                return Err(Error::corruption("block entry out of bounds"));
            }

            let mut key = Vec::with_capacity(shared + unshared);
            key.extend_from_slice(&last_key[..shared]);
            key.extend_from_slice(&body[pos..pos + unshared]);
            pos += unshared;

            let value = body[pos..pos + vlen].to_vec();
            pos += vlen;

            last_key = key.clone();
            entries.push((key, value));
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the first entry whose internal key is >= `target`.
    pub fn seek(&self, cmp: &dyn Comparator, target: &[u8]) -> usize {
        self.entries.partition_point(|(key, _)| {
            ikey::compare_internal(cmp, key, target) == std::cmp::Ordering::Less
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BytewiseComparator;
    use crate::ikey::{make_internal_key, ValueKind};

    fn build(entries: &[(&[u8], u64, &[u8])], restart_interval: usize) -> Block {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, seq, value) in entries {
            builder.add(&make_internal_key(key, *seq, ValueKind::Value), value);
        }
        Block::decode(&builder.finish()).expect("decode")
    }

    #[test]
    fn test_roundtrip_with_prefix_compression() {
        let entries: Vec<(&[u8], u64, &[u8])> = vec![
            (b"apple", 3, b"fruit"),
            (b"application", 2, b"software"),
            (b"banana", 1, b"fruit"),
        ];
        for interval in [1, 2, 16] {
            let block = build(&entries, interval);
            assert_eq!(block.len(), 3);
            for (i, (key, seq, value)) in entries.iter().enumerate() {
                let (got_key, got_value) = &block.entries()[i];
                assert_eq!(got_key, &make_internal_key(key, *seq, ValueKind::Value));
                assert_eq!(got_value, &value.to_vec());
            }
        }
    }

    #[test]
    fn test_seek() {
        let cmp = BytewiseComparator;
        let block = build(
            &[(b"b", 5, b"1"), (b"d", 5, b"2"), (b"f", 5, b"3")],
            2,
        );

        let at = |key: &[u8], seq| make_internal_key(key, seq, ValueKind::Value);
        assert_eq!(block.seek(&cmp, &at(b"a", 9)), 0);
        assert_eq!(block.seek(&cmp, &at(b"b", 9)), 0);
        // Seeking below the stored sequence passes the stored entry.
        assert_eq!(block.seek(&cmp, &at(b"b", 3)), 1);
        assert_eq!(block.seek(&cmp, &at(b"c", 9)), 1);
        assert_eq!(block.seek(&cmp, &at(b"f", 5)), 2);
        assert_eq!(block.seek(&cmp, &at(b"g", 9)), 3);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Block::decode(&[1, 2]).is_err());
        assert!(Block::decode(&[0xff; 32]).is_err());
    }

    #[test]
    fn test_size_estimate_tracks_finish() {
        let mut builder = BlockBuilder::new(4);
        builder.add(&make_internal_key(b"k", 1, ValueKind::Value), b"v");
        let estimate = builder.size_estimate();
        let finished = builder.finish();
        assert_eq!(estimate, finished.len());
    }
}
