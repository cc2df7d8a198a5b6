//! Change-log replay.
//!
//! A replay timestamp is an opaque 16-byte token packing the sequence
//! number and WAL number current at capture time. Opening a replay
//! iterator at a timestamp re-reads the retained WAL segments from that
//! point and yields every later operation in commit order: puts carry
//! their value, deletions surface as valueless records. While an
//! iterator is outstanding the engine suspends deletion of the WAL
//! segments it may still need.

use byteorder::{ByteOrder, LittleEndian};

use crate::batch::{BatchVisitor, WriteBatch};
use crate::error::{Error, Result};
use crate::ikey::SeqNo;
use crate::wal::LogReader;

pub const TIMESTAMP_LEN: usize = 16;

pub fn encode_timestamp(seq: SeqNo, log_number: u64) -> Vec<u8> {
    let mut buf = vec![0u8; TIMESTAMP_LEN];
    LittleEndian::write_u64(&mut buf[..8], seq);
    LittleEndian::write_u64(&mut buf[8..], log_number);
    buf
}

pub fn decode_timestamp(ts: &[u8]) -> Result<(SeqNo, u64)> {
    if ts.len() != TIMESTAMP_LEN {
        return Err(Error::InvalidArgument(format!(
            "replay timestamp must be {TIMESTAMP_LEN} bytes, got {}",
            ts.len()
        )));
    }
    Ok((
        LittleEndian::read_u64(&ts[..8]),
        LittleEndian::read_u64(&ts[8..]),
    ))
}

pub fn validate_timestamp(ts: &[u8]) -> bool {
    decode_timestamp(ts).is_ok()
}

/// Orders two timestamps by capture time.
pub fn compare_timestamps(lhs: &[u8], rhs: &[u8]) -> Result<std::cmp::Ordering> {
    let (lseq, _) = decode_timestamp(lhs)?;
    let (rseq, _) = decode_timestamp(rhs)?;
    Ok(lseq.cmp(&rseq))
}

/// One replayed operation. `value` is `None` for a deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub seq: SeqNo,
}

/// Collects a batch's operations with their assigned sequences.
struct EntryCollector<'a> {
    next_seq: SeqNo,
    floor: SeqNo,
    out: &'a mut Vec<ReplayEntry>,
}

impl BatchVisitor for EntryCollector<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        if seq >= self.floor {
            self.out.push(ReplayEntry {
                key: key.to_vec(),
                value: Some(value.to_vec()),
                seq,
            });
        }
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        if seq >= self.floor {
            self.out.push(ReplayEntry {
                key: key.to_vec(),
                value: None,
                seq,
            });
        }
        Ok(())
    }
}

/// Reads one WAL segment, keeping operations with `seq >= floor`. A torn
/// tail ends the segment quietly; everything before it is returned.
pub fn read_log_entries(
    path: &std::path::Path,
    floor: SeqNo,
    out: &mut Vec<ReplayEntry>,
) -> Result<()> {
    let reader = LogReader::open(path)?;
    for record in reader {
        let record = match record {
            Ok(record) => record,
            Err(Error::Corruption(msg)) => {
                tracing::warn!(path = %path.display(), %msg, "replay stopped at torn log tail");
                break;
            }
            Err(e) => return Err(e),
        };
        let batch = WriteBatch::decode(&record)?;
        let mut collector = EntryCollector {
            next_seq: batch.sequence(),
            floor,
            out,
        };
        batch.iterate(&mut collector)?;
    }
    Ok(())
}

/// Iterator over the operations committed at or after a timestamp.
pub struct ReplayIterator {
    pub(crate) id: u64,
    entries: Vec<ReplayEntry>,
    pos: usize,
}

impl ReplayIterator {
    pub(crate) fn new(id: u64, entries: Vec<ReplayEntry>) -> Self {
        Self {
            id,
            entries,
            pos: 0,
        }
    }

    pub fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    pub fn next(&mut self) {
        if self.valid() {
            self.pos += 1;
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.entries[self.pos].key
    }

    /// `true` when the current record carries a value (a put); `false`
    /// for a deletion.
    pub fn has_value(&self) -> bool {
        self.entries[self.pos].value.is_some()
    }

    pub fn value(&self) -> &[u8] {
        self.entries[self.pos]
            .value
            .as_deref()
            .unwrap_or_default()
    }

    pub fn sequence(&self) -> SeqNo {
        self.entries[self.pos].seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use crate::wal::LogWriter;

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = encode_timestamp(123, 45);
        assert_eq!(ts.len(), TIMESTAMP_LEN);
        assert!(validate_timestamp(&ts));
        assert_eq!(decode_timestamp(&ts).unwrap(), (123, 45));
    }

    #[test]
    fn test_invalid_timestamp() {
        assert!(!validate_timestamp(b"short"));
        assert!(compare_timestamps(b"bad", &encode_timestamp(1, 1)).is_err());
    }

    #[test]
    fn test_compare_timestamps_by_sequence() {
        let older = encode_timestamp(5, 9);
        let newer = encode_timestamp(8, 2);
        assert_eq!(
            compare_timestamps(&older, &newer).unwrap(),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            compare_timestamps(&newer, &older).unwrap(),
            std::cmp::Ordering::Greater
        );
        assert_eq!(
            compare_timestamps(&older, &older).unwrap(),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn test_read_log_entries_with_floor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000001.log");

        let mut writer = LogWriter::create(&path, 1).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"a");
        batch.set_sequence(10);
        writer.add_record(batch.encoded()).unwrap();
        writer.sync().unwrap();

        let mut all = Vec::new();
        read_log_entries(&path, 0, &mut all).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].seq, 10);
        assert_eq!(all[2], ReplayEntry { key: b"a".to_vec(), value: None, seq: 12 });

        let mut later = Vec::new();
        read_log_entries(&path, 12, &mut later).unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].key, b"a");
        assert!(later[0].value.is_none());
    }

    #[test]
    fn test_iterator_walk() {
        let entries = vec![
            ReplayEntry { key: b"k".to_vec(), value: Some(b"v".to_vec()), seq: 1 },
            ReplayEntry { key: b"k".to_vec(), value: None, seq: 2 },
        ];
        let mut iter = ReplayIterator::new(7, entries);

        assert!(iter.valid());
        assert_eq!(iter.key(), b"k");
        assert!(iter.has_value());
        assert_eq!(iter.value(), b"v");

        iter.next();
        assert!(iter.valid());
        assert!(!iter.has_value());
        assert_eq!(iter.sequence(), 2);

        iter.next();
        assert!(!iter.valid());
    }
}
