//! Manifest records.
//!
//! A `VersionEdit` is one delta to the file catalog: files added and
//! removed, guards learned, counters advanced. Each edit is serialized as
//! a sequence of tagged fields, every field optional, so old readers skip
//! nothing and new fields can be added behind fresh tags. Replaying a
//! manifest's edits in order reconstructs the catalog.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};
use crate::ikey::SeqNo;
use crate::version::FileMeta;

const TAG_COMPARATOR: u8 = 0x01;
const TAG_LOG_NUMBER: u8 = 0x02;
const TAG_PREV_LOG_NUMBER: u8 = 0x03;
const TAG_NEXT_FILE_NUMBER: u8 = 0x04;
const TAG_LAST_SEQUENCE: u8 = 0x05;
const TAG_COMPACTION_POINTER: u8 = 0x06;
const TAG_DELETED_FILE: u8 = 0x07;
const TAG_NEW_FILE: u8 = 0x08;
const TAG_NEW_GUARD: u8 = 0x09;
const TAG_FILE_FILTER: u8 = 0x0a;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SeqNo>,
    pub compaction_pointers: Vec<(usize, Vec<u8>)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, FileMeta)>,
    pub new_guards: Vec<(usize, Vec<u8>)>,
    pub file_filters: Vec<(u64, Vec<u8>)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, level: usize, meta: FileMeta) {
        self.new_files.push((level, meta));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn add_guard(&mut self, level: usize, key: Vec<u8>) {
        self.new_guards.push((level, key));
    }

    pub fn add_file_filter(&mut self, number: u64, filter: Vec<u8>) {
        if !filter.is_empty() {
            self.file_filters.push((number, filter));
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        if let Some(name) = &self.comparator_name {
            buf.push(TAG_COMPARATOR);
            write_slice(&mut buf, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            buf.push(TAG_LOG_NUMBER);
            buf.write_u64::<BigEndian>(n).expect("vec write");
        }
        if let Some(n) = self.prev_log_number {
            buf.push(TAG_PREV_LOG_NUMBER);
            buf.write_u64::<BigEndian>(n).expect("vec write");
        }
        if let Some(n) = self.next_file_number {
            buf.push(TAG_NEXT_FILE_NUMBER);
            buf.write_u64::<BigEndian>(n).expect("vec write");
        }
        if let Some(n) = self.last_sequence {
            buf.push(TAG_LAST_SEQUENCE);
            buf.write_u64::<BigEndian>(n).expect("vec write");
        }
        for (level, key) in &self.compaction_pointers {
            buf.push(TAG_COMPACTION_POINTER);
            buf.write_u32::<BigEndian>(*level as u32).expect("vec write");
            write_slice(&mut buf, key);
        }
        for (level, number) in &self.deleted_files {
            buf.push(TAG_DELETED_FILE);
            buf.write_u32::<BigEndian>(*level as u32).expect("vec write");
            buf.write_u64::<BigEndian>(*number).expect("vec write");
        }
        for (level, meta) in &self.new_files {
            buf.push(TAG_NEW_FILE);
            buf.write_u32::<BigEndian>(*level as u32).expect("vec write");
            buf.write_u64::<BigEndian>(meta.number).expect("vec write");
            buf.write_u64::<BigEndian>(meta.file_size).expect("vec write");
            write_slice(&mut buf, &meta.smallest);
            write_slice(&mut buf, &meta.largest);
        }
        for (level, key) in &self.new_guards {
            buf.push(TAG_NEW_GUARD);
            buf.write_u32::<BigEndian>(*level as u32).expect("vec write");
            write_slice(&mut buf, key);
        }
        for (number, filter) in &self.file_filters {
            buf.push(TAG_FILE_FILTER);
            buf.write_u64::<BigEndian>(*number).expect("vec write");
            write_slice(&mut buf, filter);
        }

        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::new();
        let mut cursor = Cursor::new(data);

        loop {
            let tag = match cursor.read_u8() {
                Ok(tag) => tag,
                Err(_) => break,
            };
            match tag {
                TAG_COMPARATOR => {
                    let bytes = read_slice(&mut cursor)?;
                    let name = String::from_utf8(bytes)
                        .map_err(|_| Error::corruption("comparator name not utf-8"))?;
                    edit.comparator_name = Some(name);
                }
                TAG_LOG_NUMBER => edit.log_number = Some(read_u64(&mut cursor)?),
                TAG_PREV_LOG_NUMBER => edit.prev_log_number = Some(read_u64(&mut cursor)?),
                TAG_NEXT_FILE_NUMBER => edit.next_file_number = Some(read_u64(&mut cursor)?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(read_u64(&mut cursor)?),
                TAG_COMPACTION_POINTER => {
                    let level = read_u32(&mut cursor)? as usize;
                    let key = read_slice(&mut cursor)?;
                    edit.compaction_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = read_u32(&mut cursor)? as usize;
                    let number = read_u64(&mut cursor)?;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let level = read_u32(&mut cursor)? as usize;
                    let number = read_u64(&mut cursor)?;
                    let file_size = read_u64(&mut cursor)?;
                    let smallest = read_slice(&mut cursor)?;
                    let largest = read_slice(&mut cursor)?;
                    edit.new_files.push((
                        level,
                        FileMeta {
                            number,
                            file_size,
                            smallest,
                            largest,
                        },
                    ));
                }
                TAG_NEW_GUARD => {
                    let level = read_u32(&mut cursor)? as usize;
                    let key = read_slice(&mut cursor)?;
                    edit.new_guards.push((level, key));
                }
                TAG_FILE_FILTER => {
                    let number = read_u64(&mut cursor)?;
                    let filter = read_slice(&mut cursor)?;
                    edit.file_filters.push((number, filter));
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown version edit tag: {other}"
                    )))
                }
            }
        }

        Ok(edit)
    }
}

fn write_slice(buf: &mut Vec<u8>, data: &[u8]) {
    buf.write_u32::<BigEndian>(data.len() as u32).expect("vec write");
    buf.extend_from_slice(data);
}

fn read_slice(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = read_u32(cursor)? as usize;
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| Error::corruption("version edit field truncated"))?;
    Ok(buf)
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor
        .read_u32::<BigEndian>()
        .map_err(|_| Error::corruption("version edit field truncated"))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    cursor
        .read_u64::<BigEndian>()
        .map_err(|_| Error::corruption("version edit field truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikey::{make_internal_key, ValueKind};

    fn sample_meta(number: u64) -> FileMeta {
        FileMeta {
            number,
            file_size: 4096,
            smallest: make_internal_key(b"a", 3, ValueKind::Value),
            largest: make_internal_key(b"z", 1, ValueKind::Value),
        }
    }

    #[test]
    fn test_empty_roundtrip() {
        let edit = VersionEdit::new();
        assert_eq!(VersionEdit::decode(&edit.encode()).unwrap(), edit);
    }

    #[test]
    fn test_full_roundtrip() {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some("guarddb.BytewiseComparator".to_string());
        edit.log_number = Some(9);
        edit.prev_log_number = Some(8);
        edit.next_file_number = Some(42);
        edit.last_sequence = Some(100_000);
        edit.compaction_pointers
            .push((2, make_internal_key(b"ptr", 5, ValueKind::Value)));
        edit.delete_file(1, 7);
        edit.add_file(0, sample_meta(10));
        edit.add_file(1, sample_meta(11));
        edit.add_guard(0, b"guard-key".to_vec());
        edit.add_guard(3, b"deeper-guard".to_vec());
        edit.add_file_filter(10, vec![0xde, 0xad, 0xbe, 0xef]);

        assert_eq!(VersionEdit::decode(&edit.encode()).unwrap(), edit);
    }

    #[test]
    fn test_empty_filter_not_recorded() {
        let mut edit = VersionEdit::new();
        edit.add_file_filter(10, Vec::new());
        assert!(edit.file_filters.is_empty());
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        let mut bytes = VersionEdit::new().encode();
        bytes.push(0x7f);
        assert!(VersionEdit::decode(&bytes).is_err());
    }

    #[test]
    fn test_truncated_field_is_corruption() {
        let mut edit = VersionEdit::new();
        edit.add_file(0, sample_meta(10));
        let bytes = edit.encode();
        assert!(VersionEdit::decode(&bytes[..bytes.len() - 4]).is_err());
    }
}
