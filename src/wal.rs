//! Crash-safe record log.
//!
//! Both the write-ahead log and the manifest are sequences of framed
//! records in an append-only file:
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | payload          |crc32:u32  |
//! +-----------+------------------+-----------+
//! | 4 bytes   | variable length  | 4 bytes   |
//! +-----------+------------------+-----------+
//! ```
//!
//! Multi-byte integers are big-endian; the CRC32 (iSCSI polynomial) covers
//! the payload. For the WAL each payload is an encoded [`WriteBatch`];
//! for the manifest it is a `VersionEdit`.
//!
//! A reader distinguishes a clean end of log from a torn tail: running out
//! of bytes mid-record or failing the checksum surfaces as `Corruption`,
//! and the recovery path decides whether to drop the tail or fail,
//! depending on `paranoid_checks`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub struct LogWriter {
    writer: BufWriter<File>,
    file: File,
    path: PathBuf,
    number: u64,
}

impl LogWriter {
    /// Creates (or truncates) the log file at `path`.
    pub fn create(path: impl Into<PathBuf>, number: u64) -> Result<Self> {
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
            number,
        })
    }

    /// Opens an existing log for appending.
    pub fn append_to(path: impl Into<PathBuf>, number: u64) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            writer: BufWriter::new(file.try_clone()?),
            file,
            path,
            number,
        })
    }

    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let checksum = CRC32.checksum(payload);
        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_all(payload)?;
        self.writer.write_u32::<BigEndian>(checksum)?;
        Ok(())
    }

    /// Pushes buffered records to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct LogReader {
    reader: BufReader<File>,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .map_err(|_| Error::corruption("log record truncated"))?;

        let stored = self
            .reader
            .read_u32::<BigEndian>()
            .map_err(|_| Error::corruption("log record checksum truncated"))?;

        if CRC32.checksum(&payload) != stored {
            return Err(Error::corruption("log record checksum mismatch"));
        }

        Ok(Some(payload))
    }
}

impl Iterator for LogReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}
