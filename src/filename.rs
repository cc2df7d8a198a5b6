//! Database file naming.
//!
//! A database directory contains:
//!
//! ```text
//! CURRENT        one line naming the active manifest
//! MANIFEST-<n>   log of version edits
//! <n>.log        write-ahead log
//! <n>.sst        immutable sorted table
//! LOCK           single-process ownership sentinel
//! LOG, LOG.old   info log of a previous build; recognized for cleanup only
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log(u64),
    Table(u64),
    Manifest(u64),
    Current,
    Lock,
    InfoLog,
}

pub fn log_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.log", number))
}

pub fn table_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", number))
}

pub fn manifest_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{:06}", number))
}

pub fn current_file(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_file(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

/// Classifies a file name within a database directory. Returns `None` for
/// names the engine does not own.
pub fn parse_file_name(name: &str) -> Option<FileType> {
    match name {
        "CURRENT" => return Some(FileType::Current),
        "LOCK" => return Some(FileType::Lock),
        "LOG" | "LOG.old" => return Some(FileType::InfoLog),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return rest.parse().ok().map(FileType::Manifest);
    }
    if let Some(stem) = name.strip_suffix(".log") {
        return stem.parse().ok().map(FileType::Log);
    }
    if let Some(stem) = name.strip_suffix(".sst") {
        return stem.parse().ok().map(FileType::Table);
    }
    None
}

/// Points `CURRENT` at `MANIFEST-<manifest_number>`. Written to a temp file
/// first and renamed into place so readers never observe a partial write.
pub fn set_current_file(dir: &Path, manifest_number: u64) -> Result<()> {
    let tmp = dir.join(format!("CURRENT.{:06}.dbtmp", manifest_number));
    let contents = format!("MANIFEST-{:06}\n", manifest_number);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, current_file(dir))?;
    Ok(())
}

/// Reads `CURRENT` and returns the active manifest number.
pub fn read_current_file(dir: &Path) -> Result<u64> {
    let contents = fs::read_to_string(current_file(dir))
        .map_err(|e| Error::Corruption(format!("CURRENT unreadable: {e}")))?;
    let name = contents
        .strip_suffix('\n')
        .ok_or_else(|| Error::corruption("CURRENT not newline terminated"))?;
    match parse_file_name(name) {
        Some(FileType::Manifest(n)) => Ok(n),
        _ => Err(Error::Corruption(format!(
            "CURRENT names unexpected file: {name:?}"
        ))),
    }
}
