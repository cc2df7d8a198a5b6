//! Single-process ownership of a database directory.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Exclusive advisory lock on a directory's `LOCK` file.
///
/// Acquisition never blocks: a directory already locked by another
/// handle fails immediately. The lock rides on the open file handle and
/// is released by the OS when the holder drops; the `LOCK` file itself
/// stays behind so concurrent opens never race on unlinking it.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn lock(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Io(format!("open {}: {e}", path.display())))?;

        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let errno = std::io::Error::last_os_error();
            return Err(Error::Io(format!(
                "lock {} held by another handle: {errno}",
                path.display()
            )));
        }

        let mut lock = Self { file, path };
        lock.stamp_pid()?;
        Ok(lock)
    }

    /// Overwrites the file with the holder's pid for debugging. Runs
    /// only after the lock is held, so a previous holder's stamp is
    /// never clobbered while that holder is alive.
    fn stamp_pid(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file
            .write_all(format!("{}\n", std::process::id()).as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().expect("temp dir");
        let lock_path = dir.path().join("LOCK");

        let lock = FileLock::lock(&lock_path).expect("acquire lock");
        assert_eq!(lock.path(), lock_path.as_path());

        let content = std::fs::read_to_string(&lock_path).expect("read lock file");
        assert_eq!(content, format!("{}\n", std::process::id()));
    }

    #[test]
    fn test_double_lock_fails() {
        let dir = TempDir::new().expect("temp dir");
        let lock_path = dir.path().join("LOCK");

        let _held = FileLock::lock(&lock_path).expect("first lock");
        match FileLock::lock(&lock_path) {
            Err(Error::Io(msg)) => assert!(msg.contains("held")),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("second lock unexpectedly succeeded"),
        }
    }

    #[test]
    fn test_relock_after_drop() {
        let dir = TempDir::new().expect("temp dir");
        let lock_path = dir.path().join("LOCK");

        {
            let _lock = FileLock::lock(&lock_path).expect("first lock");
        }
        // The LOCK file survives, but the lock itself died with the
        // handle.
        assert!(lock_path.exists());
        let _lock = FileLock::lock(&lock_path).expect("relock after drop");
    }
}
