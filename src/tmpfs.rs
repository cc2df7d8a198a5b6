//! Self-cleaning temp directories and files for tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let base = PathBuf::from("/tmp/guarddb_tests");
        fs::create_dir_all(&base)?;

        let unique_name = format!("test_{}_{}", std::process::id(), suffix());
        let path = base.join(unique_name);

        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir(&path)?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
        // Sibling directories created next to the main path (live backups).
        if let (Some(parent), Some(name)) = (self.path.parent(), self.path.file_name()) {
            let prefix = format!("{}-backup-", name.to_string_lossy());
            if let Ok(entries) = fs::read_dir(parent) {
                for entry in entries.flatten() {
                    if entry.file_name().to_string_lossy().starts_with(&prefix) {
                        let _ = fs::remove_dir_all(entry.path());
                    }
                }
            }
        }
    }
}

fn suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    nanos ^ COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9e3779b9)
}
