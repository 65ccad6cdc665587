//! Advisory read lock coordinating with the provider that writes a buffer.
//!
//! The lock file lives in the lock directory and is named after the instance
//! id and surface. The provider takes it exclusively while it draws; we take
//! it shared only around the copy-out in a sync.

use crate::types::Target;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct ReadLock {
    file: File,
    path: PathBuf,
}

impl ReadLock {
    pub fn open(lock_dir: &Path, id: &str, target: Target) -> io::Result<Self> {
        let path = lock_path(lock_dir, id, target);
        let file = File::open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the writer releases its exclusive lock.
    pub fn acquire(&self) -> io::Result<LockGuard<'_>> {
        self.file.lock_shared()?;
        Ok(LockGuard { lock: self })
    }
}

/// Releases the shared lock on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a ReadLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.file.unlock() {
            tracing::warn!("unlock {}: {e}", self.lock.path.display());
        }
    }
}

pub(crate) fn lock_path(lock_dir: &Path, id: &str, target: Target) -> PathBuf {
    let name: String = id
        .chars()
        .map(|c| if c == '/' || c == ':' { '_' } else { c })
        .collect();
    lock_dir.join(format!("{}.{}.lock", name, target.prefix()))
}
