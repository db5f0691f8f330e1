//! Cross-process advisory lock for the sync critical section.
//!
//! Import and full export hold `.sync.lock` (an `fs2` exclusive file
//! lock) for the duration of the atomic sequence: snapshot, temp write,
//! rename, metadata update. The lock is cooperative; it coordinates
//! well-behaved processes sharing a workspace and protects nothing
//! against an adversary.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::SYNC_LOCK_FILE;
use crate::error::{BeadsError, Result};

/// RAII guard for the workspace sync lock. Dropping releases the lock;
/// the lock file itself stays behind.
#[derive(Debug)]
pub struct SyncLock {
    file: File,
    path: PathBuf,
}

impl SyncLock {
    /// Block until the workspace's sync lock is held.
    ///
    /// # Errors
    ///
    /// `Io` when the lock file cannot be created or locked.
    pub fn acquire(workspace_dir: &Path) -> Result<Self> {
        let path = workspace_dir.join(SYNC_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()?;
        debug!(path = %path.display(), "Sync lock acquired");
        Ok(Self { file, path })
    }

    /// Take the lock only if it is free.
    ///
    /// # Errors
    ///
    /// `Locked` when another process holds it; `Io` on filesystem
    /// failures.
    pub fn try_acquire(workspace_dir: &Path) -> Result<Self> {
        let path = workspace_dir.join(SYNC_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Sync lock acquired");
                Ok(Self { file, path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                Err(BeadsError::Locked {
                    context: format!("sync lock held elsewhere: {}", path.display()),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The lock file's location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %err, "Sync lock release failed");
        }
    }
}
