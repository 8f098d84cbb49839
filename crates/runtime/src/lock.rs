//! Pass serialization.
//!
//! Every pass that reads and rewrites the canonical document or the pending
//! store takes an advisory exclusive lock first.  The atomic temp-and-rename
//! writes in the memory crate prevent torn files, but only this lock
//! prevents two concurrent passes from losing each other's updates during a
//! read-modify-write cycle.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tracing::debug;

/// Held for the duration of a pass; released on drop.
#[derive(Debug)]
pub struct PassLock {
    file: File,
    path: PathBuf,
}

impl PassLock {
    /// Acquire the lock, failing immediately when another pass holds it.
    /// Blocking here would just queue passes behind each other; the external
    /// scheduler retries on its own cadence, so aborting is cleaner.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory for {}", path.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            bail!("another pass holds the lock at {}", path.display());
        }

        debug!(path = %path.display(), "pass lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PassLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "pass lock released");
    }
}
