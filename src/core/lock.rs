/// Advisory lock for destructive flows
///
/// Backup, restore, migrate and upgrade take an exclusive `flock` on a file in
/// the backup directory. The lock is released when the guard is dropped, on
/// every exit path. A busy lock fails immediately instead of waiting.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::error::OpsError;
use crate::utils::LOCK_FILE;

pub struct BackupLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl BackupLock {
    /// Create `dir` if needed and lock `<dir>/.n8n-ops.lock`
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create backup directory {}", dir.display()))?;

        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!(path = %path.display(), "lock acquired");
                Ok(Self { _lock: lock, path })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(OpsError::precondition(
                "lock",
                "another backup, restore or upgrade is already running",
            )
            .with_hint(format!(
                "Wait for it to finish. If no n8n-ops process is running, remove {}",
                path.display()
            ))
            .into()),
            Err((_, errno)) => {
                Err(anyhow::Error::new(errno).context(format!("Failed to lock {}", path.display())))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "lock released");
    }
}
