//! Advisory cleanup lock
//!
//! A single marker file per cache directory signals that some process is
//! running a cleanup pass. The marker's modification time is its creation
//! time: a marker younger than the TTL belongs to an active owner, an older one
//! is abandoned and may be reclaimed by anyone.
//!
//! The lock only coordinates processes on one host sharing a filesystem.
//! Eviction converges to the same end state when two passes race, so a reclaim
//! race between two parties is tolerated.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Errors from lock operations. Contention is not an error, see [LockAttempt].
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of [LockProvider::try_acquire].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// The caller now owns the lock and must [release](LockProvider::release) it.
    Acquired,
    /// Another owner is presumed active.
    Rejected {
        /// Age of the marker that caused the rejection, when known.
        held_for: Option<Duration>,
    },
}

impl LockAttempt {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAttempt::Acquired)
    }
}

/// TTL-based, non-blocking mutual exclusion over one named resource.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Try once to take the lock. A holder older than `ttl` is considered gone.
    async fn try_acquire(&self, ttl: Duration) -> Result<LockAttempt, LockError>;

    /// Give the lock up. Releasing a lock that is not held is a no-op.
    async fn release(&self) -> Result<(), LockError>;
}

/// [LockProvider] backed by an exclusively-created marker file.
#[derive(Debug, Clone)]
pub struct FileLockProvider {
    path: PathBuf,
}

impl FileLockProvider {
    /// Default marker file name inside the lock directory.
    pub const LOCK_FILENAME: &'static str = ".cleanup.lock";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock marker at [LOCK_FILENAME](Self::LOCK_FILENAME) inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(Self::LOCK_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Age of the current marker, `None` if there is none.
    async fn marker_age(&self) -> Result<Option<Duration>, LockError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => {
                let created = metadata.modified().map_err(|e| self.io_error(e))?;
                // A marker stamped in the future is treated as brand new
                let age = SystemTime::now()
                    .duration_since(created)
                    .unwrap_or(Duration::ZERO);
                Ok(Some(age))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

#[async_trait]
impl LockProvider for FileLockProvider {
    async fn try_acquire(&self, ttl: Duration) -> Result<LockAttempt, LockError> {
        if let Some(age) = self.marker_age().await? {
            if age < ttl {
                debug!(
                    lock = %self.path.display(),
                    age_ms = age.as_millis() as u64,
                    "Cleanup lock held by another owner"
                );
                return Ok(LockAttempt::Rejected {
                    held_for: Some(age),
                });
            }

            info!(
                lock = %self.path.display(),
                age_ms = age.as_millis() as u64,
                ttl_ms = ttl.as_millis() as u64,
                "Reclaiming stale cleanup lock"
            );
            // Another racer may have removed it already
            let _ = tokio::fs::remove_file(&self.path).await;
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(lock = %self.path.display(), "Lost race for cleanup lock");
                return Ok(LockAttempt::Rejected { held_for: None });
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let created_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();
        let marker = format!("{} {}\n", std::process::id(), created_ms);
        // The marker content is diagnostic only; ownership is already established
        if let Err(e) = file.write_all(marker.as_bytes()).await {
            debug!(lock = %self.path.display(), error = %e, "Failed to write lock marker");
        }

        debug!(lock = %self.path.display(), "Cleanup lock acquired");
        Ok(LockAttempt::Acquired)
    }

    async fn release(&self) -> Result<(), LockError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(lock = %self.path.display(), "Cleanup lock released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}
