//! On-disk audio artifact cache
//!
//! - [key]: validated `(media id, format)` keys and their canonical file names
//! - [store]: lookups with access-time refresh and directory snapshots
//! - [eviction]: the age/size policy and its best-effort executor
//! - [lock]: the advisory, TTL-based cleanup lock
//! - [cleanup]: the coordinator that runs eviction under the lock

pub mod cleanup;
pub mod eviction;
pub mod key;
pub mod lock;
pub mod store;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use cleanup::{CleanupCoordinator, CleanupOutcome};
pub use eviction::{EvictionPlan, EvictionPolicy, EvictionReason, EvictionReport};
pub use key::{AudioFormat, CacheKey, MediaId};
pub use lock::{FileLockProvider, LockAttempt, LockError, LockProvider};
pub use store::{CacheEntry, CacheStats, CacheStore, CachedArtifact, Lookup};

/// Errors surfaced by the cache to the request path.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("cache I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}
