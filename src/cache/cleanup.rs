//! Cleanup coordinator
//!
//! Runs the eviction policy against the cache directory while holding the
//! cleanup lock. Passes are fired from the request path without being awaited,
//! so their outcome only ever reaches the logs.
//!
//! ```text
//! Idle -> LockAttempt -> Running -> Released -> Idle
//!                     \-> Rejected ------------> Idle
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::eviction::{self, EvictionPolicy, EvictionReport};
use super::lock::{LockAttempt, LockError, LockProvider};
use super::CacheStore;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to scan cache directory {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("eviction pass aborted: {0}")]
    Aborted(String),
}

/// Result of a single cleanup pass.
#[derive(Debug, Clone)]
pub enum CleanupOutcome {
    /// The lock was held and eviction ran.
    Completed(EvictionReport),
    /// Another owner holds the lock; this cycle was skipped.
    Rejected,
}

/// Runs eviction at most once at a time across processes sharing the cache.
pub struct CleanupCoordinator {
    store: CacheStore,
    lock: Arc<dyn LockProvider>,
    policy: EvictionPolicy,
    lock_ttl: Duration,
    /// Minimum spacing between passes fired by [trigger](Self::trigger).
    min_interval: Duration,
    last_triggered: Mutex<Option<Instant>>,
}

impl CleanupCoordinator {
    pub fn new(
        store: CacheStore,
        lock: Arc<dyn LockProvider>,
        policy: EvictionPolicy,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            lock,
            policy,
            lock_ttl,
            min_interval: Duration::ZERO,
            last_triggered: Mutex::new(None),
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Run one pass and wait for it.
    ///
    /// The lock is released after eviction whether it succeeded, failed or
    /// panicked. A rejected attempt leaves the other owner's marker alone.
    pub async fn run_once(&self) -> Result<CleanupOutcome, CleanupError> {
        if let LockAttempt::Rejected { held_for } = self.lock.try_acquire(self.lock_ttl).await? {
            debug!(
                held_for_ms = held_for.map(|d| d.as_millis() as u64),
                "Cache cleanup skipped, lock is held"
            );
            return Ok(CleanupOutcome::Rejected);
        }

        let store = self.store.clone();
        let policy = self.policy;
        let pass = tokio::spawn(async move { evict(&store, policy).await }).await;

        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "Failed to release cleanup lock");
        }

        match pass {
            Ok(result) => result.map(CleanupOutcome::Completed),
            Err(e) => Err(CleanupError::Aborted(e.to_string())),
        }
    }

    /// Fire a pass in the background without waiting for it.
    ///
    /// Returns `None` when a pass was already fired within the minimum
    /// interval.
    pub fn trigger(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        {
            let mut last = self.last_triggered.lock();
            let now = Instant::now();
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.min_interval {
                    return None;
                }
            }
            *last = Some(now);
        }

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            match this.run_once().await {
                Ok(CleanupOutcome::Completed(report)) => {
                    debug!(
                        scanned = report.scanned,
                        deleted = report.deleted,
                        bytes_freed = report.bytes_freed,
                        "Cache cleanup pass finished"
                    );
                }
                Ok(CleanupOutcome::Rejected) => {}
                Err(e) => warn!(error = %e, "Cache cleanup pass failed"),
            }
        }))
    }
}

async fn evict(store: &CacheStore, policy: EvictionPolicy) -> Result<EvictionReport, CleanupError> {
    let entries = store.entries().await.map_err(|source| CleanupError::Scan {
        path: store.dir().to_path_buf(),
        source,
    })?;

    let plan = policy.plan(&entries, SystemTime::now());
    if plan.is_empty() {
        debug!(entries = entries.len(), "Cache within limits, nothing to evict");
        return Ok(EvictionReport {
            scanned: entries.len(),
            ..Default::default()
        });
    }

    info!(
        entries = entries.len(),
        planned = plan.deletions.len(),
        retained_bytes = plan.retained_bytes,
        "Evicting cache entries"
    );
    Ok(eviction::execute(&plan, entries.len()).await)
}
