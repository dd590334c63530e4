//! Cache eviction policy.
//!
//! Planning is a pure function of a directory snapshot and the clock:
//!
//! 1. **Age**: every entry whose access time is older than `max_age` expires.
//! 2. **Size**: if the surviving entries still exceed `max_size_bytes`, the
//!    least recently accessed ones are dropped until the total fits.
//!
//! Executing a plan is best-effort: each deletion is independent, and a failure
//! is recorded in the [EvictionReport] without stopping the rest.

use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::CacheEntry;

/// Age and size limits of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Entries not accessed for longer than this are purged. Zero purges everything.
    pub max_age: Duration,
    /// Upper bound on the total size of retained entries.
    pub max_size_bytes: u64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_size_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Expired,
    OverBudget,
}

/// One file the policy decided to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDeletion {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

/// Output of [EvictionPolicy::plan].
#[derive(Debug, Clone, Default)]
pub struct EvictionPlan {
    pub deletions: Vec<PlannedDeletion>,
    /// Total size of the entries the plan keeps.
    pub retained_bytes: u64,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
    }
}

/// Outcome of executing a plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionReport {
    pub scanned: usize,
    pub deleted: usize,
    pub bytes_freed: u64,
    /// Per-entry failures; never fatal.
    pub errors: Vec<String>,
}

impl EvictionPolicy {
    /// Decide which entries to delete at time `now`.
    pub fn plan(&self, entries: &[CacheEntry], now: SystemTime) -> EvictionPlan {
        let mut deletions = Vec::new();
        let mut remaining: Vec<&CacheEntry> = Vec::with_capacity(entries.len());

        for entry in entries {
            if self.is_expired(entry, now) {
                deletions.push(PlannedDeletion {
                    path: entry.path.clone(),
                    size_bytes: entry.size_bytes,
                    reason: EvictionReason::Expired,
                });
            } else {
                remaining.push(entry);
            }
        }

        let mut total: u64 = remaining.iter().map(|e| e.size_bytes).sum();
        if total > self.max_size_bytes {
            remaining.sort_by(|a, b| {
                a.access_time()
                    .cmp(&b.access_time())
                    .then_with(|| a.path.cmp(&b.path))
            });

            let mut kept = Vec::with_capacity(remaining.len());
            for entry in remaining {
                if total > self.max_size_bytes {
                    total -= entry.size_bytes;
                    deletions.push(PlannedDeletion {
                        path: entry.path.clone(),
                        size_bytes: entry.size_bytes,
                        reason: EvictionReason::OverBudget,
                    });
                } else {
                    kept.push(entry);
                }
            }
            remaining = kept;
        }

        EvictionPlan {
            deletions,
            retained_bytes: remaining.iter().map(|e| e.size_bytes).sum(),
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: SystemTime) -> bool {
        if self.max_age.is_zero() {
            return true;
        }
        // Access times ahead of the clock count as fresh
        let age = now
            .duration_since(entry.access_time())
            .unwrap_or(Duration::ZERO);
        age > self.max_age
    }
}

/// Delete every file in `plan`, continuing past individual failures.
pub async fn execute(plan: &EvictionPlan, scanned: usize) -> EvictionReport {
    let mut report = EvictionReport {
        scanned,
        ..Default::default()
    };

    for deletion in &plan.deletions {
        match tokio::fs::remove_file(&deletion.path).await {
            Ok(()) => {
                debug!(
                    path = %deletion.path.display(),
                    size_bytes = deletion.size_bytes,
                    reason = ?deletion.reason,
                    "Evicted cache entry"
                );
                report.deleted += 1;
                report.bytes_freed += deletion.size_bytes;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Another process got there first; the end state is the same
                debug!(path = %deletion.path.display(), "Cache entry already removed");
                report.deleted += 1;
            }
            Err(e) => {
                warn!(
                    path = %deletion.path.display(),
                    error = %e,
                    "Failed to delete cache entry during eviction"
                );
                report
                    .errors
                    .push(format!("{}: {}", deletion.path.display(), e));
            }
        }
    }

    if report.deleted > 0 || !report.errors.is_empty() {
        info!(
            scanned = report.scanned,
            deleted = report.deleted,
            bytes_freed = report.bytes_freed,
            retained_bytes = plan.retained_bytes,
            failures = report.errors.len(),
            "Cache eviction complete"
        );
    }

    report
}
