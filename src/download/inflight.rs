//! Per-key coalescing of concurrent downloads.
//!
//! When enabled, a request for a key that is already downloading waits for
//! the running job instead of spawning a second one. This only covers one
//! process; other processes sharing the cache directory may still race.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use super::DownloadError;
use crate::cache::CacheKey;

type JobResult = Result<PathBuf, DownloadError>;
type SharedJob = Shared<BoxFuture<'static, JobResult>>;

/// In-flight download jobs keyed by cache key.
#[derive(Clone, Default)]
pub struct InflightDownloads {
    jobs: Arc<Mutex<HashMap<CacheKey, (u64, SharedJob)>>>,
    next_id: Arc<AtomicU64>,
}

impl InflightDownloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently running.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join the job running for `key`, or start one with `start`.
    ///
    /// Started jobs run on their own task, so they finish even if every
    /// waiter goes away. The entry is removed when the job completes.
    pub async fn run<F>(&self, key: &CacheKey, start: F) -> JobResult
    where
        F: FnOnce() -> BoxFuture<'static, JobResult>,
    {
        let job = {
            let mut jobs = self.jobs.lock();
            match jobs.get(key) {
                Some((_, job)) => {
                    debug!(key = %key, "Joining in-flight download");
                    job.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let job = self.spawn(key.clone(), id, start());
                    jobs.insert(key.clone(), (id, job.clone()));
                    job
                }
            }
        };

        job.await
    }

    fn spawn(&self, key: CacheKey, id: u64, work: BoxFuture<'static, JobResult>) -> SharedJob {
        let jobs = Arc::clone(&self.jobs);
        let handle = tokio::spawn(async move {
            let result = work.await;
            let mut jobs = jobs.lock();
            if jobs.get(&key).is_some_and(|(current, _)| *current == id) {
                jobs.remove(&key);
            }
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(DownloadError::Aborted(e.to_string())))
        }
        .boxed()
        .shared()
    }
}
