//! Audio service: serves artifacts from the cache and fills misses.
//!
//! A miss fires a background cleanup pass and runs a download job, which the
//! request waits for. Jobs run on their own task, so a client going away does
//! not abort a download that is already under way.

use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{
    CacheError, CacheKey, CacheStore, CleanupCoordinator, FileLockProvider, Lookup,
};
use crate::config::Config;
use crate::download::{DownloadError, DownloadPipeline, InflightDownloads};

/// Failures of [AudioService::fetch].
#[derive(Debug, Error)]
pub enum AudioError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// A cached artifact ready to be served.
#[derive(Debug, Clone)]
pub struct AudioArtifact {
    pub key: CacheKey,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl AudioArtifact {
    pub fn content_type(&self) -> &'static str {
        self.key.format.content_type()
    }

    /// `{media_id}.{ext}`, the name offered to clients.
    pub fn file_name(&self) -> String {
        self.key.file_name()
    }
}

pub struct AudioService {
    store: CacheStore,
    cleanup: Arc<CleanupCoordinator>,
    pipeline: Arc<DownloadPipeline>,
    /// Present when concurrent downloads of one key are coalesced.
    inflight: Option<InflightDownloads>,
}

impl AudioService {
    pub fn new(
        store: CacheStore,
        cleanup: Arc<CleanupCoordinator>,
        pipeline: Arc<DownloadPipeline>,
        inflight: Option<InflightDownloads>,
    ) -> Self {
        Self {
            store,
            cleanup,
            pipeline,
            inflight,
        }
    }

    /// Wire every component from the application configuration.
    pub fn from_config(config: &Config) -> Self {
        let store = CacheStore::new(&config.cache_dir);
        let lock = FileLockProvider::in_dir(&config.lock_dir);
        let cleanup = CleanupCoordinator::new(
            store.clone(),
            Arc::new(lock),
            config.eviction_policy(),
            config.lock_ttl,
        )
        .with_min_interval(config.cleanup_min_interval);
        let pipeline = DownloadPipeline::new(config.download_config());
        let inflight = config.download_coalesce.then(InflightDownloads::new);

        Self::new(store, Arc::new(cleanup), Arc::new(pipeline), inflight)
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn cleanup(&self) -> &Arc<CleanupCoordinator> {
        &self.cleanup
    }

    /// Serve `key` from the cache, downloading it first on a miss.
    pub async fn fetch(&self, key: &CacheKey) -> Result<AudioArtifact, AudioError> {
        if let Lookup::Hit(hit) = self.store.lookup(key).await? {
            return Ok(AudioArtifact {
                key: key.clone(),
                path: hit.path,
                bytes: hit.bytes,
            });
        }

        // Opportunistic, never awaited here
        self.cleanup.trigger();

        let path = self.download(key).await?;
        debug!(key = %key, path = %path.display(), "Download ready, serving from cache");

        match self.store.lookup(key).await? {
            Lookup::Hit(hit) => Ok(AudioArtifact {
                key: key.clone(),
                path: hit.path,
                bytes: hit.bytes,
            }),
            // Evicted or replaced between finalize and read
            Lookup::Miss => Err(CacheError::io(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "artifact disappeared after download",
                ),
            )
            .into()),
        }
    }

    async fn download(&self, key: &CacheKey) -> Result<PathBuf, DownloadError> {
        let pipeline = Arc::clone(&self.pipeline);
        let job = pipeline.job(key, self.store.canonical_path(key));
        info!(job_id = %job.id, key = %key, "Cache miss, downloading");
        let start = move || async move { pipeline.run(job).await }.boxed();

        match &self.inflight {
            Some(inflight) => inflight.run(key, start).await,
            None => tokio::spawn(start())
                .await
                .unwrap_or_else(|e| Err(DownloadError::Aborted(e.to_string()))),
        }
    }
}
