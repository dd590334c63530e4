//! Cache store: maps keys to files and serves hits.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use serde::Serialize;
use tracing::{debug, warn};

use super::{CacheError, CacheKey};

/// Suffixes downloaders use for files that are still being written.
const IN_PROGRESS_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp", ".tmp"];

/// Whether a file name belongs to a download that has not finished yet.
pub(crate) fn is_in_progress(file_name: &str) -> bool {
    IN_PROGRESS_SUFFIXES
        .iter()
        .any(|suffix| file_name.ends_with(suffix))
        || file_name.contains(".part-Frag")
}

/// One artifact file as observed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: SystemTime,
    /// `None` when the filesystem reports no usable access time.
    pub accessed: Option<SystemTime>,
}

impl CacheEntry {
    /// Last access time when valid, otherwise last modification time.
    pub fn access_time(&self) -> SystemTime {
        self.accessed.unwrap_or(self.modified)
    }
}

/// Bytes and location of a cache hit.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// Result of [CacheStore::lookup].
#[derive(Debug)]
pub enum Lookup {
    Hit(CachedArtifact),
    Miss,
}

/// Aggregate view of the cache directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

/// File-backed artifact store rooted at one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the cache directory if it does not exist yet.
    pub async fn ensure_dir(&self) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::io(&self.dir, e))
    }

    /// Canonical location of the artifact for `key`.
    pub fn canonical_path(&self, key: &CacheKey) -> PathBuf {
        key.path_in(&self.dir)
    }

    /// Read the artifact for `key` if it exists.
    ///
    /// A hit refreshes the file's access time; failing to do so is logged and
    /// does not fail the read.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Lookup, CacheError> {
        let path = self.canonical_path(key);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(key = %key, "Cache miss");
                return Ok(Lookup::Miss);
            }
            Err(e) => return Err(CacheError::io(path, e)),
        };

        touch(&path).await;
        debug!(key = %key, size_bytes = bytes.len(), "Cache hit");

        Ok(Lookup::Hit(CachedArtifact { path, bytes }))
    }

    /// Snapshot every artifact file in the cache directory.
    ///
    /// Skips subdirectories, dot-files (such as the cleanup lock) and files a
    /// downloader is still writing. A missing directory is an empty cache.
    pub async fn entries(&self) -> io::Result<Vec<CacheEntry>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') || is_in_progress(name) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Removed between listing and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if !metadata.is_file() {
                continue;
            }

            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let accessed = metadata
                .accessed()
                .ok()
                .filter(|t| *t > SystemTime::UNIX_EPOCH);

            entries.push(CacheEntry {
                path: entry.path(),
                size_bytes: metadata.len(),
                modified,
                accessed,
            });
        }

        Ok(entries)
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let entries = self
            .entries()
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?;

        Ok(CacheStats {
            entries: entries.len(),
            total_bytes: entries.iter().map(|e| e.size_bytes).sum(),
        })
    }
}

/// Best-effort access time refresh.
async fn touch(path: &Path) {
    let target = path.to_path_buf();
    let result =
        tokio::task::spawn_blocking(move || filetime::set_file_atime(&target, FileTime::now()))
            .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "Failed to refresh cache access time");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Access time refresh task failed");
        }
    }
}
