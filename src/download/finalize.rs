//! Moves the downloader's output to the canonical cache path.
//!
//! Every file a job's downloader writes starts with the job's own stem
//! (`<media_id>.<job id>.`), so only that job's files are ever renamed or
//! discarded here.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::{DownloadError, DownloadJob};
use crate::cache::store::is_in_progress;

/// Locate the file the downloader produced for `job` and rename it to the
/// job's target path.
///
/// An artifact already at the target (written by another job for the same
/// key) is kept as is and this job's output is discarded.
pub(super) async fn finalize(job: &DownloadJob) -> Result<PathBuf, DownloadError> {
    let target = job.target_path.clone();
    let dir = job.output_dir().to_path_buf();

    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        debug!(job_id = %job.id, path = %target.display(), "Artifact already at canonical path");
        discard_outputs(job).await;
        return Ok(target);
    }

    let produced = find_output(job, &dir).await.map_err(|source| DownloadError::Finalize {
        from: dir.clone(),
        to: target.clone(),
        source: Arc::new(source),
    })?;

    let Some(produced) = produced else {
        return Err(DownloadError::NoOutput { expected: target });
    };

    tokio::fs::rename(&produced, &target)
        .await
        .map_err(|source| DownloadError::Finalize {
            from: produced.clone(),
            to: target.clone(),
            source: Arc::new(source),
        })?;

    info!(
        job_id = %job.id,
        from = %produced.display(),
        to = %target.display(),
        "Moved download to canonical cache path"
    );

    // Leftover intermediates of this job
    discard_outputs(job).await;
    Ok(target)
}

/// Remove every file written under `job`'s stem, partial or complete.
///
/// Best-effort: failures are logged. Returns the number of files removed.
pub(super) async fn discard_outputs(job: &DownloadJob) -> usize {
    let dir = job.output_dir();
    let prefix = format!("{}.", job.output_stem());

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(job_id = %job.id, dir = %dir.display(), error = %e, "Nothing to discard");
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if !name.to_str().is_some_and(|n| n.starts_with(&prefix)) {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %job.id, path = %path.display(), error = %e, "Failed to discard download output"),
        }
    }

    if removed > 0 {
        debug!(job_id = %job.id, removed, "Discarded download outputs");
    }
    removed
}

/// Most recently modified complete file under `job`'s stem.
async fn find_output(job: &DownloadJob, dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let prefix = format!("{}.", job.output_stem());

    let mut best: Option<(PathBuf, SystemTime)> = None;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) || is_in_progress(name) {
            continue;
        }

        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        if best.as_ref().is_none_or(|(_, newest)| modified > *newest) {
            best = Some((entry.path(), modified));
        }
    }

    Ok(best.map(|(path, _)| path))
}
