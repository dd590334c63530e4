//! Download-and-convert pipeline
//!
//! An external downloader (yt-dlp or a compatible tool) fetches the source and
//! converts it to the requested codec. The pipeline tries a fixed list of
//! candidate commands in order, enforces one deadline across all of them,
//! keeps a bounded tail of each attempt's output for diagnostics, and moves the
//! produced file to its canonical cache path.

mod finalize;
pub mod inflight;
pub mod log_tail;
mod pipeline;

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{CacheKey, MediaId};

pub use inflight::InflightDownloads;
pub use log_tail::LogTail;
pub use pipeline::DownloadPipeline;

/// Shown with failures that usually mean the downloader is not installed.
pub const INSTALL_HINT: &str =
    "make sure yt-dlp (or youtube-dl) and ffmpeg are installed and on PATH";

/// Longest diagnostic tail carried by a [DownloadError].
pub const DIAGNOSTIC_MAX_CHARS: usize = 1000;

/// Terminal failures of a download job.
///
/// Cloneable so that requests sharing one in-flight job share its result.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    #[error("download timed out after {:.1}s while running {command}", timeout.as_secs_f64())]
    Timeout {
        command: String,
        timeout: Duration,
        diagnostics: String,
    },

    #[error("no downloader could be started (tried: {})", commands.join(", "))]
    Unavailable { commands: Vec<String> },

    #[error("{command} failed ({status}): {diagnostics}")]
    Failed {
        command: String,
        status: String,
        diagnostics: String,
    },

    #[error("failed to move {} to {}: {source}", from.display(), to.display())]
    Finalize {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("downloader reported success but produced no file for {}", expected.display())]
    NoOutput { expected: PathBuf },

    #[error("download task aborted: {0}")]
    Aborted(String),
}

impl DownloadError {
    /// Installation hint for failures caused by a missing or broken tool.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            DownloadError::Unavailable { .. } | DownloadError::Failed { .. } => Some(INSTALL_HINT),
            _ => None,
        }
    }
}

/// Settings shared by every job of a pipeline.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Downloader binaries, tried in order.
    pub candidate_commands: Vec<String>,
    /// Deadline for a whole job, across all candidates.
    pub timeout: Duration,
    /// Wait between SIGTERM and SIGKILL when the deadline fires.
    pub kill_grace: Duration,
    /// Capacity of each of the stdout and stderr tails.
    pub log_buffer_bytes: usize,
    /// Source URL with an `{id}` placeholder for the media id.
    pub source_url_template: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            candidate_commands: vec!["yt-dlp".to_string(), "youtube-dl".to_string()],
            timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(2),
            log_buffer_bytes: 10 * 1024,
            source_url_template: "https://www.youtube.com/watch?v={id}".to_string(),
        }
    }
}

impl DownloadConfig {
    pub fn source_url(&self, media_id: &MediaId) -> String {
        self.source_url_template.replace("{id}", media_id.as_str())
    }
}

/// Lifecycle of a [DownloadJob].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running { attempt: usize, command: String },
    Finalizing,
    Resolved,
    Failed,
    TimedOut,
}

/// One download request, from first spawn to a terminal state.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: Uuid,
    pub key: CacheKey,
    pub source_url: String,
    pub target_path: PathBuf,
    pub timeout: Duration,
    pub candidate_commands: Vec<String>,
    state: JobState,
}

impl DownloadJob {
    pub fn new(key: CacheKey, target_path: PathBuf, config: &DownloadConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_url: config.source_url(&key.media_id),
            key,
            target_path,
            timeout: config.timeout,
            candidate_commands: config.candidate_commands.clone(),
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    fn transition(&mut self, next: JobState) {
        debug!(job_id = %self.id, from = ?self.state, to = ?next, "Download job state change");
        self.state = next;
    }

    /// Directory the downloader writes into.
    pub fn output_dir(&self) -> &Path {
        self.target_path.parent().unwrap_or(Path::new("."))
    }

    /// Base name of every file this job's downloader writes. Unique per job,
    /// so concurrent jobs for one media id never see each other's files.
    pub fn output_stem(&self) -> String {
        format!("{}.{}", self.key.media_id, self.id.simple())
    }

    /// Downloader output template: the job's stem with the tool's own
    /// extension. Finalize renames the result to the canonical path.
    fn output_template(&self) -> PathBuf {
        self.output_dir()
            .join(format!("{}.%(ext)s", self.output_stem()))
    }

    /// Arguments understood by yt-dlp and youtube-dl alike.
    fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-x",
            "--audio-format",
            self.key.format.extension(),
            "--audio-quality",
            "0",
            "--no-playlist",
            "--no-progress",
            "--no-mtime",
            "-o",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.push(self.output_template().into_os_string());
        args.push(OsString::from(&self.source_url));
        args
    }
}
