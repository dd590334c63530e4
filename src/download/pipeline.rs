//! Runs download jobs: spawn, fallback, deadline, termination.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::finalize::{discard_outputs, finalize};
use super::log_tail::{self, SharedLogTail};
use super::{DIAGNOSTIC_MAX_CHARS, DownloadConfig, DownloadError, DownloadJob, JobState};
use crate::cache::CacheKey;

/// How long to wait for output pipes to close once the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Cancels a token when the job deadline passes; disarmed on drop.
struct DeadlineTimer {
    handle: JoinHandle<()>,
}

impl DeadlineTimer {
    fn arm(job: &DownloadJob, token: CancellationToken) -> Self {
        let timeout = job.timeout;
        let job_id = job.id;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!(job_id = %job_id, "Download deadline reached");
            token.cancel();
        });
        Self { handle }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// How one candidate command ended.
enum AttemptOutcome {
    Succeeded,
    NotInvocable(io::Error),
    Exited { status: String, diagnostics: String },
    TimedOut { diagnostics: String },
}

/// Spawns the external downloader for each job.
#[derive(Debug, Clone)]
pub struct DownloadPipeline {
    config: DownloadConfig,
}

impl DownloadPipeline {
    pub fn new(config: DownloadConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Build a job producing `key` at `target_path`.
    pub fn job(&self, key: &CacheKey, target_path: PathBuf) -> DownloadJob {
        DownloadJob::new(key.clone(), target_path, &self.config)
    }

    /// Run `job` to completion and return the canonical path of the artifact.
    ///
    /// Candidates are tried in order until one exits successfully. A single
    /// deadline, armed here, covers every attempt. Whatever a failed or timed
    /// out job left in the cache directory is removed.
    pub async fn run(&self, mut job: DownloadJob) -> Result<PathBuf, DownloadError> {
        let result = self.drive(&mut job).await;
        if result.is_err() {
            let removed = discard_outputs(&job).await;
            if removed > 0 {
                info!(job_id = %job.id, removed, state = ?job.state(), "Removed leftovers of unfinished download");
            }
        }
        result
    }

    async fn drive(&self, job: &mut DownloadJob) -> Result<PathBuf, DownloadError> {
        info!(
            job_id = %job.id,
            key = %job.key,
            source = %job.source_url,
            timeout_ms = job.timeout.as_millis() as u64,
            "Starting download job"
        );

        let deadline = CancellationToken::new();
        let _timer = DeadlineTimer::arm(job, deadline.clone());
        let candidates = job.candidate_commands.clone();
        let mut last_failure: Option<DownloadError> = None;

        for (index, command) in candidates.iter().enumerate() {
            if deadline.is_cancelled() {
                job.transition(JobState::TimedOut);
                return Err(DownloadError::Timeout {
                    command: command.clone(),
                    timeout: job.timeout,
                    diagnostics: String::new(),
                });
            }

            job.transition(JobState::Running {
                attempt: index + 1,
                command: command.clone(),
            });

            match self.attempt(job, command, &deadline).await {
                AttemptOutcome::Succeeded => {
                    job.transition(JobState::Finalizing);
                    return match finalize(job).await {
                        Ok(path) => {
                            job.transition(JobState::Resolved);
                            info!(job_id = %job.id, key = %job.key, command = %command, "Download job finished");
                            Ok(path)
                        }
                        Err(e) => {
                            job.transition(JobState::Failed);
                            warn!(job_id = %job.id, error = %e, "Download finalize failed");
                            Err(e)
                        }
                    };
                }
                AttemptOutcome::NotInvocable(e) => {
                    warn!(
                        job_id = %job.id,
                        command = %command,
                        not_found = e.kind() == io::ErrorKind::NotFound,
                        error = %e,
                        "Downloader could not be started, trying next candidate"
                    );
                }
                AttemptOutcome::Exited {
                    status,
                    diagnostics,
                } => {
                    warn!(
                        job_id = %job.id,
                        command = %command,
                        status = %status,
                        "Downloader failed, trying next candidate"
                    );
                    last_failure = Some(DownloadError::Failed {
                        command: command.clone(),
                        status,
                        diagnostics,
                    });
                }
                AttemptOutcome::TimedOut { diagnostics } => {
                    job.transition(JobState::TimedOut);
                    warn!(job_id = %job.id, command = %command, "Download job timed out");
                    return Err(DownloadError::Timeout {
                        command: command.clone(),
                        timeout: job.timeout,
                        diagnostics,
                    });
                }
            }
        }

        job.transition(JobState::Failed);
        Err(last_failure.unwrap_or(DownloadError::Unavailable {
            commands: candidates,
        }))
    }

    async fn attempt(
        &self,
        job: &DownloadJob,
        command: &str,
        deadline: &CancellationToken,
    ) -> AttemptOutcome {
        let mut cmd = Command::new(command);
        cmd.args(job.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so termination reaches the tool's children too
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return AttemptOutcome::NotInvocable(e),
        };
        debug!(job_id = %job.id, command = %command, pid = ?child.id(), "Downloader spawned");

        let capacity = self.config.log_buffer_bytes;
        let stdout_tail = log_tail::shared(capacity);
        let stderr_tail = log_tail::shared(capacity);
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(log_tail::spawn_drain(stdout, stdout_tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(log_tail::spawn_drain(stderr, stderr_tail.clone()));
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = deadline.cancelled() => None,
        };

        let Some(waited) = waited else {
            terminate(&mut child, self.config.kill_grace).await;
            finish_drains(drains).await;
            return AttemptOutcome::TimedOut {
                diagnostics: diagnostics(&stdout_tail, &stderr_tail),
            };
        };

        finish_drains(drains).await;
        match waited {
            Ok(status) if status.success() => AttemptOutcome::Succeeded,
            Ok(status) => AttemptOutcome::Exited {
                status: describe_status(status),
                diagnostics: diagnostics(&stdout_tail, &stderr_tail),
            },
            Err(e) => AttemptOutcome::Exited {
                status: format!("wait failed: {e}"),
                diagnostics: diagnostics(&stdout_tail, &stderr_tail),
            },
        }
    }
}

/// SIGTERM the process group, then SIGKILL it if it outlives the grace window.
async fn terminate(child: &mut Child, grace: Duration) {
    let pid = child.id();
    send_terminate(child, pid);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(pid = ?pid, "Downloader exited after terminate signal"),
        Err(_) => {
            warn!(pid = ?pid, grace_ms = grace.as_millis() as u64, "Downloader ignored terminate signal, killing");
            #[cfg(unix)]
            {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;
                if let Some(pid) = pid {
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
            }
            let _ = child.kill().await;
        }
    }
}

#[cfg(unix)]
fn send_terminate(_child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

/// Wait briefly for the pipe readers, abandoning any a stray grandchild keeps open.
async fn finish_drains(drains: Vec<JoinHandle<()>>) {
    for mut drain in drains {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut drain).await.is_err() {
            drain.abort();
        }
    }
}

/// Bounded diagnostic text: stderr, or stdout when stderr is silent.
fn diagnostics(stdout: &SharedLogTail, stderr: &SharedLogTail) -> String {
    let stderr = stderr.lock().to_string_lossy();
    let text = if stderr.trim().is_empty() {
        stdout.lock().to_string_lossy()
    } else {
        stderr
    };
    log_tail::truncate_tail(text.trim(), DIAGNOSTIC_MAX_CHARS)
}

fn describe_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {signal}");
        }
    }
    status.to_string()
}
