//! Integration tests for the audio cache
//!
//! These tests drive the full flow with fake downloader scripts:
//! - Cache miss -> download -> finalize -> serve, then cache hits
//! - Candidate fallback and failure reporting
//! - Deadline enforcement, including tools that ignore SIGTERM
//! - Coalescing of concurrent requests
//! - HTTP status codes and headers

#![cfg(unix)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use audio_cache::cache::{AudioFormat, CacheKey};
use audio_cache::config::Config;
use audio_cache::download::DownloadError;
use audio_cache::services::{AudioError, AudioService};
use audio_cache::{AppState, build_app};
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tower::ServiceExt;

const MEDIA_ID: &str = "dQw4w9WgXcQ";

/// Spawning from several threads while a script is still open for writing
/// makes exec fail with ETXTBSY, so tests that spawn run one at a time.
static SPAWN_SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Shell snippet that parses the downloader arguments into `$out` (the output
/// template) and `$fmt` (the requested codec).
const PARSE_ARGS: &str = r#"
out=""
fmt=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    --audio-format) fmt="$2"; shift 2 ;;
    *) shift ;;
  esac
done
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A downloader that records each run in `log` and writes `payload` to the
/// output template, using `ext` (or the requested codec when `None`).
fn downloader(dir: &Path, name: &str, log: &Path, payload: &str, ext: Option<&str>) -> PathBuf {
    let ext = ext.map(str::to_string).unwrap_or_else(|| "$fmt".to_string());
    let body = format!(
        "{PARSE_ARGS}\necho {name} >> '{log}'\npath=$(printf '%s' \"$out\" | sed \"s/%(ext)s/{ext}/\")\nprintf '%s' '{payload}' > \"$path\"\n",
        log = log.display(),
    );
    write_script(dir, name, &body)
}

struct Harness {
    _tmp: TempDir,
    bin_dir: PathBuf,
    cache_dir: PathBuf,
    log: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let bin_dir = tmp.path().join("bin");
        let cache_dir = tmp.path().join("cache");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let log = tmp.path().join("runs.log");
        Self {
            _tmp: tmp,
            bin_dir,
            cache_dir,
            log,
        }
    }

    fn config(&self, commands: &[PathBuf], extra: &[(&str, &str)]) -> Config {
        let commands = commands
            .iter()
            .map(|c| c.display().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut vars: HashMap<String, String> = HashMap::from([
            ("CACHE_DIR".to_string(), self.cache_dir.display().to_string()),
            ("DOWNLOAD_COMMANDS".to_string(), commands),
            ("DOWNLOAD_TIMEOUT_MS".to_string(), "10000".to_string()),
            ("DOWNLOAD_KILL_GRACE_MS".to_string(), "200".to_string()),
        ]);
        for (name, value) in extra {
            vars.insert(name.to_string(), value.to_string());
        }
        Config::from_lookup(|name| vars.get(name).cloned()).unwrap()
    }

    async fn service(&self, config: &Config) -> AudioService {
        let service = AudioService::from_config(config);
        service.store().ensure_dir().await.unwrap();
        service
    }

    /// Names of the non-hidden files in the cache directory, sorted.
    fn cache_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    fn runs(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }
}

fn key(format: AudioFormat) -> CacheKey {
    CacheKey::parse(MEDIA_ID, format.extension()).unwrap()
}

// ============================================================================
// Download and cache
// ============================================================================

#[tokio::test]
async fn test_miss_downloads_then_hits_cache() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let tool = downloader(&h.bin_dir, "good", &h.log, "flac-bytes", None);
    let config = h.config(&[tool], &[]);
    let service = h.service(&config).await;

    let first = service.fetch(&key(AudioFormat::Flac)).await.unwrap();
    assert_eq!(first.bytes, b"flac-bytes".to_vec());
    assert_eq!(first.path, h.cache_dir.join(format!("{MEDIA_ID}.flac")));
    assert_eq!(first.content_type(), "audio/flac");

    let second = service.fetch(&key(AudioFormat::Flac)).await.unwrap();
    assert_eq!(second.bytes, first.bytes);
    assert_eq!(h.runs(), vec!["good"]);
}

#[tokio::test]
async fn test_formats_are_cached_independently() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let tool = downloader(&h.bin_dir, "good", &h.log, "audio", None);
    let config = h.config(&[tool], &[]);
    let service = h.service(&config).await;

    service.fetch(&key(AudioFormat::Mp3)).await.unwrap();
    service.fetch(&key(AudioFormat::Flac)).await.unwrap();

    assert!(h.cache_dir.join(format!("{MEDIA_ID}.mp3")).is_file());
    assert!(h.cache_dir.join(format!("{MEDIA_ID}.flac")).is_file());
    assert_eq!(h.runs().len(), 2);

    let stats = service.store().stats().await.unwrap();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.total_bytes, 10);
}

#[tokio::test]
async fn test_foreign_extension_is_renamed_to_canonical_path() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let tool = downloader(&h.bin_dir, "m4a", &h.log, "converted", Some("m4a"));
    let config = h.config(&[tool], &[]);
    let service = h.service(&config).await;

    let artifact = service.fetch(&key(AudioFormat::Mp3)).await.unwrap();

    assert_eq!(artifact.path, h.cache_dir.join(format!("{MEDIA_ID}.mp3")));
    assert_eq!(artifact.bytes, b"converted".to_vec());
    assert_eq!(h.cache_files(), vec![format!("{MEDIA_ID}.mp3")]);
}

#[tokio::test]
async fn test_success_without_output_is_reported() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let tool = write_script(&h.bin_dir, "silent", "exit 0");
    let config = h.config(&[tool], &[]);
    let service = h.service(&config).await;

    let err = service.fetch(&key(AudioFormat::Mp3)).await.unwrap_err();
    assert_matches!(err, AudioError::Download(DownloadError::NoOutput { .. }));
}

// ============================================================================
// Candidate fallback
// ============================================================================

#[tokio::test]
async fn test_missing_first_candidate_falls_back() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let missing = h.bin_dir.join("not-installed");
    let tool = downloader(&h.bin_dir, "fallback", &h.log, "ok", None);
    let config = h.config(&[missing, tool], &[]);
    let service = h.service(&config).await;

    let artifact = service.fetch(&key(AudioFormat::Mp3)).await.unwrap();
    assert_eq!(artifact.bytes, b"ok".to_vec());
    assert_eq!(h.runs(), vec!["fallback"]);
}

#[tokio::test]
async fn test_failure_reports_last_candidate() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let log = h.log.display().to_string();
    let a = write_script(
        &h.bin_dir,
        "fail-a",
        &format!("echo a >> '{log}'\necho 'a broke' >&2\nexit 1"),
    );
    let b = write_script(
        &h.bin_dir,
        "fail-b",
        &format!("echo b >> '{log}'\necho 'b broke' >&2\nexit 3"),
    );
    let config = h.config(&[a, b.clone()], &[]);
    let service = h.service(&config).await;

    let err = service.fetch(&key(AudioFormat::Mp3)).await.unwrap_err();

    assert_eq!(h.runs(), vec!["a", "b"]);
    assert_matches!(
        err,
        AudioError::Download(DownloadError::Failed { command, status, diagnostics }) => {
            assert_eq!(command, b.display().to_string());
            assert_eq!(status, "exit code 3");
            assert!(diagnostics.contains("b broke"));
            assert!(!diagnostics.contains("a broke"));
        }
    );
}

#[tokio::test]
async fn test_failed_job_leaves_no_partial_files() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let body = format!(
        "{PARSE_ARGS}\npart=$(printf '%s' \"$out\" | sed \"s/%(ext)s/webm.part/\")\nprintf partial > \"$part\"\nfrag=$(printf '%s' \"$out\" | sed \"s/%(ext)s/webm.part-Frag1/\")\nprintf fragment > \"$frag\"\necho 'HTTP Error 403' >&2\nexit 1"
    );
    let tool = write_script(&h.bin_dir, "partial", &body);
    let config = h.config(&[tool], &[]);
    let service = h.service(&config).await;

    let err = service.fetch(&key(AudioFormat::Flac)).await.unwrap_err();

    assert_matches!(err, AudioError::Download(DownloadError::Failed { .. }));
    assert!(h.cache_files().is_empty(), "leftovers: {:?}", h.cache_files());
}

#[tokio::test]
async fn test_no_invocable_candidate_is_unavailable() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let config = h.config(
        &[h.bin_dir.join("yt-dlp"), h.bin_dir.join("youtube-dl")],
        &[],
    );
    let service = h.service(&config).await;

    let err = service.fetch(&key(AudioFormat::Mp3)).await.unwrap_err();

    assert_matches!(
        &err,
        AudioError::Download(DownloadError::Unavailable { commands }) if commands.len() == 2
    );
    assert_matches!(&err, AudioError::Download(e) if e.hint().is_some());
}

// ============================================================================
// Deadline
// ============================================================================

/// Shell body that records each SIGTERM in `signals`, writes its pid to
/// `pid_file` and leaves a partial download behind before stalling.
/// With `exit_on_term` the trap ends the script; otherwise it keeps running.
fn stalling_downloader(signals: &Path, pid_file: &Path, exit_on_term: bool) -> String {
    let on_term = if exit_on_term { "; exit 143" } else { "" };
    format!(
        "{PARSE_ARGS}\ntrap 'echo term >> \"{signals}\"{on_term}' TERM\necho $$ > '{pid}'\npart=$(printf '%s' \"$out\" | sed \"s/%(ext)s/webm.part/\")\nprintf partial > \"$part\"\necho 'starting' >&2\nwhile :; do sleep 1; done\n",
        signals = signals.display(),
        pid = pid_file.display(),
    )
}

fn read_pid(pid_file: &Path) -> nix::unistd::Pid {
    let raw = std::fs::read_to_string(pid_file).unwrap();
    nix::unistd::Pid::from_raw(raw.trim().parse().unwrap())
}

fn is_alive(pid: nix::unistd::Pid) -> bool {
    nix::sys::signal::kill(pid, None).is_ok()
}

#[tokio::test]
async fn test_slow_downloader_is_terminated_at_deadline() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let signals = h.bin_dir.join("signals.log");
    let pid_file = h.bin_dir.join("slow.pid");
    let slow = write_script(&h.bin_dir, "slow", &stalling_downloader(&signals, &pid_file, true));
    let config = h.config(&[slow], &[("DOWNLOAD_TIMEOUT_MS", "300")]);
    let service = h.service(&config).await;

    let started = Instant::now();
    let err = service.fetch(&key(AudioFormat::Mp3)).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(300), "rejected early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "rejected late: {elapsed:?}");
    assert_matches!(
        err,
        AudioError::Download(DownloadError::Timeout { timeout, diagnostics, .. }) => {
            assert_eq!(timeout, Duration::from_millis(300));
            assert!(diagnostics.contains("starting"));
        }
    );
    assert_eq!(std::fs::read_to_string(&signals).unwrap().trim(), "term");
    assert!(!is_alive(read_pid(&pid_file)));
    assert!(h.cache_files().is_empty(), "leftovers: {:?}", h.cache_files());
}

#[tokio::test]
async fn test_downloader_ignoring_sigterm_is_killed_after_grace() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let signals = h.bin_dir.join("signals.log");
    let pid_file = h.bin_dir.join("stubborn.pid");
    let stubborn = write_script(
        &h.bin_dir,
        "stubborn",
        &stalling_downloader(&signals, &pid_file, false),
    );
    let config = h.config(
        &[stubborn],
        &[
            ("DOWNLOAD_TIMEOUT_MS", "300"),
            ("DOWNLOAD_KILL_GRACE_MS", "400"),
        ],
    );
    let service = h.service(&config).await;

    let started = Instant::now();
    let err = service.fetch(&key(AudioFormat::Mp3)).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_matches!(err, AudioError::Download(DownloadError::Timeout { .. }));
    // Deadline plus the full grace window, then the forced kill
    assert!(elapsed >= Duration::from_millis(700), "killed early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "killed late: {elapsed:?}");
    assert!(std::fs::read_to_string(&signals).unwrap().contains("term"));
    assert!(!is_alive(read_pid(&pid_file)));
    assert!(h.cache_files().is_empty(), "leftovers: {:?}", h.cache_files());
}

#[tokio::test]
async fn test_deadline_spans_all_candidates() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let log = h.log.display().to_string();
    let slow_fail = write_script(
        &h.bin_dir,
        "slow-fail",
        &format!("echo slow >> '{log}'\nsleep 0.4\nexit 1"),
    );
    let never = downloader(&h.bin_dir, "never", &h.log, "late", None);
    let config = h.config(
        &[slow_fail.clone(), slow_fail, never],
        &[("DOWNLOAD_TIMEOUT_MS", "600")],
    );
    let service = h.service(&config).await;

    let err = service.fetch(&key(AudioFormat::Mp3)).await.unwrap_err();

    assert_matches!(err, AudioError::Download(DownloadError::Timeout { .. }));
    assert!(!h.runs().contains(&"never".to_string()));
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test]
async fn test_concurrent_requests_share_one_download() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let log = h.log.display().to_string();
    let body = format!(
        "{PARSE_ARGS}\necho run >> '{log}'\nsleep 0.5\npath=$(printf '%s' \"$out\" | sed \"s/%(ext)s/$fmt/\")\nprintf shared > \"$path\"\n"
    );
    let tool = write_script(&h.bin_dir, "shared", &body);
    let config = h.config(&[tool], &[("DOWNLOAD_COALESCE", "true")]);
    let service = h.service(&config).await;

    let k = key(AudioFormat::Mp3);
    let (a, b) = tokio::join!(service.fetch(&k), service.fetch(&k));

    assert_eq!(a.unwrap().bytes, b"shared".to_vec());
    assert_eq!(b.unwrap().bytes, b"shared".to_vec());
    assert_eq!(h.runs(), vec!["run"]);
}

// ============================================================================
// HTTP
// ============================================================================

fn app_for(config: Config, service: AudioService) -> axum::Router {
    build_app(AppState {
        config: Arc::new(config),
        audio: Arc::new(service),
    })
}

async fn get(app: axum::Router, uri: &str) -> axum::response::Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_http_serves_artifact_with_headers() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let tool = downloader(&h.bin_dir, "good", &h.log, "flac-data", None);
    let config = h.config(&[tool], &[]);
    let service = h.service(&config).await;
    let app = app_for(config, service);

    let response = get(app, &format!("/api/audio/{MEDIA_ID}?format=flac")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "audio/flac");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        format!("attachment; filename=\"{MEDIA_ID}.flac\"").as_str()
    );
    assert_eq!(
        headers[header::CACHE_CONTROL],
        "public, max-age=31536000, immutable"
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"flac-data");
}

#[tokio::test]
async fn test_http_defaults_to_mp3() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let tool = downloader(&h.bin_dir, "good", &h.log, "mp3-data", None);
    let config = h.config(&[tool], &[]);
    let service = h.service(&config).await;
    let app = app_for(config, service);

    let response = get(app, &format!("/api/audio/{MEDIA_ID}")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
}

#[tokio::test]
async fn test_http_rejects_invalid_keys() {
    let h = Harness::new();
    let config = h.config(&[h.bin_dir.join("unused")], &[]);
    let service = h.service(&config).await;
    let app = app_for(config, service);

    let response = get(app.clone(), "/api/audio/short?format=mp3").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(app, &format!("/api/audio/{MEDIA_ID}?format=ogg")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].is_string());
    assert!(body.get("hint").is_none());
    assert!(h.runs().is_empty());
}

#[tokio::test]
async fn test_http_unavailable_includes_hint() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let config = h.config(&[h.bin_dir.join("yt-dlp")], &[]);
    let service = h.service(&config).await;
    let app = app_for(config, service);

    let response = get(app, &format!("/api/audio/{MEDIA_ID}")).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert!(body["hint"].as_str().unwrap().contains("yt-dlp"));
}

#[tokio::test]
async fn test_http_timeout_is_gateway_timeout() {
    let _serial = SPAWN_SERIAL.lock().await;
    let h = Harness::new();
    let slow = write_script(&h.bin_dir, "slow", "sleep 30");
    let config = h.config(&[slow], &[("DOWNLOAD_TIMEOUT_MS", "200")]);
    let service = h.service(&config).await;
    let app = app_for(config, service);

    let response = get(app, &format!("/api/audio/{MEDIA_ID}")).await;

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_http_probes_and_stats() {
    let h = Harness::new();
    let config = h.config(
        &[h.bin_dir.join("unused")],
        &[("CACHE_MAX_SIZE_BYTES", "4096"), ("CACHE_MAX_AGE_MS", "90000")],
    );
    let service = h.service(&config).await;
    std::fs::write(h.cache_dir.join(format!("{MEDIA_ID}.mp3")), b"12345").unwrap();
    let app = app_for(config, service);

    let response = get(app.clone(), "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = get(app.clone(), "/readyz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = get(app, "/api/cache/stats").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["entries"], 1);
    assert_eq!(body["total_bytes"], 5);
    assert_eq!(body["max_size_bytes"], 4096);
    assert_eq!(body["max_age_ms"], 90000);
}

#[tokio::test]
async fn test_readyz_fails_without_cache_dir() {
    let h = Harness::new();
    let config = h.config(&[h.bin_dir.join("unused")], &[]);
    let service = AudioService::from_config(&config);
    let app = app_for(config, service);

    let response = get(app, "/readyz").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
