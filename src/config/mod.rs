//! Application configuration management

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cache::EvictionPolicy;
use crate::download::DownloadConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Directory holding cached artifacts
    pub cache_dir: PathBuf,

    /// Directory holding the cleanup lock marker (defaults to the cache directory)
    pub lock_dir: PathBuf,

    /// Entries not accessed for this long are purged
    pub cache_max_age: Duration,

    /// Total size budget of the cache
    pub cache_max_size_bytes: u64,

    /// Deadline of one download job, across all candidate commands
    pub download_timeout: Duration,

    /// Wait between terminate and kill when a download times out
    pub download_kill_grace: Duration,

    /// Age at which a cleanup lock is considered abandoned
    pub lock_ttl: Duration,

    /// Capacity of each captured output stream of the downloader
    pub log_buffer_bytes: usize,

    /// Downloader binaries, tried in order
    pub candidate_commands: Vec<String>,

    /// Share one in-flight download between concurrent requests for a key
    pub download_coalesce: bool,

    /// Source URL with an `{id}` placeholder
    pub source_url_template: String,

    /// Minimum spacing of cleanup passes fired by cache misses
    pub cleanup_min_interval: Duration,

    /// Cron expression (with seconds) of the scheduled cleanup pass
    pub gc_schedule: String,

    /// `json` or `pretty` log output
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        let download = DownloadConfig::default();
        let eviction = EvictionPolicy::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            cache_dir: PathBuf::from("./data/cache"),
            lock_dir: PathBuf::from("./data/cache"),
            cache_max_age: eviction.max_age,
            cache_max_size_bytes: eviction.max_size_bytes,
            download_timeout: download.timeout,
            download_kill_grace: download.kill_grace,
            lock_ttl: Duration::from_secs(5 * 60),
            log_buffer_bytes: download.log_buffer_bytes,
            candidate_commands: download.candidate_commands,
            download_coalesce: false,
            source_url_template: download.source_url_template,
            cleanup_min_interval: Duration::from_secs(60),
            gc_schedule: "0 0 * * * *".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// unset variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);
        let lock_dir = lookup("LOCK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| cache_dir.clone());

        let candidate_commands = match lookup("DOWNLOAD_COMMANDS") {
            Some(raw) => {
                let commands: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect();
                if commands.is_empty() {
                    anyhow::bail!("DOWNLOAD_COMMANDS must name at least one command");
                }
                commands
            }
            None => defaults.candidate_commands,
        };

        let source_url_template = lookup("SOURCE_URL_TEMPLATE").unwrap_or(defaults.source_url_template);
        if !source_url_template.contains("{id}") {
            anyhow::bail!("SOURCE_URL_TEMPLATE must contain an {{id}} placeholder");
        }

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT")?.unwrap_or(defaults.port),
            cache_dir,
            lock_dir,
            cache_max_age: millis_var(&lookup, "CACHE_MAX_AGE_MS")?
                .unwrap_or(defaults.cache_max_age),
            cache_max_size_bytes: parse_var(&lookup, "CACHE_MAX_SIZE_BYTES")?
                .unwrap_or(defaults.cache_max_size_bytes),
            download_timeout: millis_var(&lookup, "DOWNLOAD_TIMEOUT_MS")?
                .unwrap_or(defaults.download_timeout),
            download_kill_grace: millis_var(&lookup, "DOWNLOAD_KILL_GRACE_MS")?
                .unwrap_or(defaults.download_kill_grace),
            lock_ttl: millis_var(&lookup, "LOCK_TTL_MS")?.unwrap_or(defaults.lock_ttl),
            log_buffer_bytes: parse_var(&lookup, "LOG_BUFFER_BYTES")?
                .unwrap_or(defaults.log_buffer_bytes),
            candidate_commands,
            download_coalesce: lookup("DOWNLOAD_COALESCE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.download_coalesce),
            source_url_template,
            cleanup_min_interval: millis_var(&lookup, "CACHE_CLEANUP_MIN_INTERVAL_MS")?
                .unwrap_or(defaults.cleanup_min_interval),
            gc_schedule: lookup("CACHE_GC_SCHEDULE").unwrap_or(defaults.gc_schedule),
            log_format: lookup("LOG_FORMAT").unwrap_or(defaults.log_format),
        })
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            max_age: self.cache_max_age,
            max_size_bytes: self.cache_max_size_bytes,
        }
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            candidate_commands: self.candidate_commands.clone(),
            timeout: self.download_timeout,
            kill_grace: self.download_kill_grace,
            log_buffer_bytes: self.log_buffer_bytes,
            source_url_template: self.source_url_template.clone(),
        }
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {name}: {raw:?}"))
        })
        .transpose()
}

fn millis_var<F>(lookup: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_var::<F, u64>(lookup, name)?.map(Duration::from_millis))
}
