//! Cache keys: a validated media id paired with a target audio format.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::CacheError;

/// Shape of a media id: exactly 11 characters of `[A-Za-z0-9_-]`.
static MEDIA_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid media id regex"));

/// Opaque 11-character identifier of a remote media source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MediaId(String);

impl MediaId {
    /// Validate and wrap a raw media id.
    pub fn parse(raw: &str) -> Result<Self, CacheError> {
        if MEDIA_ID_PATTERN.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(CacheError::InvalidKey(format!(
                "media id must be 11 characters of [A-Za-z0-9_-], got {raw:?}"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MediaId {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Target codec of a cached artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Flac,
    Mp3,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 2] = [AudioFormat::Flac, AudioFormat::Mp3];

    /// File extension, also the name the downloader expects for `--audio-format`.
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Flac => "flac",
            AudioFormat::Mp3 => "mp3",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Mp3 => "audio/mpeg",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for AudioFormat {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flac" => Ok(AudioFormat::Flac),
            "mp3" => Ok(AudioFormat::Mp3),
            other => Err(CacheError::InvalidKey(format!(
                "format must be one of flac, mp3, got {other:?}"
            ))),
        }
    }
}

/// Compound key of one cached artifact.
///
/// Every key maps to exactly one file name, `<media_id>.<ext>`. Media ids never
/// contain a `.` and each format has its own extension, so distinct keys never
/// share a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub media_id: MediaId,
    pub format: AudioFormat,
}

impl CacheKey {
    pub fn new(media_id: MediaId, format: AudioFormat) -> Self {
        Self { media_id, format }
    }

    /// Parse both halves of a key from raw request input.
    pub fn parse(media_id: &str, format: &str) -> Result<Self, CacheError> {
        Ok(Self::new(MediaId::parse(media_id)?, format.parse()?))
    }

    /// `<media_id>.<ext>`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.media_id, self.format.extension())
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.media_id, self.format)
    }
}
