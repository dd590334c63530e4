//! Audio artifact endpoint
//!
//! GET /api/audio/{media_id}?format=flac|mp3

use axum::{
    Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use super::ApiError;
use crate::AppState;
use crate::cache::{AudioFormat, CacheError, CacheKey};
use crate::download::DownloadError;
use crate::services::AudioError;

/// Artifacts never change once produced
const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

#[derive(Debug, Deserialize)]
pub struct AudioQuery {
    /// Target codec, `mp3` when omitted
    format: Option<String>,
}

async fn get_audio(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
    Query(query): Query<AudioQuery>,
) -> Result<Response, ApiError> {
    let format = query
        .format
        .as_deref()
        .unwrap_or(AudioFormat::Mp3.extension());
    let key = CacheKey::parse(&media_id, format)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    let artifact = state.audio.fetch(&key).await.map_err(|e| {
        tracing::error!(key = %key, error = %e, "Failed to serve audio");
        ApiError::from(e)
    })?;

    let headers = [
        (header::CONTENT_TYPE, artifact.content_type().to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", artifact.file_name()),
        ),
        (header::CACHE_CONTROL, IMMUTABLE_CACHE_CONTROL.to_string()),
    ];
    Ok((StatusCode::OK, headers, artifact.bytes).into_response())
}

impl From<AudioError> for ApiError {
    fn from(err: AudioError) -> Self {
        let status = match &err {
            AudioError::Cache(CacheError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            AudioError::Cache(CacheError::Io { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            AudioError::Download(DownloadError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            AudioError::Download(DownloadError::Unavailable { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AudioError::Download(DownloadError::Failed { .. }) => StatusCode::BAD_GATEWAY,
            AudioError::Download(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let hint = match &err {
            AudioError::Download(e) => e.hint(),
            AudioError::Cache(_) => None,
        };

        let api_error = ApiError::new(status, err.to_string());
        match hint {
            Some(hint) => api_error.with_hint(hint),
            None => api_error,
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/audio/{media_id}", get(get_audio))
}
