//! Cache statistics endpoint

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use super::ApiError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_size_bytes: u64,
    pub max_age_ms: u64,
}

/// Get cache size and limits
async fn cache_stats(State(state): State<AppState>) -> Result<Json<CacheStatsResponse>, ApiError> {
    let stats = state.audio.store().stats().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to read cache stats");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read cache stats")
    })?;
    let config = &state.config;

    Ok(Json(CacheStatsResponse {
        entries: stats.entries,
        total_bytes: stats.total_bytes,
        max_size_bytes: config.cache_max_size_bytes,
        max_age_ms: config.cache_max_age.as_millis() as u64,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/cache/stats", get(cache_stats))
}
