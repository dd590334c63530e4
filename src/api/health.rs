//! Liveness and readiness probes

use std::path::Path;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub cache_dir: DirCheck,
}

#[derive(Serialize)]
pub struct DirCheck {
    pub path: String,
    pub reachable: bool,
}

/// The process is up
async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// 503 until the cache directory exists
async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let cache_dir = check_dir(state.audio.store().dir()).await;
    let ready = cache_dir.reachable;
    if !ready {
        tracing::warn!(path = %cache_dir.path, "Cache directory is not reachable");
    }

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadyResponse { ready, cache_dir }))
}

async fn check_dir(path: &Path) -> DirCheck {
    let reachable = matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_dir());
    DirCheck {
        path: path.display().to_string(),
        reachable,
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
