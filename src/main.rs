//! Audio Cache backend entry point.
//!
//! Serves `/api/audio/{media_id}` and runs the scheduled cache cleanup.

use std::sync::Arc;

use audio_cache::config::Config;
use audio_cache::services::{AudioService, LogFormat, init_tracing};
use audio_cache::{AppState, build_app, jobs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    init_tracing(LogFormat::from_name(&config.log_format))?;

    tracing::info!("Starting Audio Cache");
    tracing::info!(
        cache_dir = %config.cache_dir.display(),
        lock_dir = %config.lock_dir.display(),
        commands = ?config.candidate_commands,
        "Configuration loaded"
    );

    let audio = Arc::new(AudioService::from_config(&config));
    audio.store().ensure_dir().await?;
    tracing::info!("Cache directory ready");

    // Held for the lifetime of the process
    let _scheduler = jobs::start_scheduler(audio.cleanup().clone(), &config.gc_schedule).await?;

    let state = AppState {
        config: config.clone(),
        audio,
    };
    let app = build_app(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
