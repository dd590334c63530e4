//! Audio Cache - on-demand audio extraction with a shared on-disk cache
//!
//! Artifacts are keyed by media id and codec. Misses are filled by an external
//! downloader running under a deadline, and a lock-guarded cleanup pass keeps
//! the cache within its age and size limits.

pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod download;
pub mod jobs;
pub mod services;

pub use app::{AppState, build_app};
