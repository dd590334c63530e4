//! Application services

pub mod audio;
pub mod logging;

pub use audio::{AudioArtifact, AudioError, AudioService};
pub use logging::{LogFormat, init_tracing};
