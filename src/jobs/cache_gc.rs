//! Scheduled cache garbage collection

use anyhow::Result;

use crate::cache::{CleanupCoordinator, CleanupOutcome};

/// Run one cleanup pass and log what it did.
pub async fn run(cleanup: &CleanupCoordinator) -> Result<()> {
    match cleanup.run_once().await? {
        CleanupOutcome::Completed(report) => {
            tracing::info!(
                scanned = report.scanned,
                deleted = report.deleted,
                bytes_freed = report.bytes_freed,
                failures = report.errors.len(),
                "Cache cleanup completed"
            );
        }
        CleanupOutcome::Rejected => {
            tracing::info!("Cache cleanup skipped, another process holds the lock");
        }
    }
    Ok(())
}
