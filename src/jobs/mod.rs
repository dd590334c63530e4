//! Background job scheduling

pub mod cache_gc;

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::cache::CleanupCoordinator;

/// Initialize and start the job scheduler
pub async fn start_scheduler(
    cleanup: Arc<CleanupCoordinator>,
    gc_schedule: &str,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Cache cleanup, on top of the passes fired by cache misses
    let gc_job = Job::new_async(gc_schedule, move |_uuid, _l| {
        let cleanup = cleanup.clone();
        Box::pin(async move {
            info!("Running scheduled cache cleanup");
            if let Err(e) = cache_gc::run(&cleanup).await {
                tracing::error!("Cache GC error: {}", e);
            }
        })
    })?;
    scheduler.add(gc_job).await?;

    scheduler.start().await?;

    info!(schedule = %gc_schedule, "Job scheduler started");
    Ok(scheduler)
}
