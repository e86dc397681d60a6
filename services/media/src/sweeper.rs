use anyhow::Result;
use common::media::TranscodeJob;
use common::queue::JobQueue;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Periodically return jobs abandoned by crashed workers to the wait list.
///
/// The returned scheduler must be kept alive for the sweep to keep running.
pub async fn start_stalled_sweep(
    queue: JobQueue<TranscodeJob>,
    stalled_timeout: Duration,
    schedule: &str,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(schedule, move |_, _| {
        let queue = queue.clone();
        Box::pin(async move {
            match queue.recover_stalled(stalled_timeout).await {
                Ok(0) => {}
                Ok(recovered) => info!("Recovered {} stalled jobs", recovered),
                Err(e) => error!("Failed to sweep stalled jobs: {}", e),
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    info!("Started stalled-job sweep with schedule: {}", schedule);
    Ok(scheduler)
}
