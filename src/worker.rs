use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::queue::JobQueue;
use crate::runner::ProjectRunner;

pub async fn worker(
    id: u8,
    runner: Arc<ProjectRunner>,
    queue: Arc<JobQueue>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            queued = queue.pop() => {
                let job_id = queued.job_id;
                log::info!("Worker {id} got job {job_id} from queue");

                queue.mark_processing(&job_id).await;

                match runner.execute_project_job(&queued.job, &queued.operation_id).await {
                    Ok(result) => {
                        log::info!(
                            "Job {job_id} finished on worker {id} with {:?} status",
                            result.status
                        );
                    }
                    Err(e) => {
                        // Spawn/serialization failures mean a misconfigured
                        // environment; the job is dropped, not retried.
                        log::error!("Job {job_id} failed to execute on worker {id}: {e:#}");
                    }
                }

                queue.mark_finished(&job_id).await;
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}
