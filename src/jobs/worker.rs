//! Worker pool: each worker dequeues one job at a time and runs it
//! end-to-end through the pipeline.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::errors::PipelineError;
use crate::pipeline::PipelineRunner;

use super::manager::JobManager;
use super::queue::PriorityQueue;
use super::types::JobStatus;

/// Spawn `count` workers. They exit when the queue is closed and drained.
pub fn spawn_workers(
    count: usize,
    queue: Arc<PriorityQueue>,
    manager: Arc<JobManager>,
    pipeline: Arc<PipelineRunner>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker_idx| {
            let queue = queue.clone();
            let manager = manager.clone();
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                worker_loop(worker_idx, queue, manager, pipeline).await;
            })
        })
        .collect()
}

#[instrument(skip(queue, manager, pipeline))]
async fn worker_loop(
    worker_idx: usize,
    queue: Arc<PriorityQueue>,
    manager: Arc<JobManager>,
    pipeline: Arc<PipelineRunner>,
) {
    info!(worker_idx, "worker started");
    while let Some(job_id) = queue.pop().await {
        let job = match manager.status(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %job_id, "dequeued unknown job, skipping");
                continue;
            }
            Err(err) => {
                debug!(job_id = %job_id, error = %err, "status load failed, skipping");
                continue;
            }
        };
        // Anything but QUEUED means the job was cancelled (or otherwise
        // settled) while waiting.
        if job.status != JobStatus::Queued {
            debug!(job_id = %job_id, status = %job.status, "skipping stale queue entry");
            continue;
        }
        let mut job = job;
        let cancel = manager.cancel_flag(&job_id);
        if cancel.load(Ordering::SeqCst) {
            manager.finish_cancelled(&mut job).await;
            continue;
        }

        manager.begin_running(&mut job).await;
        match pipeline.run(&mut job, cancel).await {
            Ok(result) => manager.finish_completed(&mut job, result).await,
            Err(PipelineError::Cancelled) => manager.finish_cancelled(&mut job).await,
            Err(err) => manager.handle_failure(&mut job, &err).await,
        }
    }
    info!(worker_idx, "worker stopped");
}
