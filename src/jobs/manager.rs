//! Submission, status, cancellation, and retry for ingestion jobs.
//!
//! The manager owns job rows and the duplicate-submission bookkeeping; the
//! worker pool drives state transitions through the helpers here so the
//! status machine lives in one place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, instrument, warn};

use crate::config::{DuplicatePolicy, EngineConfig};
use crate::errors::{InputError, JobError, PipelineError};
use crate::ids::{DocId, IdService, JobId};
use crate::progress::{ProgressBus, ProgressEvent, ProgressStream};

use super::queue::PriorityQueue;
use super::retry::RetryPolicy;
use super::status::StatusStore;
use super::types::{
    BatchOutcome, BatchSummary, IngestResult, Job, JobFailure, JobOptions, JobStatus,
    SubmitReceipt,
};

pub struct JobManager {
    config: EngineConfig,
    ids: IdService,
    queue: Arc<PriorityQueue>,
    status: Arc<StatusStore>,
    bus: ProgressBus,
    retry_policy: RetryPolicy,
    cancel_flags: Mutex<FxHashMap<String, Arc<AtomicBool>>>,
    active_docs: Mutex<FxHashMap<String, JobId>>,
    submit_limiter: DefaultDirectRateLimiter,
}

impl JobManager {
    pub fn new(
        config: EngineConfig,
        queue: Arc<PriorityQueue>,
        status: Arc<StatusStore>,
        bus: ProgressBus,
    ) -> Self {
        let ids = IdService::new(config.url_tracking_params_to_strip.clone());
        let retry_policy = RetryPolicy::new(config.retry_base_seconds, config.retry_max_seconds);
        let per_second = std::num::NonZeroU32::new(config.submit_rate_per_second.max(1))
            .unwrap_or(std::num::NonZeroU32::MIN);
        Self {
            config,
            ids,
            queue,
            status,
            bus,
            retry_policy,
            cancel_flags: Mutex::new(FxHashMap::default()),
            active_docs: Mutex::new(FxHashMap::default()),
            submit_limiter: RateLimiter::direct(Quota::per_second(per_second)),
        }
    }

    pub fn ids(&self) -> &IdService {
        &self.ids
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.bus
    }

    pub fn status_store(&self) -> &Arc<StatusStore> {
        &self.status
    }

    /// Validate, dedupe, persist, and enqueue. Returns immediately; the
    /// worker pool picks the job up asynchronously.
    #[instrument(skip(self, options), err)]
    pub async fn submit(
        &self,
        url: &str,
        priority: u8,
        options: JobOptions,
    ) -> Result<SubmitReceipt, JobError> {
        if self.submit_limiter.check().is_err() {
            return Err(JobError::RateLimited);
        }
        if priority < 1 || priority > self.config.priority_levels {
            return Err(JobError::Input(InputError::InvalidPriority {
                priority,
                max: self.config.priority_levels,
            }));
        }
        let (normalized, doc_id) = self.ids.doc_id_for(url)?;

        // Reserve the doc slot atomically so two concurrent submissions of
        // the same URL cannot both win.
        let job_id = JobId::random();
        if let Some(existing) = self.reserve_doc(&doc_id, &job_id) {
            return match self.config.duplicate_policy {
                DuplicatePolicy::Reuse => {
                    debug!(doc_id = %doc_id, job_id = %existing, "reusing active job");
                    let job = self
                        .status
                        .get(&existing)
                        .await?
                        .ok_or_else(|| JobError::NotFound {
                            job_id: existing.clone(),
                        })?;
                    Ok(SubmitReceipt {
                        job_id: job.job_id,
                        doc_id,
                        status: job.status,
                        reused: true,
                    })
                }
                DuplicatePolicy::Reject => Err(JobError::Duplicate {
                    doc_id,
                    existing,
                }),
            };
        }

        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.max_retry_attempts)
            .clamp(1, crate::config::MAX_ATTEMPTS_CEILING);
        let mut job = Job::new(
            job_id.clone(),
            doc_id.clone(),
            normalized.to_string(),
            priority,
            max_attempts,
            options.bucket,
        );

        self.cancel_flags
            .lock()
            .insert(job_id.as_str().to_string(), Arc::new(AtomicBool::new(false)));

        if let Err(err) = self.status.put(&job).await {
            self.release(&job);
            return Err(err.into());
        }

        job.status = JobStatus::Queued;
        self.status.put_quiet(&job).await;
        self.queue
            .push(job.bucket, job_id.clone(), job.priority);
        info!(job_id = %job_id, doc_id = %doc_id, priority, "job queued");

        Ok(SubmitReceipt {
            job_id,
            doc_id,
            status: JobStatus::Queued,
            reused: false,
        })
    }

    /// Map a batch of URLs through `submit`, accumulating per-URL outcomes.
    /// A failing URL never halts the rest of the batch.
    pub async fn submit_batch(
        &self,
        urls: &[String],
        priority: u8,
        options: JobOptions,
    ) -> Result<BatchSummary, JobError> {
        if urls.is_empty() {
            return Err(JobError::Input(InputError::EmptyBatch));
        }
        let mut summary = BatchSummary::default();
        for url in urls {
            match self.submit(url, priority, options.clone()).await {
                Ok(receipt) => {
                    summary.submitted += 1;
                    summary.outcomes.push(BatchOutcome {
                        url: url.clone(),
                        job_id: Some(receipt.job_id),
                        error_kind: None,
                        error: None,
                    });
                }
                Err(err) => {
                    summary.failed += 1;
                    summary.outcomes.push(BatchOutcome {
                        url: url.clone(),
                        job_id: None,
                        error_kind: Some(batch_error_kind(&err)),
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        Ok(summary)
    }

    pub async fn status(&self, job_id: &JobId) -> Result<Option<Job>, JobError> {
        Ok(self.status.get(job_id).await?)
    }

    /// Transition QUEUED/RUNNING to CANCELLED. Running workers observe the
    /// flag at the next stage boundary; progress freezes where it was.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, job_id: &JobId) -> Result<(), JobError> {
        let Some(mut job) = self.status.get(job_id).await? else {
            return Err(JobError::NotFound {
                job_id: job_id.clone(),
            });
        };
        if job.is_terminal() {
            return Err(JobError::TerminalState {
                job_id: job_id.clone(),
                status: job.status.to_string(),
            });
        }
        if let Some(flag) = self.cancel_flags.lock().get(job_id.as_str()) {
            flag.store(true, Ordering::SeqCst);
        }
        if job.status != JobStatus::Running {
            // Not yet picked up: finalize here. A running job unwinds in its
            // worker instead.
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            self.status.put(&job).await?;
            self.release(&job);
            self.bus.finish(
                job_id,
                ProgressEvent::Error {
                    job_id: job_id.clone(),
                    stage: None,
                    error_kind: "cancelled".to_string(),
                    message: "job cancelled before execution".to_string(),
                    timestamp: Utc::now(),
                },
            );
        }
        Ok(())
    }

    /// Re-enqueue a FAILED job with remaining attempts, boosting priority by
    /// +2 (clamped to the maximum level).
    #[instrument(skip(self), err)]
    pub async fn retry(&self, job_id: &JobId) -> Result<(), JobError> {
        let Some(mut job) = self.status.get(job_id).await? else {
            return Err(JobError::NotFound {
                job_id: job_id.clone(),
            });
        };
        if job.status != JobStatus::Failed {
            return Err(JobError::NotFailed {
                job_id: job_id.clone(),
            });
        }
        if job.attempts >= job.max_attempts {
            return Err(JobError::AttemptsExhausted {
                job_id: job_id.clone(),
            });
        }

        // The doc slot may have been taken by a fresh submission since the
        // failure released it; one active job per doc still holds.
        {
            let mut active = self.active_docs.lock();
            if let Some(owner) = active.get(job.doc_id.as_str()) {
                if owner != &job.job_id {
                    return Err(JobError::Duplicate {
                        doc_id: job.doc_id.clone(),
                        existing: owner.clone(),
                    });
                }
            }
            active.insert(job.doc_id.as_str().to_string(), job.job_id.clone());
        }

        job.priority = (job.priority + 2).min(self.config.priority_levels);
        job.status = JobStatus::Retrying;
        self.status.put(&job).await?;

        self.cancel_flags.lock().insert(
            job.job_id.as_str().to_string(),
            Arc::new(AtomicBool::new(false)),
        );

        job.status = JobStatus::Queued;
        self.status.put(&job).await?;
        self.queue.push(job.bucket, job.job_id.clone(), job.priority);
        info!(job_id = %job_id, priority = job.priority, "job manually re-queued");
        Ok(())
    }

    /// Live (or synthetic, for finished jobs) event stream for one job.
    pub async fn stream(&self, job_id: &JobId) -> Result<ProgressStream, JobError> {
        let Some(job) = self.status.get(job_id).await? else {
            return Err(JobError::NotFound {
                job_id: job_id.clone(),
            });
        };
        if job.is_terminal() {
            let event = match (&job.status, &job.result, &job.error) {
                (JobStatus::Completed, result, _) => ProgressEvent::JobCompleted {
                    job_id: job_id.clone(),
                    duration_ms: duration_ms(&job),
                    doc_id: result.as_ref().map(|r| r.doc_id.clone()),
                    tier: result.as_ref().and_then(|r| r.tier),
                    title: result.as_ref().and_then(|r| r.title.clone()),
                    timestamp: Utc::now(),
                },
                (_, _, error) => ProgressEvent::Error {
                    job_id: job_id.clone(),
                    stage: None,
                    error_kind: error
                        .as_ref()
                        .map(|e| e.error_kind.clone())
                        .unwrap_or_else(|| "cancelled".to_string()),
                    message: error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "job cancelled".to_string()),
                    timestamp: Utc::now(),
                },
            };
            return Ok(self.bus.synthetic(event));
        }
        Ok(self.bus.subscribe(job_id))
    }

    // -- transitions driven by the worker pool ------------------------------

    pub(crate) fn cancel_flag(&self, job_id: &JobId) -> Arc<AtomicBool> {
        self.cancel_flags
            .lock()
            .entry(job_id.as_str().to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub(crate) async fn begin_running(&self, job: &mut Job) {
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.started_at = Some(Utc::now());
        job.error = None;
        // A retried attempt replays the pipeline from the top; stale progress
        // from the failed attempt would otherwise double-count stage weights.
        job.progress_pct = 0;
        job.current_stage = None;
        job.stages_completed.clear();
        self.status.put_quiet(job).await;
    }

    pub(crate) async fn finish_completed(&self, job: &mut Job, result: IngestResult) {
        job.status = JobStatus::Completed;
        job.progress_pct = 100;
        job.current_stage = None;
        job.result = Some(result.clone());
        job.completed_at = Some(Utc::now());
        self.status.put_quiet(job).await;
        self.release(job);
        self.bus.finish(
            &job.job_id,
            ProgressEvent::JobCompleted {
                job_id: job.job_id.clone(),
                duration_ms: duration_ms(job),
                doc_id: Some(result.doc_id),
                tier: result.tier,
                title: result.title,
                timestamp: Utc::now(),
            },
        );
    }

    pub(crate) async fn finish_cancelled(&self, job: &mut Job) {
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.status.put_quiet(job).await;
        self.release(job);
        self.bus.finish(
            &job.job_id,
            ProgressEvent::Error {
                job_id: job.job_id.clone(),
                stage: job_stage(job),
                error_kind: "cancelled".to_string(),
                message: "job cancelled".to_string(),
                timestamp: Utc::now(),
            },
        );
    }

    /// Classify a pipeline failure: transient failures with attempts left
    /// re-queue after backoff, everything else is terminal.
    pub(crate) async fn handle_failure(&self, job: &mut Job, error: &PipelineError) {
        let failure = JobFailure {
            error_kind: error.wire_kind().to_string(),
            message: error.to_string(),
        };
        job.error = Some(failure.clone());

        if error.is_transient() && job.attempts < job.max_attempts {
            job.status = JobStatus::Failed;
            self.status.put_quiet(job).await;
            job.status = JobStatus::Retrying;
            self.status.put_quiet(job).await;

            let delay = self.retry_policy.delay(job.attempts);
            warn!(
                job_id = %job.job_id,
                attempts = job.attempts,
                delay_secs = delay.as_secs_f64(),
                error = %error,
                "transient failure, scheduling retry"
            );
            self.bus.publish(
                &job.job_id,
                ProgressEvent::StageProgress {
                    job_id: job.job_id.clone(),
                    stage: job
                        .current_stage
                        .as_deref()
                        .map(stage_static)
                        .unwrap_or("extract"),
                    percent: job.progress_pct,
                    message: Some(format!(
                        "transient failure, retrying in {:.0}s (attempt {}/{})",
                        delay.as_secs_f64(),
                        job.attempts,
                        job.max_attempts
                    )),
                    timestamp: Utc::now(),
                },
            );
            self.schedule_requeue(job.clone(), delay);
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            self.status.put_quiet(job).await;
            self.release(job);
            self.bus.finish(
                &job.job_id,
                ProgressEvent::Error {
                    job_id: job.job_id.clone(),
                    stage: job_stage(job),
                    error_kind: failure.error_kind,
                    message: failure.message,
                    timestamp: Utc::now(),
                },
            );
        }
    }

    fn schedule_requeue(&self, job: Job, delay: Duration) {
        let queue = self.queue.clone();
        let status = self.status.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A cancel may have landed during the backoff; only a job still
            // waiting in RETRYING goes back on the queue.
            match status.get(&job.job_id).await {
                Ok(Some(mut current)) if current.status == JobStatus::Retrying => {
                    current.status = JobStatus::Queued;
                    status.put_quiet(&current).await;
                    queue.push(current.bucket, current.job_id.clone(), current.priority);
                }
                _ => {
                    debug!(job_id = %job.job_id, "skipping requeue, job settled during backoff");
                }
            }
        });
    }

    /// Check-and-insert in one critical section: returns the already-active
    /// job if one holds the slot, otherwise claims it for `job_id`.
    fn reserve_doc(&self, doc_id: &DocId, job_id: &JobId) -> Option<JobId> {
        let mut active = self.active_docs.lock();
        match active.get(doc_id.as_str()) {
            Some(existing) => Some(existing.clone()),
            None => {
                active.insert(doc_id.as_str().to_string(), job_id.clone());
                None
            }
        }
    }

    fn release(&self, job: &Job) {
        let mut active = self.active_docs.lock();
        if active
            .get(job.doc_id.as_str())
            .is_some_and(|owner| owner == &job.job_id)
        {
            active.remove(job.doc_id.as_str());
        }
        drop(active);
        self.cancel_flags.lock().remove(job.job_id.as_str());
    }
}

fn duration_ms(job: &Job) -> u64 {
    match (job.started_at, job.completed_at) {
        (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
        _ => 0,
    }
}

fn job_stage(job: &Job) -> Option<&'static str> {
    job.current_stage.as_deref().map(stage_static)
}

/// Map a persisted stage name back to its static label.
fn stage_static(stage: &str) -> &'static str {
    match stage {
        "extract" => "extract",
        "screen" => "screen",
        "transform" => "transform",
        "chunk_embed" => "chunk_embed",
        "store" => "store",
        "provenance" => "provenance",
        _ => "extract",
    }
}

fn batch_error_kind(err: &JobError) -> String {
    match err {
        JobError::Input(_) => "invalid_input".to_string(),
        JobError::Duplicate { .. } => "duplicate".to_string(),
        JobError::RateLimited => "rate_limited".to_string(),
        JobError::Store(_) => "store_error.backend_unavailable".to_string(),
        _ => "internal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryMetaStore;

    fn manager(config: EngineConfig) -> JobManager {
        let meta = Arc::new(InMemoryMetaStore::new());
        let status = Arc::new(StatusStore::new(meta, Duration::from_secs(60)));
        JobManager::new(
            config,
            Arc::new(PriorityQueue::new()),
            status,
            ProgressBus::default(),
        )
    }

    #[tokio::test]
    async fn submit_validates_priority_and_url() {
        let m = manager(EngineConfig::default());
        let err = m
            .submit("https://example.com/a", 0, JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Input(InputError::InvalidPriority { .. })));

        let err = m.submit("not a url", 5, JobOptions::default()).await.unwrap_err();
        assert!(matches!(err, JobError::Input(InputError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn duplicate_reuse_returns_existing_job() {
        let m = manager(EngineConfig::default());
        let first = m
            .submit("https://example.com/a?utm_source=x", 5, JobOptions::default())
            .await
            .unwrap();
        let second = m
            .submit("https://example.com/a", 5, JobOptions::default())
            .await
            .unwrap();
        assert_eq!(first.job_id, second.job_id);
        assert!(second.reused);
    }

    #[tokio::test]
    async fn duplicate_reject_fails_submission() {
        let config = EngineConfig::default().with_duplicate_policy(DuplicatePolicy::Reject);
        let m = manager(config);
        m.submit("https://example.com/a", 5, JobOptions::default())
            .await
            .unwrap();
        let err = m
            .submit("https://example.com/a", 5, JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn cancel_before_run_finalizes_job() {
        let m = manager(EngineConfig::default());
        let receipt = m
            .submit("https://example.com/a", 5, JobOptions::default())
            .await
            .unwrap();
        m.cancel(&receipt.job_id).await.unwrap();
        let job = m.status(&receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // Cancelling again reports the terminal state.
        let err = m.cancel(&receipt.job_id).await.unwrap_err();
        assert!(matches!(err, JobError::TerminalState { .. }));

        // The doc slot is free again.
        let resubmit = m
            .submit("https://example.com/a", 5, JobOptions::default())
            .await
            .unwrap();
        assert!(!resubmit.reused);
    }

    #[tokio::test]
    async fn retry_requires_failed_with_attempts_left() {
        let m = manager(EngineConfig::default());
        let receipt = m
            .submit("https://example.com/a", 5, JobOptions::default())
            .await
            .unwrap();
        let err = m.retry(&receipt.job_id).await.unwrap_err();
        assert!(matches!(err, JobError::NotFailed { .. }));

        let mut job = m.status(&receipt.job_id).await.unwrap().unwrap();
        job.status = JobStatus::Failed;
        job.attempts = 1;
        m.status_store().put(&job).await.unwrap();
        m.retry(&receipt.job_id).await.unwrap();
        let requeued = m.status(&receipt.job_id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.priority, 7);

        job.attempts = job.max_attempts;
        job.status = JobStatus::Failed;
        m.status_store().put(&job).await.unwrap();
        let err = m.retry(&receipt.job_id).await.unwrap_err();
        assert!(matches!(err, JobError::AttemptsExhausted { .. }));
    }

    #[tokio::test]
    async fn batch_accumulates_partial_failures() {
        let m = manager(EngineConfig::default());
        let summary = m
            .submit_batch(
                &[
                    "https://example.com/a".to_string(),
                    "bogus".to_string(),
                    "https://example.com/b".to_string(),
                ],
                5,
                JobOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(summary.submitted, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.outcomes[1].error_kind.as_deref(), Some("invalid_input"));

        let empty = m.submit_batch(&[], 5, JobOptions::default()).await;
        assert!(matches!(
            empty,
            Err(JobError::Input(InputError::EmptyBatch))
        ));
    }
}
