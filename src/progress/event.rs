//! Progress event shapes published during ingestion.
//!
//! Events serialize to the SSE wire payloads: `kind()` names the SSE event,
//! `data()` is the JSON body. Within one job, events reach each subscriber in
//! publication order.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::ids::{DocId, JobId};
use crate::model::Tier;

#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    JobStarted {
        job_id: JobId,
        url: String,
        timestamp: DateTime<Utc>,
    },
    StageStarted {
        job_id: JobId,
        stage: &'static str,
        timestamp: DateTime<Utc>,
    },
    StageProgress {
        job_id: JobId,
        stage: &'static str,
        /// Monotonically increasing within a job; cumulative stage weights.
        percent: u8,
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    StageCompleted {
        job_id: JobId,
        stage: &'static str,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    JobCompleted {
        job_id: JobId,
        duration_ms: u64,
        doc_id: Option<DocId>,
        tier: Option<Tier>,
        title: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Error {
        job_id: JobId,
        stage: Option<&'static str>,
        error_kind: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::JobStarted { .. } => "job_started",
            ProgressEvent::StageStarted { .. } => "stage_started",
            ProgressEvent::StageProgress { .. } => "stage_progress",
            ProgressEvent::StageCompleted { .. } => "stage_completed",
            ProgressEvent::JobCompleted { .. } => "job_completed",
            ProgressEvent::Error { .. } => "error",
            ProgressEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    /// `true` when this event ends the stream for its job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::JobCompleted { .. } | ProgressEvent::Error { .. }
        )
    }

    /// JSON payload for the SSE `data:` line.
    pub fn data(&self) -> Value {
        match self {
            ProgressEvent::JobStarted {
                job_id,
                url,
                timestamp,
            } => json!({
                "job_id": job_id,
                "url": url,
                "timestamp": timestamp.to_rfc3339(),
            }),
            ProgressEvent::StageStarted {
                job_id,
                stage,
                timestamp,
            } => json!({
                "job_id": job_id,
                "stage": stage,
                "timestamp": timestamp.to_rfc3339(),
            }),
            ProgressEvent::StageProgress {
                job_id,
                stage,
                percent,
                message,
                timestamp,
            } => {
                let mut body = json!({
                    "job_id": job_id,
                    "stage": stage,
                    "percent": percent,
                    "timestamp": timestamp.to_rfc3339(),
                });
                if let Some(message) = message {
                    body["message"] = json!(message);
                }
                body
            }
            ProgressEvent::StageCompleted {
                job_id,
                stage,
                duration_ms,
                timestamp,
            } => json!({
                "job_id": job_id,
                "stage": stage,
                "duration_ms": duration_ms,
                "timestamp": timestamp.to_rfc3339(),
            }),
            ProgressEvent::JobCompleted {
                job_id,
                duration_ms,
                doc_id,
                tier,
                title,
                timestamp,
            } => json!({
                "job_id": job_id,
                "duration_ms": duration_ms,
                "result": {
                    "doc_id": doc_id,
                    "tier": tier.map(|t| t.as_str()),
                    "title": title,
                },
                "timestamp": timestamp.to_rfc3339(),
            }),
            ProgressEvent::Error {
                job_id,
                stage,
                error_kind,
                message,
                timestamp,
            } => json!({
                "job_id": job_id,
                "stage": stage,
                "error_kind": error_kind,
                "message": message,
                "timestamp": timestamp.to_rfc3339(),
            }),
            ProgressEvent::Heartbeat { timestamp } => json!({
                "timestamp": timestamp.to_rfc3339(),
            }),
        }
    }
}
