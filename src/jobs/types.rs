//! Job entity and its status machine.
//!
//! `PENDING → QUEUED → RUNNING → (COMPLETED | FAILED | CANCELLED)`, with
//! `FAILED → RETRYING → QUEUED` while attempts remain. COMPLETED and
//! CANCELLED are always terminal; FAILED is terminal once attempts are
//! exhausted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DocId, JobId};
use crate::model::Tier;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Retrying => "RETRYING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(JobStatus::Pending),
            "QUEUED" => Some(JobStatus::Queued),
            "RUNNING" => Some(JobStatus::Running),
            "RETRYING" => Some(JobStatus::Retrying),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELLED" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure attached to a job row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub error_kind: String,
    pub message: String,
}

/// Result payload of a successfully completed ingest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub doc_id: DocId,
    /// `None` when screening rejected the content (nothing was stored).
    pub tier: Option<Tier>,
    pub title: Option<String>,
    pub chunk_count: usize,
    pub entity_count: usize,
    pub relation_count: usize,
}

/// Which logical queue a job belongs to. The engine treats them uniformly
/// today; the split keeps import traffic inspectable apart from export
/// regeneration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBucket {
    #[default]
    Imports,
    Exports,
}

/// Submission options.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub bucket: QueueBucket,
    /// Override the configured max attempts for this job (still clamped to
    /// the absolute ceiling).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub doc_id: DocId,
    pub url: String,
    pub status: JobStatus,
    pub priority: u8,
    pub bucket: QueueBucket,
    pub attempts: u32,
    pub max_attempts: u32,
    pub current_stage: Option<String>,
    pub progress_pct: u8,
    #[serde(default)]
    pub stages_completed: Vec<String>,
    pub error: Option<JobFailure>,
    pub result: Option<IngestResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        job_id: JobId,
        doc_id: DocId,
        url: String,
        priority: u8,
        max_attempts: u32,
        bucket: QueueBucket,
    ) -> Self {
        Self {
            job_id,
            doc_id,
            url,
            status: JobStatus::Pending,
            priority,
            bucket,
            attempts: 0,
            max_attempts,
            current_stage: None,
            progress_pct: 0,
            stages_completed: Vec::new(),
            error: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Terminal: COMPLETED, CANCELLED, or FAILED with attempts exhausted.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed | JobStatus::Cancelled => true,
            JobStatus::Failed => self.attempts >= self.max_attempts,
            _ => false,
        }
    }

    /// Active jobs block duplicate submission for the same doc_id.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Pending | JobStatus::Queued | JobStatus::Running | JobStatus::Retrying
        )
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.attempts < self.max_attempts
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub doc_id: DocId,
    pub status: JobStatus,
    /// `true` when an already-active job was reused under the `reuse`
    /// duplicate policy.
    pub reused: bool,
}

/// Per-URL outcome of a batch submission; failures never halt the batch.
#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub submitted: usize,
    pub failed: usize,
    pub outcomes: Vec<BatchOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            JobId::from("urn:cl:job:x"),
            DocId::from("urn:cl:doc:y"),
            "https://example.com/a".into(),
            5,
            3,
            QueueBucket::Imports,
        )
    }

    #[test]
    fn failed_is_terminal_only_when_exhausted() {
        let mut j = job();
        j.status = JobStatus::Failed;
        j.attempts = 1;
        assert!(!j.is_terminal());
        assert!(j.can_retry());
        j.attempts = 3;
        assert!(j.is_terminal());
        assert!(!j.can_retry());
    }

    #[test]
    fn active_states_block_duplicates() {
        let mut j = job();
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Retrying,
        ] {
            j.status = status;
            assert!(j.is_active(), "{status} should be active");
        }
        j.status = JobStatus::Failed;
        assert!(!j.is_active());
    }
}
