//! Job lifecycle: submission, priority queueing, status tracking, retry
//! scheduling, and the worker pool.

mod manager;
mod queue;
mod retry;
mod status;
mod types;
mod worker;

pub use manager::JobManager;
pub use queue::PriorityQueue;
pub use retry::RetryPolicy;
pub use status::StatusStore;
pub use types::{
    BatchOutcome, BatchSummary, IngestResult, Job, JobFailure, JobOptions, JobStatus, QueueBucket,
    SubmitReceipt,
};
pub use worker::spawn_workers;
