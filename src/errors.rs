//! Error taxonomy for ingestion and retrieval.
//!
//! Transient errors (network, provider 5xx, rate limits, timeouts) are
//! retry-eligible; permanent errors (bad input, 4xx, unsupported formats)
//! fail immediately. Classification lives on the error types themselves so
//! the retry scheduler never has to pattern-match deep into sources.

use miette::Diagnostic;
use thiserror::Error;

use crate::ids::{DocId, JobId};

/// Caller-side input problems. Never retried; surfaced as 400s.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum InputError {
    #[error("invalid url '{url}': {reason}")]
    #[diagnostic(code(citeloom::input::invalid_url))]
    InvalidUrl { url: String, reason: String },

    #[error("priority {priority} outside 1..={max}")]
    #[diagnostic(
        code(citeloom::input::invalid_priority),
        help("Priorities are 1 (lowest) through the configured maximum, default 10.")
    )]
    InvalidPriority { priority: u8, max: u8 },

    #[error("empty batch submission")]
    #[diagnostic(code(citeloom::input::empty_batch))]
    EmptyBatch,

    #[error("empty query string")]
    #[diagnostic(code(citeloom::input::empty_query))]
    EmptyQuery,

    #[error("unknown filter key '{key}'")]
    #[diagnostic(
        code(citeloom::input::unknown_filter),
        help("Filterable payload keys are listed in the vector index contract.")
    )]
    UnknownFilterKey { key: String },
}

/// Failures fetching or parsing source content.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ExtractError {
    #[error("http status {status} fetching source")]
    #[diagnostic(code(citeloom::extract::http))]
    Http { status: u16 },

    #[error("network failure: {0}")]
    #[diagnostic(code(citeloom::extract::network))]
    Network(String),

    #[error("fetch timed out")]
    #[diagnostic(code(citeloom::extract::timeout))]
    Timeout,

    #[error("unsupported format: {0}")]
    #[diagnostic(code(citeloom::extract::unsupported))]
    Unsupported(String),

    #[error("unparseable content: {0}")]
    #[diagnostic(code(citeloom::extract::parse))]
    Parse(String),
}

impl ExtractError {
    pub fn is_transient(&self) -> bool {
        match self {
            ExtractError::Http { status } => *status == 429 || *status >= 500,
            ExtractError::Network(_) | ExtractError::Timeout => true,
            ExtractError::Unsupported(_) | ExtractError::Parse(_) => false,
        }
    }
}

/// Failures from the LLM or embedding providers.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ProviderError {
    #[error("provider call timed out")]
    #[diagnostic(code(citeloom::provider::timeout))]
    Timeout,

    #[error("provider rate limited")]
    #[diagnostic(code(citeloom::provider::rate_limited))]
    RateLimited,

    #[error("provider returned status {status}")]
    #[diagnostic(code(citeloom::provider::http))]
    Http { status: u16 },

    #[error("provider response malformed: {0}")]
    #[diagnostic(code(citeloom::provider::malformed))]
    Malformed(String),

    #[error("provider error: {0}")]
    #[diagnostic(code(citeloom::provider::other))]
    Other(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::RateLimited => true,
            ProviderError::Http { status } => *status == 429 || *status >= 500,
            ProviderError::Malformed(_) => false,
            ProviderError::Other(_) => true,
        }
    }
}

/// Failures writing to or reading from one of the four backends.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum StoreError {
    #[error("backend unavailable: {message}")]
    #[diagnostic(code(citeloom::store::backend))]
    Backend { message: String },

    #[error("graph transaction failed: {message}")]
    #[diagnostic(
        code(citeloom::store::transaction),
        help("Re-ingesting the same doc_id is idempotent; deterministic keys compensate.")
    )]
    Transaction { message: String },

    #[error("serialization failure: {message}")]
    #[diagnostic(code(citeloom::store::serde))]
    Serialization { message: String },

    #[error("collection '{collection}' has dim={actual_dim}/{actual_metric}, config expects dim={expected_dim}/{expected_metric}")]
    #[diagnostic(
        code(citeloom::store::collection_mismatch),
        help("The embedding dim and distance metric come from config, never inferred.")
    )]
    CollectionMismatch {
        collection: String,
        expected_dim: usize,
        actual_dim: usize,
        expected_metric: String,
        actual_metric: String,
    },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend { .. })
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        StoreError::Backend {
            message: err.to_string(),
        }
    }
}

/// Job-level failure produced by one pipeline run. The worker classifies this
/// into retry-or-fail.
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Input(#[from] InputError),

    #[error("extraction failed: {0}")]
    #[diagnostic(code(citeloom::pipeline::extract))]
    Extraction(#[from] ExtractError),

    #[error("screening failed: {0}")]
    #[diagnostic(code(citeloom::pipeline::screen))]
    Screening(#[source] ProviderError),

    #[error("transform failed: {message}")]
    #[diagnostic(code(citeloom::pipeline::transform))]
    Transform { message: String },

    #[error("embedding failed: {0}")]
    #[diagnostic(code(citeloom::pipeline::embed))]
    Embedding(#[source] ProviderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("stage {stage} timed out after {seconds}s")]
    #[diagnostic(code(citeloom::pipeline::stage_timeout))]
    StageTimeout { stage: &'static str, seconds: u64 },

    #[error("job cancelled")]
    #[diagnostic(code(citeloom::pipeline::cancelled))]
    Cancelled,

    #[error("internal invariant violation: {message}")]
    #[diagnostic(code(citeloom::pipeline::internal))]
    Internal { message: String },
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Input(_) => false,
            PipelineError::Extraction(err) => err.is_transient(),
            PipelineError::Screening(err) | PipelineError::Embedding(err) => err.is_transient(),
            PipelineError::Transform { .. } => true,
            PipelineError::Store(err) => err.is_transient(),
            PipelineError::StageTimeout { .. } => true,
            PipelineError::Cancelled => false,
            PipelineError::Internal { .. } => false,
        }
    }

    /// Wire-format error kind for job rows, SSE `error` events, and API
    /// envelopes.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            PipelineError::Input(_) => "invalid_input",
            PipelineError::Extraction(err) => {
                if err.is_transient() {
                    "extraction_error.transient"
                } else {
                    "extraction_error.permanent"
                }
            }
            PipelineError::Screening(_) => "screening_error",
            PipelineError::Transform { .. } => "transform_error",
            PipelineError::Embedding(_) => "embedding_error",
            PipelineError::Store(StoreError::Transaction { .. }) => {
                "store_error.transaction_failed"
            }
            PipelineError::Store(_) => "store_error.backend_unavailable",
            PipelineError::StageTimeout { stage, .. } => match *stage {
                "screen" => "screening_error",
                "transform" => "transform_error",
                "chunk_embed" => "embedding_error",
                "store" | "provenance" => "store_error.backend_unavailable",
                _ => "extraction_error.transient",
            },
            PipelineError::Cancelled => "cancelled",
            PipelineError::Internal { .. } => "internal",
        }
    }
}

/// Errors from JobManager operations (submit/status/cancel/retry).
#[derive(Debug, Error, Diagnostic)]
pub enum JobError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Input(#[from] InputError),

    #[error("active job {existing} already ingesting {doc_id}")]
    #[diagnostic(
        code(citeloom::jobs::duplicate),
        help("Set duplicate_policy=reuse to short-circuit to the existing job instead.")
    )]
    Duplicate { doc_id: DocId, existing: JobId },

    #[error("job not found: {job_id}")]
    #[diagnostic(code(citeloom::jobs::not_found))]
    NotFound { job_id: JobId },

    #[error("job {job_id} is in terminal state {status}")]
    #[diagnostic(code(citeloom::jobs::terminal))]
    TerminalState { job_id: JobId, status: String },

    #[error("job {job_id} is not in FAILED state")]
    #[diagnostic(code(citeloom::jobs::not_failed))]
    NotFailed { job_id: JobId },

    #[error("job {job_id} has exhausted its retry attempts")]
    #[diagnostic(code(citeloom::jobs::attempts_exhausted))]
    AttemptsExhausted { job_id: JobId },

    #[error("submission rate limit exceeded")]
    #[diagnostic(code(citeloom::jobs::rate_limited))]
    RateLimited,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced to query callers.
#[derive(Debug, Error, Diagnostic)]
pub enum QueryError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Input(#[from] InputError),

    #[error("answer cites out-of-range sources: {indices:?}")]
    #[diagnostic(
        code(citeloom::query::invalid_citation_index),
        help("Every [k] marker must fall inside the citation table accompanying the answer.")
    )]
    InvalidCitationIndex { indices: Vec<usize> },

    #[error("provider failure: {0}")]
    #[diagnostic(code(citeloom::query::provider))]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    pub fn wire_kind(&self) -> &'static str {
        match self {
            QueryError::Input(InputError::UnknownFilterKey { .. }) => "invalid_filter",
            QueryError::Input(_) => "invalid_input",
            QueryError::InvalidCitationIndex { .. } => "citation_validation_error",
            QueryError::Provider(_) => "provider_error",
            QueryError::Store(_) => "store_error.backend_unavailable",
        }
    }
}
