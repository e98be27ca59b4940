//! Engine configuration.
//!
//! Every recognized key has a documented default; `EngineConfig::from_env`
//! applies environment overrides after loading `.env` via dotenvy, mirroring
//! how the runtime resolves its database name elsewhere in this codebase.

use serde::{Deserialize, Serialize};

use crate::ids::default_tracking_params;

/// What to do when a URL is resubmitted while a prior job is still active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Short-circuit to the existing job id.
    Reuse,
    /// Fail the submission with a duplicate error.
    Reject,
}

/// Distance metric of the vector collection. Only cosine is specified today;
/// the enum keeps the config honest about what the index was built with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    Cosine,
}

impl Distance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distance::Cosine => "cosine",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            a: 9.0,
            b: 7.0,
            c: 5.0,
            d: 0.0,
        }
    }
}

/// Per-stage timeouts in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub extract: u64,
    pub screen: u64,
    pub transform: u64,
    pub embed: u64,
    pub store: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            extract: 60,
            screen: 15,
            transform: 120,
            embed: 10,
            store: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub target_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_chars: 1000,
            overlap_chars: 200,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    /// Declared output dimensionality; validated against the live collection
    /// at startup, never inferred.
    pub dim: usize,
    pub distance: Distance,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "mock-embed-384".to_string(),
            dim: 384,
            distance: Distance::Cosine,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScreeningConfig {
    pub provider: String,
    pub model: String,
    pub cache_ttl_seconds: u64,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "mock-screen".to_string(),
            cache_ttl_seconds: 24 * 60 * 60,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub worker_pool_size: usize,
    /// Embedding fan-out bound within one job; `None` resolves to
    /// `min(8, worker_pool_size * 2)`.
    pub embed_concurrency_per_job: Option<usize>,
    pub priority_levels: u8,
    pub max_retry_attempts: u32,
    pub retry_base_seconds: f64,
    pub retry_max_seconds: f64,
    pub stage_timeout: StageTimeouts,
    pub chunk: ChunkConfig,
    pub embedding: EmbeddingConfig,
    pub screening: ScreeningConfig,
    pub vector_collection_name: String,
    pub quality_tier_thresholds: TierThresholds,
    pub url_tracking_params_to_strip: Vec<String>,
    pub duplicate_policy: DuplicatePolicy,
    pub heartbeat_seconds: u64,
    /// Terminal job rows are pruned from the status cache after this long.
    pub status_ttl_seconds: u64,
    /// Global outbound provider calls per second (token bucket).
    pub provider_calls_per_second: u32,
    /// Accepted `POST /ingest` submissions per second before 429.
    pub submit_rate_per_second: u32,
    pub sqlite_db_name: Option<String>,
}

/// Absolute ceiling on retry attempts, regardless of configuration.
pub const MAX_ATTEMPTS_CEILING: u32 = 10;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            embed_concurrency_per_job: None,
            priority_levels: 10,
            max_retry_attempts: 3,
            retry_base_seconds: 2.0,
            retry_max_seconds: 60.0,
            stage_timeout: StageTimeouts::default(),
            chunk: ChunkConfig::default(),
            embedding: EmbeddingConfig::default(),
            screening: ScreeningConfig::default(),
            vector_collection_name: "content_chunks".to_string(),
            quality_tier_thresholds: TierThresholds::default(),
            url_tracking_params_to_strip: default_tracking_params(),
            duplicate_policy: DuplicatePolicy::Reuse,
            heartbeat_seconds: 15,
            status_ttl_seconds: 60 * 60,
            provider_calls_per_second: 50,
            submit_rate_per_second: 20,
            sqlite_db_name: None,
        }
    }
}

impl EngineConfig {
    /// Defaults plus environment overrides. Looks for `.env` first so local
    /// runs behave like deployed ones.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<usize>("CITELOOM_WORKER_POOL_SIZE") {
            cfg.worker_pool_size = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("CITELOOM_EMBED_CONCURRENCY") {
            cfg.embed_concurrency_per_job = Some(v.max(1));
        }
        if let Some(v) = env_parse::<u32>("CITELOOM_MAX_RETRY_ATTEMPTS") {
            cfg.max_retry_attempts = v;
        }
        if let Some(v) = env_parse::<f64>("CITELOOM_RETRY_BASE_SECONDS") {
            cfg.retry_base_seconds = v;
        }
        if let Some(v) = env_parse::<f64>("CITELOOM_RETRY_MAX_SECONDS") {
            cfg.retry_max_seconds = v;
        }
        if let Some(v) = env_parse::<usize>("CITELOOM_EMBEDDING_DIM") {
            cfg.embedding.dim = v;
        }
        if let Ok(v) = std::env::var("CITELOOM_VECTOR_COLLECTION") {
            cfg.vector_collection_name = v;
        }
        if let Ok(v) = std::env::var("CITELOOM_DUPLICATE_POLICY") {
            match v.as_str() {
                "reject" => cfg.duplicate_policy = DuplicatePolicy::Reject,
                "reuse" => cfg.duplicate_policy = DuplicatePolicy::Reuse,
                other => {
                    tracing::warn!(policy = %other, "unknown duplicate policy, keeping default")
                }
            }
        }
        if let Some(v) = env_parse::<u64>("CITELOOM_HEARTBEAT_SECONDS") {
            cfg.heartbeat_seconds = v.max(1);
        }
        if let Ok(v) = std::env::var("CITELOOM_SQLITE_DB_NAME") {
            cfg.sqlite_db_name = Some(v);
        }
        cfg
    }

    /// Effective retry cap: configured value clamped to the absolute ceiling.
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_retry_attempts.clamp(1, MAX_ATTEMPTS_CEILING)
    }

    /// Effective embedding fan-out bound for one job.
    pub fn effective_embed_concurrency(&self) -> usize {
        self.embed_concurrency_per_job
            .unwrap_or_else(|| (self.worker_pool_size * 2).min(8))
            .max(1)
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_pool_size = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    #[must_use]
    pub fn with_chunking(mut self, target_chars: usize, overlap_chars: usize) -> Self {
        self.chunk = ChunkConfig {
            target_chars,
            overlap_chars,
        };
        self
    }

    #[must_use]
    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding.dim = dim;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.chunk.target_chars, 1000);
        assert_eq!(cfg.chunk.overlap_chars, 200);
        assert_eq!(cfg.stage_timeout.extract, 60);
        assert_eq!(cfg.stage_timeout.screen, 15);
        assert_eq!(cfg.heartbeat_seconds, 15);
        assert_eq!(cfg.quality_tier_thresholds.a, 9.0);
        assert_eq!(cfg.vector_collection_name, "content_chunks");
        assert_eq!(cfg.duplicate_policy, DuplicatePolicy::Reuse);
    }

    #[test]
    fn embed_concurrency_resolves_from_workers() {
        let cfg = EngineConfig::default().with_workers(2);
        assert_eq!(cfg.effective_embed_concurrency(), 4);
        let wide = EngineConfig::default().with_workers(16);
        assert_eq!(wide.effective_embed_concurrency(), 8);
    }

    #[test]
    fn attempts_are_clamped_to_ceiling() {
        let mut cfg = EngineConfig::default();
        cfg.max_retry_attempts = 50;
        assert_eq!(cfg.effective_max_attempts(), MAX_ATTEMPTS_CEILING);
        cfg.max_retry_attempts = 0;
        assert_eq!(cfg.effective_max_attempts(), 1);
    }
}
