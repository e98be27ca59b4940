//! Quality screening with a content-addressed decision cache.
//!
//! The cache key is the hash of the extracted normalized text, not the URL,
//! so the same article syndicated at several URLs is screened once. Entries
//! expire after the configured TTL; a miss calls the chat provider.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::{ScreeningConfig, TierThresholds};
use crate::errors::ProviderError;
use crate::model::Tier;
use crate::providers::ChatModel;

/// Verdict from the screening model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScreenDecision {
    Accept,
    Reject,
    Maybe,
}

/// A screening outcome, cached per content hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScreenVerdict {
    pub quality_score: f64,
    pub decision: ScreenDecision,
    pub reasoning: String,
    pub tokens_used: u32,
    pub cost_usd: f64,
}

impl ScreenVerdict {
    pub fn tier(&self, thresholds: &TierThresholds) -> Option<Tier> {
        match self.decision {
            ScreenDecision::Reject => None,
            ScreenDecision::Accept | ScreenDecision::Maybe => {
                Some(Tier::from_score(self.quality_score, thresholds))
            }
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    verdict: ScreenVerdict,
    inserted_at: Instant,
}

/// TTL cache keyed by content hash.
#[derive(Clone)]
pub struct ScreeningCache {
    entries: Arc<RwLock<FxHashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl ScreeningCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(FxHashMap::default())),
            ttl,
        }
    }

    pub fn get(&self, content_hash: &str) -> Option<ScreenVerdict> {
        let entries = self.entries.read();
        let entry = entries.get(content_hash)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.verdict.clone())
    }

    pub fn put(&self, content_hash: String, verdict: ScreenVerdict) {
        self.entries.write().insert(
            content_hash,
            CacheEntry {
                verdict,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries; called opportunistically by the engine.
    pub fn prune(&self) {
        self.entries
            .write()
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

const SCREEN_SYSTEM_PROMPT: &str = "You are a content quality screener. \
Given a document excerpt, reply with a single JSON object: \
{\"quality_score\": <float 0-10>, \"decision\": \"ACCEPT\"|\"REJECT\"|\"MAYBE\", \
\"reasoning\": \"<one sentence>\"}. Reply with JSON only.";

/// Maximum characters of document text handed to the screening model.
const SCREEN_EXCERPT_CHARS: usize = 4000;

#[derive(Deserialize)]
struct RawVerdict {
    quality_score: f64,
    decision: ScreenDecision,
    #[serde(default)]
    reasoning: String,
}

/// Screens extracted content via the chat provider, memoized by content hash.
pub struct Screener {
    chat: Arc<dyn ChatModel>,
    cache: ScreeningCache,
    config: ScreeningConfig,
}

impl Screener {
    pub fn new(chat: Arc<dyn ChatModel>, config: ScreeningConfig) -> Self {
        let cache = ScreeningCache::new(Duration::from_secs(config.cache_ttl_seconds));
        Self {
            chat,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &ScreeningCache {
        &self.cache
    }

    #[instrument(skip(self, text), err)]
    pub async fn screen(&self, text: &str) -> Result<ScreenVerdict, ProviderError> {
        let key = crate::ids::content_hash(text);
        if let Some(hit) = self.cache.get(&key) {
            debug!(content_hash = %key, "screening cache hit");
            return Ok(hit);
        }

        let excerpt: String = text.chars().take(SCREEN_EXCERPT_CHARS).collect();
        let response = self.chat.complete(SCREEN_SYSTEM_PROMPT, &excerpt).await?;
        let parsed: RawVerdict = serde_json::from_str(extract_json(&response.text))
            .map_err(|err| {
                ProviderError::Malformed(format!(
                    "screening response was not valid JSON: {err} (model {})",
                    self.config.model
                ))
            })?;

        let verdict = ScreenVerdict {
            quality_score: parsed.quality_score.clamp(0.0, 10.0),
            decision: parsed.decision,
            reasoning: parsed.reasoning,
            tokens_used: response.tokens_used,
            cost_usd: response.cost_usd,
        };
        self.cache.put(key, verdict.clone());
        Ok(verdict)
    }
}

/// Models often wrap JSON in prose or code fences; take the outermost object.
fn extract_json(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end >= start => &text[start..=end],
        _ => text,
    }
}
