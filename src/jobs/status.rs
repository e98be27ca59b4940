//! Job status cache backed by the durable metadata store.
//!
//! Reads are served from the in-memory snapshot when present (the running
//! worker is the only writer for its own job, so the snapshot is always at
//! least as fresh as the durable row). Terminal jobs are pruned from the
//! cache after a TTL; the durable row remains queryable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::errors::StoreError;
use crate::ids::JobId;
use crate::stores::MetaStore;

use super::types::Job;

struct CacheSlot {
    job: Job,
    terminal_since: Option<Instant>,
}

pub struct StatusStore {
    meta: Arc<dyn MetaStore>,
    cache: RwLock<FxHashMap<String, CacheSlot>>,
    ttl: Duration,
}

impl StatusStore {
    pub fn new(meta: Arc<dyn MetaStore>, ttl: Duration) -> Self {
        Self {
            meta,
            cache: RwLock::new(FxHashMap::default()),
            ttl,
        }
    }

    /// Persist a job snapshot: cache first (so readers see progress
    /// immediately), then the durable row.
    pub async fn put(&self, job: &Job) -> Result<(), StoreError> {
        {
            let mut cache = self.cache.write();
            let terminal_since = job.is_terminal().then(Instant::now);
            cache.insert(
                job.job_id.as_str().to_string(),
                CacheSlot {
                    job: job.clone(),
                    terminal_since,
                },
            );
        }
        self.meta.upsert_job(job).await
    }

    /// Snapshot merge: cached progress wins over the durable row.
    pub async fn get(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        if let Some(slot) = self.cache.read().get(job_id.as_str()) {
            return Ok(Some(slot.job.clone()));
        }
        self.meta.get_job(job_id).await
    }

    pub fn get_cached(&self, job_id: &JobId) -> Option<Job> {
        self.cache.read().get(job_id.as_str()).map(|s| s.job.clone())
    }

    /// Drop terminal entries older than the TTL. Returns how many were
    /// pruned.
    pub fn prune_terminal(&self) -> usize {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, slot| match slot.terminal_since {
            Some(at) => at.elapsed() <= self.ttl,
            None => true,
        });
        before - cache.len()
    }

    /// Best-effort persist used on paths where a store hiccup must not mask
    /// the original pipeline outcome.
    pub async fn put_quiet(&self, job: &Job) {
        if let Err(err) = self.put(job).await {
            warn!(job_id = %job.job_id, error = %err, "failed to persist job snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DocId;
    use crate::jobs::types::{JobStatus, QueueBucket};
    use crate::stores::InMemoryMetaStore;

    fn job(id: &str) -> Job {
        Job::new(
            JobId::from(id),
            DocId::from("urn:cl:doc:d"),
            "https://example.com/a".into(),
            5,
            3,
            QueueBucket::Imports,
        )
    }

    #[tokio::test]
    async fn put_then_get_round_trips_via_cache_and_store() {
        let meta = Arc::new(InMemoryMetaStore::new());
        let status = StatusStore::new(meta.clone(), Duration::from_secs(60));
        let j = job("urn:cl:job:1");
        status.put(&j).await.unwrap();
        assert_eq!(status.get(&j.job_id).await.unwrap(), Some(j.clone()));

        // Durable row exists independently of the cache.
        assert_eq!(meta.get_job(&j.job_id).await.unwrap(), Some(j));
    }

    #[tokio::test]
    async fn terminal_entries_prune_but_stay_durable() {
        let meta = Arc::new(InMemoryMetaStore::new());
        let status = StatusStore::new(meta, Duration::from_millis(0));
        let mut j = job("urn:cl:job:2");
        j.status = JobStatus::Completed;
        j.progress_pct = 100;
        status.put(&j).await.unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(status.prune_terminal(), 1);
        assert!(status.get_cached(&j.job_id).is_none());
        // Falls through to the durable row.
        assert_eq!(status.get(&j.job_id).await.unwrap(), Some(j));
    }
}
