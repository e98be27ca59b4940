//! Engine composition: wires config, stores, providers, the job manager,
//! the worker pool, and the retrieval services into one running system.
//!
//! The builder owns dependency selection (swap any backend or provider); the
//! started engine owns the worker tasks and the housekeeping loop. Startup
//! validates the vector collection's dimensionality and metric against
//! config — a mismatch is fatal, never silently adapted to.

use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use miette::Diagnostic;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::citations::AnswerService;
use crate::config::EngineConfig;
use crate::errors::StoreError;
use crate::extract::ExtractorRegistry;
use crate::jobs::{spawn_workers, JobManager, PriorityQueue, StatusStore};
use crate::pipeline::PipelineRunner;
use crate::providers::{mock, ChatModel, Embedder};
use crate::provenance::ProvenanceStore;
use crate::progress::ProgressBus;
use crate::retrieval::Retriever;
use crate::screening::Screener;
use crate::stores::{
    BlobStore, GraphStore, InMemoryBlobStore, InMemoryGraphStore, InMemoryMetaStore,
    InMemoryVectorStore, MetaStore, VectorStore,
};
use crate::transform::{Annotator, PatternAnnotator};

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    #[diagnostic(code(citeloom::engine::config))]
    Config(String),
}

pub struct EngineBuilder {
    config: EngineConfig,
    meta: Option<Arc<dyn MetaStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
    vectors: Option<Arc<dyn VectorStore>>,
    graph: Option<Arc<dyn GraphStore>>,
    chat: Option<Arc<dyn ChatModel>>,
    embedder: Option<Arc<dyn Embedder>>,
    annotator: Option<Arc<dyn Annotator>>,
    extractors: ExtractorRegistry,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            meta: None,
            blobs: None,
            vectors: None,
            graph: None,
            chat: None,
            embedder: None,
            annotator: None,
            extractors: ExtractorRegistry::new(),
        }
    }

    #[must_use]
    pub fn meta(mut self, meta: Arc<dyn MetaStore>) -> Self {
        self.meta = Some(meta);
        self
    }

    #[must_use]
    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    #[must_use]
    pub fn vectors(mut self, vectors: Arc<dyn VectorStore>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    #[must_use]
    pub fn graph(mut self, graph: Arc<dyn GraphStore>) -> Self {
        self.graph = Some(graph);
        self
    }

    #[must_use]
    pub fn chat(mut self, chat: Arc<dyn ChatModel>) -> Self {
        self.chat = Some(chat);
        self
    }

    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn annotator(mut self, annotator: Arc<dyn Annotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    #[must_use]
    pub fn extractors(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = extractors;
        self
    }

    /// Validate, wire, and start workers. Fails fast on a vector collection
    /// dim/metric mismatch.
    #[instrument(skip(self), err)]
    pub async fn start(self) -> Result<Engine, EngineError> {
        let config = self.config;
        let dim = config.embedding.dim;

        let meta = self
            .meta
            .unwrap_or_else(|| Arc::new(InMemoryMetaStore::new()));
        let blobs = self
            .blobs
            .unwrap_or_else(|| Arc::new(InMemoryBlobStore::new()));
        let vectors = self
            .vectors
            .unwrap_or_else(|| Arc::new(InMemoryVectorStore::new(dim)));
        let graph = self
            .graph
            .unwrap_or_else(|| Arc::new(InMemoryGraphStore::new()));
        let chat = self
            .chat
            .unwrap_or_else(|| Arc::new(mock::StubModel::default()));
        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(mock::HashEmbedder::new(dim)));
        let annotator = self
            .annotator
            .unwrap_or_else(|| Arc::new(PatternAnnotator::new()));

        if embedder.dim() != dim {
            return Err(EngineError::Config(format!(
                "embedder reports dim {}, config declares {dim}",
                embedder.dim()
            )));
        }
        let collection = vectors
            .ensure_collection(&config.vector_collection_name, dim, config.embedding.distance)
            .await?;
        info!(
            collection = %collection.name,
            dim = collection.dim,
            metric = collection.distance.as_str(),
            "vector collection validated"
        );

        let provenance = Arc::new(ProvenanceStore::new(
            meta.clone(),
            blobs,
            vectors.clone(),
            graph.clone(),
        ));
        let status = Arc::new(StatusStore::new(
            meta,
            Duration::from_secs(config.status_ttl_seconds),
        ));
        let queue = Arc::new(PriorityQueue::new());
        let bus = ProgressBus::default();
        let screener = Arc::new(Screener::new(chat.clone(), config.screening.clone()));
        let per_second = std::num::NonZeroU32::new(config.provider_calls_per_second.max(1))
            .unwrap_or(std::num::NonZeroU32::MIN);
        let provider_limiter: Arc<DefaultDirectRateLimiter> =
            Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        let manager = Arc::new(JobManager::new(
            config.clone(),
            queue.clone(),
            status.clone(),
            bus.clone(),
        ));
        let pipeline = Arc::new(PipelineRunner::new(
            config.clone(),
            self.extractors,
            screener.clone(),
            annotator,
            embedder.clone(),
            provenance.clone(),
            status.clone(),
            bus.clone(),
            provider_limiter,
        ));
        let workers = spawn_workers(
            config.worker_pool_size,
            queue.clone(),
            manager.clone(),
            pipeline,
        );

        let answers = Arc::new(AnswerService::new(
            Retriever::new(embedder, vectors),
            chat,
            graph,
        ));

        let housekeeping = spawn_housekeeping(
            bus.clone(),
            status.clone(),
            screener.clone(),
            config.heartbeat_seconds,
        );

        info!(workers = config.worker_pool_size, "engine started");
        Ok(Engine {
            config,
            manager,
            answers,
            provenance,
            bus,
            queue,
            workers: Mutex::new(workers),
            housekeeping: Mutex::new(Some(housekeeping)),
        })
    }
}

fn spawn_housekeeping(
    bus: ProgressBus,
    status: Arc<StatusStore>,
    screener: Arc<Screener>,
    heartbeat_seconds: u64,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(heartbeat_seconds.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            bus.heartbeat_idle(interval);
            let pruned = status.prune_terminal();
            if pruned > 0 {
                info!(pruned, "pruned terminal job snapshots");
            }
            screener.cache().prune();
        }
    })
}

/// A running ingestion and retrieval engine.
pub struct Engine {
    config: EngineConfig,
    manager: Arc<JobManager>,
    answers: Arc<AnswerService>,
    provenance: Arc<ProvenanceStore>,
    bus: ProgressBus,
    queue: Arc<PriorityQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn answers(&self) -> &Arc<AnswerService> {
        &self.answers
    }

    pub fn provenance(&self) -> &Arc<ProvenanceStore> {
        &self.provenance
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.bus
    }

    /// Cooperative shutdown: close the queue, let workers drain at their
    /// next stage boundary, stop housekeeping.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.queue.close();
        let workers = {
            let mut guard = self.workers.lock();
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker join failed during shutdown");
            }
        }
        if let Some(housekeeping) = self.housekeeping.lock().take() {
            housekeeping.abort();
        }
        info!("engine stopped");
    }
}
