//! The ingestion pipeline: Extract → Screen → Transform → Chunk+Embed →
//! Store → Provenance.
//!
//! One worker runs one job end-to-end. At every stage boundary the runner
//! checks the job's cancellation flag, emits a progress event, and persists a
//! status snapshot carrying the cumulative stage weight. Stages are
//! idempotent given their inputs: all IDs are deterministic and every write
//! is an upsert, so re-running after a transient failure never duplicates
//! rows.

pub mod chunk;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::try_join_all;
use governor::DefaultDirectRateLimiter;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use crate::config::EngineConfig;
use crate::errors::{ExtractError, PipelineError, ProviderError};
use crate::extract::{sniff_source_type, youtube_video_id, ExtractorRegistry, RawContent};
use crate::ids::IdService;
use crate::jobs::{IngestResult, Job, StatusStore};
use crate::model::{Chunk, Document, SourceDetails, SourceType};
use crate::progress::{ProgressBus, ProgressEvent};
use crate::providers::Embedder;
use crate::provenance::{IngestBundle, ProvenanceStore};
use crate::screening::{ScreenDecision, Screener};
use crate::transform::{link_annotation, Annotator, DocAnnotation};

use chunk::{format_timestamp, timestamp_range, Chunker};

/// Pipeline stages in execution order, each with a deterministic share of
/// the job's progress. Weights sum to 100.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Screen,
    Transform,
    ChunkEmbed,
    Store,
    Provenance,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Extract,
        Stage::Screen,
        Stage::Transform,
        Stage::ChunkEmbed,
        Stage::Store,
        Stage::Provenance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Screen => "screen",
            Stage::Transform => "transform",
            Stage::ChunkEmbed => "chunk_embed",
            Stage::Store => "store",
            Stage::Provenance => "provenance",
        }
    }

    pub fn weight(&self) -> u8 {
        match self {
            Stage::Extract => 15,
            Stage::Screen => 10,
            Stage::Transform => 20,
            Stage::ChunkEmbed => 25,
            Stage::Store => 25,
            Stage::Provenance => 5,
        }
    }

    fn timeout(&self, config: &EngineConfig) -> Duration {
        let seconds = match self {
            Stage::Extract => config.stage_timeout.extract,
            Stage::Screen => config.stage_timeout.screen,
            Stage::Transform => config.stage_timeout.transform,
            // Chunk+Embed applies the embed timeout per call, not per stage.
            Stage::ChunkEmbed => config.stage_timeout.embed,
            Stage::Store | Stage::Provenance => config.stage_timeout.store,
        };
        Duration::from_secs(seconds)
    }
}

pub struct PipelineRunner {
    config: EngineConfig,
    ids: IdService,
    extractors: ExtractorRegistry,
    screener: Arc<Screener>,
    annotator: Arc<dyn Annotator>,
    embedder: Arc<dyn Embedder>,
    provenance: Arc<ProvenanceStore>,
    status: Arc<StatusStore>,
    bus: ProgressBus,
    chunker: Chunker,
    provider_limiter: Arc<DefaultDirectRateLimiter>,
}

impl PipelineRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        extractors: ExtractorRegistry,
        screener: Arc<Screener>,
        annotator: Arc<dyn Annotator>,
        embedder: Arc<dyn Embedder>,
        provenance: Arc<ProvenanceStore>,
        status: Arc<StatusStore>,
        bus: ProgressBus,
        provider_limiter: Arc<DefaultDirectRateLimiter>,
    ) -> Self {
        let ids = IdService::new(config.url_tracking_params_to_strip.clone());
        let chunker = Chunker::new(config.chunk);
        Self {
            config,
            ids,
            extractors,
            screener,
            annotator,
            embedder,
            provenance,
            status,
            bus,
            chunker,
            provider_limiter,
        }
    }

    /// Run the full pipeline for one job. The caller (worker) owns the
    /// RUNNING/terminal transitions; this only mutates stage/progress fields.
    #[instrument(skip(self, job, cancel), fields(job_id = %job.job_id, doc_id = %job.doc_id), err)]
    pub async fn run(
        &self,
        job: &mut Job,
        cancel: Arc<AtomicBool>,
    ) -> Result<IngestResult, PipelineError> {
        self.bus.publish(
            &job.job_id,
            ProgressEvent::JobStarted {
                job_id: job.job_id.clone(),
                url: job.url.clone(),
                timestamp: Utc::now(),
            },
        );

        // -- Extract --------------------------------------------------------
        let started = self.begin_stage(job, &cancel, Stage::Extract).await?;
        let url = self
            .ids
            .normalize_url(&job.url)
            .map_err(PipelineError::Input)?;
        let source_type = sniff_source_type(&url);
        let extractor = self
            .extractors
            .get(source_type)
            .map_err(PipelineError::Extraction)?;
        let raw = timeout(Stage::Extract.timeout(&self.config), extractor.extract(&url))
            .await
            .map_err(|_| PipelineError::StageTimeout {
                stage: Stage::Extract.name(),
                seconds: self.config.stage_timeout.extract,
            })?
            .map_err(PipelineError::Extraction)?;
        if raw.text.trim().is_empty() {
            return Err(PipelineError::Extraction(ExtractError::Parse(
                "extractor produced no text".to_string(),
            )));
        }
        self.complete_stage(job, Stage::Extract, started).await;

        // -- Screen ---------------------------------------------------------
        let started = self.begin_stage(job, &cancel, Stage::Screen).await?;
        let verdict = timeout(
            Stage::Screen.timeout(&self.config),
            self.screener.screen(&raw.text),
        )
        .await
        .map_err(|_| PipelineError::StageTimeout {
            stage: Stage::Screen.name(),
            seconds: self.config.stage_timeout.screen,
        })?
        .map_err(PipelineError::Screening)?;
        self.complete_stage(job, Stage::Screen, started).await;

        if verdict.decision == ScreenDecision::Reject {
            // A rejection is a normal terminal outcome: nothing is stored and
            // the job completes with no tier.
            info!(doc_id = %job.doc_id, score = verdict.quality_score, "screening rejected content");
            job.progress_pct = 100;
            return Ok(IngestResult {
                doc_id: job.doc_id.clone(),
                tier: None,
                title: raw.title.clone(),
                chunk_count: 0,
                entity_count: 0,
                relation_count: 0,
            });
        }
        let tier = verdict
            .tier(&self.config.quality_tier_thresholds)
            .ok_or_else(|| PipelineError::Internal {
                message: "accepted verdict produced no tier".to_string(),
            })?;

        // -- Transform ------------------------------------------------------
        let started = self.begin_stage(job, &cancel, Stage::Transform).await?;
        let annotation = timeout(
            Stage::Transform.timeout(&self.config),
            self.annotator.annotate(&raw.text),
        )
        .await
        .map_err(|_| PipelineError::StageTimeout {
            stage: Stage::Transform.name(),
            seconds: self.config.stage_timeout.transform,
        })?
        .map_err(|err| PipelineError::Transform {
            message: err.to_string(),
        })?;
        self.complete_stage(job, Stage::Transform, started).await;

        // -- Chunk + Embed --------------------------------------------------
        let started = self.begin_stage(job, &cancel, Stage::ChunkEmbed).await?;
        let document = self.build_document(job, &url, source_type, &raw, &annotation, tier, verdict.quality_score);
        let mut chunks = self.build_chunks(&document, source_type, &raw)?;
        self.embed_chunks(job, &cancel, &mut chunks).await?;
        self.complete_stage(job, Stage::ChunkEmbed, started).await;

        let knowledge = link_annotation(&self.ids, &annotation, &chunks);
        let bundle = IngestBundle {
            document: document.clone(),
            blob_bytes: raw.bytes.clone(),
            content_type: raw.content_type.clone(),
            chunks,
            tags: annotation.tags.clone(),
            mentions: knowledge.mentions,
            entities: knowledge.entities,
            relations: knowledge.relations,
        };

        // -- Store ----------------------------------------------------------
        let started = self.begin_stage(job, &cancel, Stage::Store).await?;
        timeout(
            Stage::Store.timeout(&self.config),
            self.provenance.write_content(&bundle),
        )
        .await
        .map_err(|_| PipelineError::StageTimeout {
            stage: Stage::Store.name(),
            seconds: self.config.stage_timeout.store,
        })??;
        self.complete_stage(job, Stage::Store, started).await;

        // -- Provenance -----------------------------------------------------
        let started = self.begin_stage(job, &cancel, Stage::Provenance).await?;
        timeout(
            Stage::Provenance.timeout(&self.config),
            self.provenance.commit_graph(&bundle),
        )
        .await
        .map_err(|_| PipelineError::StageTimeout {
            stage: Stage::Provenance.name(),
            seconds: self.config.stage_timeout.store,
        })??;
        self.complete_stage(job, Stage::Provenance, started).await;

        Ok(IngestResult {
            doc_id: document.doc_id.clone(),
            tier: Some(tier),
            title: document.title.clone(),
            chunk_count: bundle.chunks.len(),
            entity_count: bundle.entities.len(),
            relation_count: bundle.relations.len(),
        })
    }

    async fn begin_stage(
        &self,
        job: &mut Job,
        cancel: &AtomicBool,
        stage: Stage,
    ) -> Result<Instant, PipelineError> {
        if cancel.load(Ordering::SeqCst) {
            return Err(PipelineError::Cancelled);
        }
        job.current_stage = Some(stage.name().to_string());
        self.status.put_quiet(job).await;
        self.bus.publish(
            &job.job_id,
            ProgressEvent::StageStarted {
                job_id: job.job_id.clone(),
                stage: stage.name(),
                timestamp: Utc::now(),
            },
        );
        debug!(stage = stage.name(), "stage started");
        Ok(Instant::now())
    }

    async fn complete_stage(&self, job: &mut Job, stage: Stage, started: Instant) {
        job.progress_pct = (job.progress_pct + stage.weight()).min(100);
        job.stages_completed.push(stage.name().to_string());
        self.status.put_quiet(job).await;
        self.bus.publish(
            &job.job_id,
            ProgressEvent::StageCompleted {
                job_id: job.job_id.clone(),
                stage: stage.name(),
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            },
        );
        self.bus.publish(
            &job.job_id,
            ProgressEvent::StageProgress {
                job_id: job.job_id.clone(),
                stage: stage.name(),
                percent: job.progress_pct,
                message: None,
                timestamp: Utc::now(),
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn build_document(
        &self,
        job: &Job,
        url: &url::Url,
        source_type: SourceType,
        raw: &RawContent,
        annotation: &DocAnnotation,
        tier: crate::model::Tier,
        quality_score: f64,
    ) -> Document {
        let mut metadata = rustc_hash::FxHashMap::default();
        metadata.insert("summary".to_string(), json!(annotation.summary));
        metadata.insert("key_points".to_string(), json!(annotation.key_points));
        metadata.insert("tags".to_string(), json!(annotation.tags));
        if let Some(duration) = raw.duration_seconds {
            metadata.insert("duration_seconds".to_string(), json!(duration));
        }
        if source_type == SourceType::Youtube {
            let video_id = raw
                .video_id
                .clone()
                .or_else(|| youtube_video_id(url))
                .unwrap_or_default();
            metadata.insert("video_id".to_string(), json!(video_id));
            if let Some(channel) = &raw.channel {
                metadata.insert("channel".to_string(), json!(channel));
            }
        }
        Document {
            doc_id: job.doc_id.clone(),
            source_url: url.to_string(),
            source_type,
            title: raw.title.clone(),
            author: raw.author.clone(),
            published_at: raw.published_at,
            quality_score,
            tier,
            created_at: Utc::now(),
            metadata,
        }
    }

    fn build_chunks(
        &self,
        document: &Document,
        source_type: SourceType,
        raw: &RawContent,
    ) -> Result<Vec<Chunk>, PipelineError> {
        let slices = self.chunker.split(&raw.text);
        if slices.is_empty() {
            return Err(PipelineError::Internal {
                message: "chunker produced no chunks for non-empty text".to_string(),
            });
        }
        let mut chunks = Vec::with_capacity(slices.len());
        for (ordinal, slice) in slices.into_iter().enumerate() {
            let details = match source_type {
                SourceType::Web => SourceDetails::Web,
                SourceType::Pdf => SourceDetails::Pdf {
                    page_number: page_for_offset(raw.page_breaks.as_deref(), slice.byte_start),
                },
                SourceType::Youtube => {
                    let lines = raw.transcript.as_deref().ok_or_else(|| {
                        PipelineError::Extraction(ExtractError::Parse(
                            "youtube source missing transcript mapping".to_string(),
                        ))
                    })?;
                    let (start, end) = timestamp_range(lines, slice.byte_start, slice.byte_end)
                        .ok_or_else(|| {
                            PipelineError::Extraction(ExtractError::Parse(
                                "chunk not covered by transcript timeline".to_string(),
                            ))
                        })?;
                    let video_id = document
                        .metadata
                        .get("video_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    SourceDetails::Youtube {
                        video_id,
                        channel: raw.channel.clone(),
                        timestamp_start: format_timestamp(start),
                        timestamp_end: format_timestamp(end),
                    }
                }
            };
            chunks.push(Chunk {
                chunk_id: self
                    .ids
                    .chunk_id(&document.doc_id, slice.byte_start, slice.byte_end),
                doc_id: document.doc_id.clone(),
                ordinal,
                text: slice.text,
                byte_start: slice.byte_start,
                byte_end: slice.byte_end,
                details,
                embedding: None,
            });
        }
        Ok(chunks)
    }

    /// Fan embedding calls out to a bounded sub-pool; the global token bucket
    /// throttles provider traffic across jobs. Cancellation is honored
    /// between sub-tasks; in-flight calls finish and their results are
    /// discarded by the caller's unwind.
    async fn embed_chunks(
        &self,
        job: &Job,
        cancel: &Arc<AtomicBool>,
        chunks: &mut [Chunk],
    ) -> Result<(), PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.config.effective_embed_concurrency()));
        let per_call_timeout = Stage::ChunkEmbed.timeout(&self.config);
        let total = chunks.len();
        let done = AtomicUsize::new(0);
        let base_pct = job.progress_pct;

        let tasks = chunks.iter().map(|chunk| {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let text = chunk.text.clone();
            let done = &done;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| PipelineError::Cancelled)?;
                if cancel.load(Ordering::SeqCst) {
                    return Err(PipelineError::Cancelled);
                }
                self.provider_limiter.until_ready().await;
                let vectors = timeout(per_call_timeout, self.embedder.embed(&[text]))
                    .await
                    .map_err(|_| PipelineError::Embedding(ProviderError::Timeout))?
                    .map_err(PipelineError::Embedding)?;
                let vector = vectors.into_iter().next().ok_or_else(|| {
                    PipelineError::Embedding(ProviderError::Malformed(
                        "embedder returned no vector".to_string(),
                    ))
                })?;
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                if finished % 8 == 0 || finished == total {
                    let fraction = finished as f64 / total as f64;
                    let pct = base_pct as f64
                        + Stage::ChunkEmbed.weight() as f64 * fraction * 0.9;
                    self.bus.publish(
                        &job.job_id,
                        ProgressEvent::StageProgress {
                            job_id: job.job_id.clone(),
                            stage: Stage::ChunkEmbed.name(),
                            percent: (pct as u8).min(100),
                            message: Some(format!("{finished}/{total} chunks embedded")),
                            timestamp: Utc::now(),
                        },
                    );
                }
                Ok::<Vec<f32>, PipelineError>(vector)
            }
        });

        let vectors = try_join_all(tasks).await?;
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.embedding = Some(vector);
        }
        Ok(())
    }
}

/// 1-based page number for a byte offset given page-break offsets.
fn page_for_offset(page_breaks: Option<&[usize]>, offset: usize) -> Option<u32> {
    let breaks = page_breaks?;
    let page = breaks.iter().filter(|b| **b <= offset).count() as u32 + 1;
    Some(page)
}
