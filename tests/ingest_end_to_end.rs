//! End-to-end ingestion scenarios over the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use citeloom::config::EngineConfig;
use citeloom::engine::Engine;
use citeloom::errors::{ExtractError, ProviderError};
use citeloom::extract::{fake, Extractor, ExtractorRegistry, RawContent};
use citeloom::ids::JobId;
use citeloom::jobs::{JobOptions, JobStatus};
use citeloom::model::{SourceDetails, SourceType, Tier};
use citeloom::progress::{ProgressEvent, ProgressStream};
use citeloom::transform::{Annotator, DocAnnotation, PatternAnnotator};
use url::Url;

const ARTICLE: &str = "Marie Curie joined Paris University in 1906. \
Curie later founded Radium Institute to continue the work on radioactivity. \
The institute trained a generation of physicists and chemists in radiation science. \
Radium Institute is based in Paris. \
She published \"Treatise on Radioactivity\" in 1910, which became a standard reference. \
The treatise covered measurement techniques, decay chains, and laboratory practice in depth.";

/// Delays extraction so tests can subscribe to the stream before the first
/// event fires.
struct DelayedExtractor<E> {
    inner: E,
    delay: Duration,
}

#[async_trait]
impl<E: Extractor> Extractor for DelayedExtractor<E> {
    async fn extract(&self, url: &Url) -> Result<RawContent, ExtractError> {
        tokio::time::sleep(self.delay).await;
        self.inner.extract(url).await
    }
}

/// Annotator that stalls long enough for a cancel to land mid-transform.
struct SlowAnnotator {
    inner: PatternAnnotator,
    delay: Duration,
}

#[async_trait]
impl Annotator for SlowAnnotator {
    async fn annotate(&self, text: &str) -> Result<DocAnnotation, ProviderError> {
        tokio::time::sleep(self.delay).await;
        self.inner.annotate(text).await
    }
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default().with_workers(2).with_embedding_dim(64);
    config.retry_base_seconds = 0.02;
    config.retry_max_seconds = 0.1;
    config
}

async fn wait_terminal(engine: &Engine, job_id: &JobId) -> citeloom::jobs::Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = engine
            .manager()
            .status(job_id)
            .await
            .expect("status")
            .expect("job exists");
        if job.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job did not reach a terminal state: {:?}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn collect_events(mut stream: ProgressStream) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), stream.recv()).await {
            Ok(Some(event)) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
            _ => break,
        }
    }
    events
}

#[tokio::test]
async fn happy_path_web_ingest() {
    let extractor = fake::StaticExtractor::new()
        .with_page("https://example.com/a", fake::web_page(ARTICLE, "Curie"))
        .with_page("https://example.com/warmup", fake::web_page(ARTICLE, "Warmup"));
    let registry = ExtractorRegistry::new().with(
        SourceType::Web,
        Arc::new(DelayedExtractor {
            inner: extractor,
            delay: Duration::from_millis(100),
        }),
    );
    // One worker: the warmup job below keeps it busy so the subscription to
    // the target job's stream is in place before its first event fires.
    let engine = Engine::builder(fast_config().with_workers(1))
        .extractors(registry)
        .start()
        .await
        .unwrap();

    engine
        .manager()
        .submit("https://example.com/warmup", 9, JobOptions::default())
        .await
        .unwrap();

    // The tracking param is stripped before the doc_id is derived.
    let receipt = engine
        .manager()
        .submit("https://example.com/a?utm_source=x", 5, JobOptions::default())
        .await
        .unwrap();
    let stream = engine.manager().stream(&receipt.job_id).await.unwrap();
    let events = collect_events(stream).await;

    let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds.first(), Some(&"job_started"));
    assert_eq!(kinds.last(), Some(&"job_completed"));
    for stage in ["extract", "screen", "transform", "chunk_embed", "store", "provenance"] {
        assert!(
            events.iter().any(|e| matches!(
                e,
                ProgressEvent::StageStarted { stage: s, .. } if *s == stage
            )),
            "missing stage_started for {stage}"
        );
    }
    // Progress percentages only ever increase.
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::StageProgress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));

    let job = wait_terminal(&engine, &receipt.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress_pct, 100);
    assert_eq!(job.attempts, 1);
    assert_eq!(
        job.stages_completed,
        vec!["extract", "screen", "transform", "chunk_embed", "store", "provenance"]
    );

    let doc = engine
        .provenance()
        .get_document(&receipt.doc_id)
        .await
        .unwrap()
        .expect("document stored");
    assert_eq!(doc.tier, Tier::B);
    assert_eq!(doc.source_url, "https://example.com/a");

    let chunks = engine
        .provenance()
        .get_chunks_by_doc(&receipt.doc_id)
        .await
        .unwrap();
    assert!(!chunks.is_empty());
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.ordinal, i);
        assert!(chunk.byte_end > chunk.byte_start);
    }
    // Chunks tile the text: first starts at zero, no gaps between neighbors.
    assert_eq!(chunks[0].byte_start, 0);
    assert_eq!(chunks.last().unwrap().byte_end, ARTICLE.len());
    for pair in chunks.windows(2) {
        assert!(pair[1].byte_start <= pair[0].byte_end);
    }

    let entities = engine
        .provenance()
        .get_entities_by_doc(&receipt.doc_id)
        .await
        .unwrap();
    assert!(entities.len() >= 3, "expected entities, got {entities:?}");
    assert!(engine.provenance().has_provenance(&receipt.doc_id).await.unwrap());

    engine.shutdown().await;
}

#[tokio::test]
async fn reingest_is_idempotent() {
    let page = fake::web_page(ARTICLE, "Curie");
    let extractor = fake::StaticExtractor::new().with_page("https://example.com/a", page);
    let registry = ExtractorRegistry::new().with(SourceType::Web, Arc::new(extractor));
    let engine = Engine::builder(fast_config())
        .extractors(registry)
        .start()
        .await
        .unwrap();

    let first = engine
        .manager()
        .submit("https://example.com/a", 5, JobOptions::default())
        .await
        .unwrap();
    wait_terminal(&engine, &first.job_id).await;
    let chunks_a = engine
        .provenance()
        .get_chunks_by_doc(&first.doc_id)
        .await
        .unwrap();
    let entities_a = engine
        .provenance()
        .get_entities_by_doc(&first.doc_id)
        .await
        .unwrap();

    let second = engine
        .manager()
        .submit("https://example.com/a", 5, JobOptions::default())
        .await
        .unwrap();
    assert_eq!(second.doc_id, first.doc_id);
    wait_terminal(&engine, &second.job_id).await;

    let chunks_b = engine
        .provenance()
        .get_chunks_by_doc(&first.doc_id)
        .await
        .unwrap();
    let ids_a: Vec<_> = chunks_a.iter().map(|c| c.chunk_id.clone()).collect();
    let ids_b: Vec<_> = chunks_b.iter().map(|c| c.chunk_id.clone()).collect();
    assert_eq!(ids_a, ids_b, "chunk ids must be stable across re-ingest");

    let entities_b = engine
        .provenance()
        .get_entities_by_doc(&first.doc_id)
        .await
        .unwrap();
    let eids_a: Vec<_> = entities_a.iter().map(|e| e.entity_id.clone()).collect();
    let eids_b: Vec<_> = entities_b.iter().map(|e| e.entity_id.clone()).collect();
    assert_eq!(eids_a, eids_b, "entity ids must be stable across re-ingest");

    engine.shutdown().await;
}

#[tokio::test]
async fn youtube_ingest_carries_timestamps() {
    let lines: Vec<String> = (0..30)
        .map(|i| format!("transcript line {i} about radium research and laboratory work"))
        .collect();
    let line_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let content = fake::youtube_transcript(&line_refs, "VID", "science-channel", 4.0);

    let url = "https://www.youtube.com/watch?v=VID";
    let extractor = fake::StaticExtractor::new().with_page(url, content);
    let registry = ExtractorRegistry::new().with(SourceType::Youtube, Arc::new(extractor));

    let mut config = fast_config();
    config = config.with_chunking(400, 80);
    let engine = Engine::builder(config).extractors(registry).start().await.unwrap();

    let receipt = engine
        .manager()
        .submit(url, 5, JobOptions::default())
        .await
        .unwrap();
    let job = wait_terminal(&engine, &receipt.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let doc = engine
        .provenance()
        .get_document(&receipt.doc_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.source_type, SourceType::Youtube);
    assert_eq!(doc.metadata["video_id"], serde_json::json!("VID"));

    let chunks = engine
        .provenance()
        .get_chunks_by_doc(&receipt.doc_id)
        .await
        .unwrap();
    assert!(chunks.len() > 1);
    for chunk in &chunks {
        match &chunk.details {
            SourceDetails::Youtube {
                video_id,
                channel,
                timestamp_start,
                timestamp_end,
            } => {
                assert_eq!(video_id, "VID");
                assert_eq!(channel.as_deref(), Some("science-channel"));
                assert!(!timestamp_start.is_empty());
                assert!(timestamp_end >= timestamp_start);
            }
            other => panic!("expected youtube details, got {other:?}"),
        }
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn transient_failure_retries_to_completion() {
    let extractor = fake::StaticExtractor::new()
        .with_page("https://example.com/flaky", fake::web_page(ARTICLE, "Flaky"))
        .fail_times(ExtractError::Http { status: 503 }, 1);
    let registry = ExtractorRegistry::new().with(SourceType::Web, Arc::new(extractor));
    let engine = Engine::builder(fast_config())
        .extractors(registry)
        .start()
        .await
        .unwrap();

    let receipt = engine
        .manager()
        .submit("https://example.com/flaky", 5, JobOptions::default())
        .await
        .unwrap();
    let job = wait_terminal(&engine, &receipt.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2, "one transient failure, one success");

    // No duplicate rows from the failed attempt.
    let chunks = engine
        .provenance()
        .get_chunks_by_doc(&receipt.doc_id)
        .await
        .unwrap();
    let mut ids: Vec<_> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
    ids.dedup();
    assert_eq!(ids.len(), chunks.len());

    engine.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_fails_once_and_writes_nothing() {
    let extractor = fake::StaticExtractor::new(); // every URL 404s
    let registry = ExtractorRegistry::new().with(SourceType::Web, Arc::new(extractor));
    let engine = Engine::builder(fast_config())
        .extractors(registry)
        .start()
        .await
        .unwrap();

    let receipt = engine
        .manager()
        .submit("https://example.com/gone", 5, JobOptions::default())
        .await
        .unwrap();
    let job = wait_terminal(&engine, &receipt.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1, "permanent failures are not retried");
    assert_eq!(
        job.error.as_ref().map(|e| e.error_kind.as_str()),
        Some("extraction_error.permanent")
    );

    assert!(engine
        .provenance()
        .get_document(&receipt.doc_id)
        .await
        .unwrap()
        .is_none());
    assert!(engine
        .provenance()
        .get_chunks_by_doc(&receipt.doc_id)
        .await
        .unwrap()
        .is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn cancellation_mid_transform_freezes_progress() {
    let extractor = fake::StaticExtractor::new()
        .with_page("https://example.com/slow", fake::web_page(ARTICLE, "Slow"));
    let registry = ExtractorRegistry::new().with(
        SourceType::Web,
        Arc::new(DelayedExtractor {
            inner: extractor,
            delay: Duration::from_millis(150),
        }),
    );
    let engine = Engine::builder(fast_config())
        .extractors(registry)
        .annotator(Arc::new(SlowAnnotator {
            inner: PatternAnnotator::new(),
            delay: Duration::from_millis(400),
        }))
        .start()
        .await
        .unwrap();

    let receipt = engine
        .manager()
        .submit("https://example.com/slow", 5, JobOptions::default())
        .await
        .unwrap();
    let mut stream = engine.manager().stream(&receipt.job_id).await.unwrap();

    // Wait until the transform stage is underway, then cancel.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("event before timeout")
            .expect("stream open");
        if matches!(
            event,
            ProgressEvent::StageStarted { stage: "transform", .. }
        ) {
            break;
        }
    }
    engine.manager().cancel(&receipt.job_id).await.unwrap();

    let job = wait_terminal(&engine, &receipt.job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.progress_pct < 100, "cancelled progress stays frozen");

    // Nothing reached the vector or graph stores for this doc.
    assert!(engine
        .provenance()
        .get_chunks_by_doc(&receipt.doc_id)
        .await
        .unwrap()
        .is_empty());
    assert!(!engine
        .provenance()
        .has_provenance(&receipt.doc_id)
        .await
        .unwrap());

    // Cancelled docs can be resubmitted.
    let again = engine
        .manager()
        .submit("https://example.com/slow", 5, JobOptions::default())
        .await
        .unwrap();
    assert!(!again.reused);

    engine.shutdown().await;
}

#[tokio::test]
async fn screening_reject_completes_without_storing() {
    use citeloom::providers::mock::ScriptedChat;

    let extractor = fake::StaticExtractor::new()
        .with_page("https://example.com/spam", fake::web_page(ARTICLE, "Spam"));
    let registry = ExtractorRegistry::new().with(SourceType::Web, Arc::new(extractor));
    let engine = Engine::builder(fast_config())
        .extractors(registry)
        .chat(Arc::new(ScriptedChat::new(vec![ScriptedChat::screening(
            1.5, "REJECT",
        )])))
        .start()
        .await
        .unwrap();

    let receipt = engine
        .manager()
        .submit("https://example.com/spam", 5, JobOptions::default())
        .await
        .unwrap();
    let job = wait_terminal(&engine, &receipt.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress_pct, 100);
    let result = job.result.expect("result present");
    assert_eq!(result.tier, None);
    assert_eq!(result.chunk_count, 0);

    assert!(engine
        .provenance()
        .get_document(&receipt.doc_id)
        .await
        .unwrap()
        .is_none());

    engine.shutdown().await;
}
