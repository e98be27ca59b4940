//! Query, citation, and pagination scenarios over an ingested corpus.

use std::sync::Arc;
use std::time::Duration;

use citeloom::citations::{validate_answer, QueryRequest, NO_SOURCES_ANSWER};
use citeloom::config::EngineConfig;
use citeloom::engine::Engine;
use citeloom::errors::{InputError, QueryError};
use citeloom::extract::{fake, ExtractorRegistry};
use citeloom::jobs::JobOptions;
use citeloom::model::SourceType;
use serde_json::json;

fn corpus_text() -> String {
    (0..12)
        .map(|i| {
            format!(
                "Radium research finding number {i}: laboratories measured decay chains \
and radiation exposure with increasing precision over the years. "
            )
        })
        .collect()
}

async fn engine_with_corpus() -> (Engine, citeloom::ids::DocId) {
    let text = corpus_text();
    let extractor = fake::StaticExtractor::new()
        .with_page("https://example.com/radium", fake::web_page(&text, "Radium"));
    let registry = ExtractorRegistry::new().with(SourceType::Web, Arc::new(extractor));

    let mut config = EngineConfig::default()
        .with_workers(1)
        .with_embedding_dim(64)
        .with_chunking(120, 20);
    config.retry_base_seconds = 0.02;
    let engine = Engine::builder(config)
        .extractors(registry)
        .start()
        .await
        .unwrap();

    let receipt = engine
        .manager()
        .submit("https://example.com/radium", 5, JobOptions::default())
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = engine
            .manager()
            .status(&receipt.job_id)
            .await
            .unwrap()
            .unwrap();
        if job.is_terminal() {
            assert_eq!(job.status, citeloom::jobs::JobStatus::Completed);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "ingest timed out");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (engine, receipt.doc_id)
}

#[tokio::test]
async fn query_returns_self_consistent_answer_and_citations() {
    let (engine, doc_id) = engine_with_corpus().await;

    let response = engine
        .answers()
        .answer(QueryRequest {
            query: "radium decay chains".into(),
            top_k: Some(5),
            ..QueryRequest::default()
        })
        .await
        .unwrap();

    assert!(!response.citations.is_empty());
    for (i, citation) in response.citations.iter().enumerate() {
        assert_eq!(citation.index, i + 1);
        assert_eq!(citation.doc_id, doc_id);
        assert!(citation.byte_end > citation.byte_start);
        assert!(!citation.quote_text.is_empty());
    }
    // Every marker in the answer refers into the accompanying table.
    validate_answer(&response.answer, response.citations.len()).unwrap();

    engine.shutdown().await;
}

#[tokio::test]
async fn pagination_renumbers_from_one() {
    let (engine, _) = engine_with_corpus().await;

    let response = engine
        .answers()
        .answer(QueryRequest {
            query: "radium research finding".into(),
            top_k: Some(10),
            page: Some(2),
            page_size: Some(3),
            ..QueryRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(response.page, 2);
    assert_eq!(response.citations.len(), 3);
    let indices: Vec<usize> = response.citations.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![1, 2, 3]);

    // Markers in the answer stay inside the page's renumbered range.
    let validated = validate_answer(&response.answer, 3).unwrap();
    assert!(validated.cited_indices.iter().all(|k| (1..=3).contains(k)));

    // A past-the-end page yields the explicit no-sources answer.
    let empty = engine
        .answers()
        .answer(QueryRequest {
            query: "radium research finding".into(),
            top_k: Some(10),
            page: Some(50),
            page_size: Some(3),
            ..QueryRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(empty.answer, NO_SOURCES_ANSWER);
    assert!(empty.citations.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn mutated_marker_fails_validation() {
    let valid = "Measured decay chains are documented [1] and [2].";
    assert!(validate_answer(valid, 3).is_ok());

    let mutated = valid.replace("[2]", "[9]");
    match validate_answer(&mutated, 3) {
        Err(QueryError::InvalidCitationIndex { indices }) => assert_eq!(indices, vec![9]),
        other => panic!("expected InvalidCitationIndex, got {other:?}"),
    }
}

#[tokio::test]
async fn boundary_inputs_are_handled() {
    let (engine, _) = engine_with_corpus().await;

    // Empty query: rejected.
    let err = engine
        .answers()
        .answer(QueryRequest {
            query: "  ".into(),
            ..QueryRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Input(InputError::EmptyQuery)));

    // top_k = 0: empty hits, explicit no-sources answer, empty citations.
    let response = engine
        .answers()
        .answer(QueryRequest {
            query: "radium".into(),
            top_k: Some(0),
            ..QueryRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(response.answer, NO_SOURCES_ANSWER);
    assert!(response.citations.is_empty());
    assert_eq!(response.total_hits, 0);

    // Unknown filter keys are rejected up front.
    let err = engine
        .answers()
        .answer(QueryRequest {
            query: "radium".into(),
            filters: json!({"mood": "curious"}).as_object().cloned().unwrap(),
            ..QueryRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::Input(InputError::UnknownFilterKey { .. })
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn source_type_filter_restricts_hits() {
    let (engine, _) = engine_with_corpus().await;

    let hits = engine
        .answers()
        .answer(QueryRequest {
            query: "radium".into(),
            top_k: Some(5),
            filters: json!({"source_type": "youtube"}).as_object().cloned().unwrap(),
            ..QueryRequest::default()
        })
        .await
        .unwrap();
    // The corpus is all web documents; a youtube filter matches nothing.
    assert_eq!(hits.answer, NO_SOURCES_ANSWER);
    assert!(hits.citations.is_empty());

    engine.shutdown().await;
}
