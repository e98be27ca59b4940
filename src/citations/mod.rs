//! Retrieval answers with enumerated, verifiable citations.
//!
//! A ranked hit list becomes a numbered citation table; the prompt hands the
//! model exactly those numbered excerpts; validation asserts every `[k]` in
//! the reply stays inside the table. When the caller paginates, the prompt
//! and the answer are generated from the paginated subset only, renumbered
//! from 1 — an answer's markers always refer to an index in the table it
//! ships with.

mod explain;
mod markers;

pub use explain::{explain, ReasoningEdge, ReasoningGraph, ReasoningNode};
pub use markers::{extract_markers, validate_answer, CitationMarker, ValidatedAnswer};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::errors::QueryError;
use crate::ids::{ChunkId, DocId};
use crate::providers::ChatModel;
use crate::retrieval::Retriever;
use crate::stores::{GraphStore, ScoredPoint};

/// Citation quotes are length-capped for prompt and payload size.
const QUOTE_CAP_CHARS: usize = 280;

const DEFAULT_TOP_K: usize = 8;

/// Answer text used when retrieval finds nothing to cite.
pub const NO_SOURCES_ANSWER: &str =
    "No sources matching the query were found; no answer can be given.";

const ANSWER_RULES: &str = "\
Answer using only the numbered sources below.
Rules:
(a) Use only citation indices in [1..{n}].
(b) Place the citation marker [k] immediately after each supported claim.
(c) Claims not supported by a listed source are not permitted.
(d) The allowed citation index range is [1..{n}] inclusive.";

/// One row of the citation table accompanying an answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CitationEntry {
    pub index: usize,
    pub doc_id: DocId,
    pub chunk_id: ChunkId,
    pub doc_url: String,
    pub doc_title: Option<String>,
    /// Page number or timestamp range, when the source type has one.
    pub page_or_timestamp: Option<String>,
    pub byte_start: usize,
    pub byte_end: usize,
    pub quote_text: String,
    pub confidence: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CitationTable {
    entries: Vec<CitationEntry>,
}

impl CitationTable {
    /// Number hits 1..N and cap their quotes. The order of `hits` is
    /// preserved; callers paginate *before* building the table.
    pub fn from_hits(hits: &[ScoredPoint]) -> Self {
        let entries = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| {
                let payload = &hit.payload;
                let quote: String = payload
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .chars()
                    .take(QUOTE_CAP_CHARS)
                    .collect();
                CitationEntry {
                    index: i + 1,
                    doc_id: hit.doc_id.clone(),
                    chunk_id: hit.chunk_id.clone(),
                    doc_url: payload
                        .get("url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    doc_title: payload
                        .get("title")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    page_or_timestamp: locator_from_payload(payload),
                    byte_start: payload
                        .get("byte_start")
                        .and_then(Value::as_u64)
                        .unwrap_or_default() as usize,
                    byte_end: payload
                        .get("byte_end")
                        .and_then(Value::as_u64)
                        .unwrap_or_default() as usize,
                    quote_text: quote,
                    confidence: hit.score,
                }
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[CitationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CitationEntry> {
        index.checked_sub(1).and_then(|i| self.entries.get(i))
    }
}

fn locator_from_payload(payload: &Value) -> Option<String> {
    if let Some(page) = payload.get("page_number").and_then(Value::as_u64) {
        return Some(format!("p. {page}"));
    }
    match (
        payload.get("timestamp_start").and_then(Value::as_str),
        payload.get("timestamp_end").and_then(Value::as_str),
    ) {
        (Some(start), Some(end)) => Some(format!("{start}-{end}")),
        _ => None,
    }
}

/// System and user halves of the generation prompt.
#[derive(Clone, Debug, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Assemble the generation prompt: the rule list (with the index range
/// spelled out) plus the numbered source excerpts and the question.
pub fn build_prompt(query: &str, table: &CitationTable) -> Prompt {
    let system = ANSWER_RULES.replace("{n}", &table.len().to_string());
    let mut user = String::with_capacity(1024);
    user.push_str("Sources:\n");
    for entry in table.entries() {
        user.push_str(&format!("[{}] ", entry.index));
        if let Some(title) = &entry.doc_title {
            user.push_str(title);
            user.push_str(" — ");
        }
        user.push_str(&entry.doc_url);
        if let Some(locator) = &entry.page_or_timestamp {
            user.push_str(&format!(" ({locator})"));
        }
        user.push_str(&format!("\n    \"{}\"\n", entry.quote_text));
    }
    user.push_str(&format!("\nQuestion: {query}\n"));
    Prompt { system, user }
}

/// Query request accepted by the answer endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default)]
    pub filters: Map<String, Value>,
    /// 1-based page over the hit list.
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub citations: Vec<CitationEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_graph: Option<ReasoningGraph>,
    pub page: usize,
    pub page_size: usize,
    pub total_hits: usize,
}

/// Orchestrates search → citation table → prompt → validation → explanation.
pub struct AnswerService {
    retriever: Retriever,
    chat: Arc<dyn ChatModel>,
    graph: Arc<dyn GraphStore>,
}

impl AnswerService {
    pub fn new(retriever: Retriever, chat: Arc<dyn ChatModel>, graph: Arc<dyn GraphStore>) -> Self {
        Self {
            retriever,
            chat,
            graph,
        }
    }

    #[instrument(skip(self, request), fields(query_len = request.query.len()), err)]
    pub async fn answer(&self, request: QueryRequest) -> Result<QueryResponse, QueryError> {
        let top_k = request.top_k.unwrap_or(DEFAULT_TOP_K);
        let min_score = request.min_score.unwrap_or(0.0);
        let hits = self
            .retriever
            .search(&request.query, top_k, min_score, &request.filters)
            .await?;
        let total_hits = hits.len();

        // Pagination happens before the table is built: the prompt and the
        // answer only ever see the page's subset, renumbered from 1.
        let page = request.page.unwrap_or(1).max(1);
        let page_size = request.page_size.unwrap_or(top_k.max(1)).max(1);
        let start = (page - 1) * page_size;
        let page_hits: &[ScoredPoint] = if start >= hits.len() {
            &[]
        } else {
            &hits[start..(start + page_size).min(hits.len())]
        };

        if page_hits.is_empty() {
            return Ok(QueryResponse {
                answer: NO_SOURCES_ANSWER.to_string(),
                citations: Vec::new(),
                reasoning_graph: None,
                page,
                page_size,
                total_hits,
            });
        }

        let table = CitationTable::from_hits(page_hits);
        let prompt = build_prompt(&request.query, &table);
        let response = self.chat.complete(&prompt.system, &prompt.user).await?;
        let validated = validate_answer(&response.text, table.len())?;
        info!(
            citations = table.len(),
            cited = validated.cited_indices.len(),
            "answer validated"
        );

        let reasoning = explain(&validated.answer, &table, &self.graph).await?;
        Ok(QueryResponse {
            answer: validated.answer,
            citations: table.entries().to_vec(),
            reasoning_graph: (!reasoning.is_empty()).then_some(reasoning),
            page,
            page_size,
            total_hits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hit(i: usize, text: &str) -> ScoredPoint {
        ScoredPoint {
            chunk_id: ChunkId::from(format!("urn:cl:chunk:{i}").as_str()),
            doc_id: DocId::from("urn:cl:doc:d"),
            ordinal: i,
            score: 1.0 - i as f32 * 0.1,
            payload: json!({
                "text": text,
                "url": "https://example.com/a",
                "title": "Example",
                "byte_start": i * 100,
                "byte_end": i * 100 + text.len(),
            }),
        }
    }

    #[test]
    fn table_numbers_from_one_and_caps_quotes() {
        let long = "x".repeat(2000);
        let hits = vec![hit(0, &long), hit(1, "short")];
        let table = CitationTable::from_hits(&hits);
        assert_eq!(table.len(), 2);
        assert_eq!(table.entries()[0].index, 1);
        assert_eq!(table.entries()[1].index, 2);
        assert_eq!(table.entries()[0].quote_text.chars().count(), 280);
        assert!(table.get(0).is_none());
        assert!(table.get(2).is_some());
    }

    #[test]
    fn locator_prefers_page_then_timestamps() {
        let page = json!({"page_number": 4});
        assert_eq!(locator_from_payload(&page).as_deref(), Some("p. 4"));
        let ts = json!({"timestamp_start": "00:01:00", "timestamp_end": "00:02:00"});
        assert_eq!(
            locator_from_payload(&ts).as_deref(),
            Some("00:01:00-00:02:00")
        );
        assert_eq!(locator_from_payload(&json!({})), None);
    }

    #[test]
    fn prompt_enumerates_sources_and_range() {
        let hits = vec![hit(0, "alpha"), hit(1, "beta"), hit(2, "gamma")];
        let table = CitationTable::from_hits(&hits);
        let prompt = build_prompt("what is alpha?", &table);
        assert!(prompt.system.contains("[1..3] inclusive"));
        assert!(prompt.user.contains("[1] Example"));
        assert!(prompt.user.contains("\"gamma\""));
        assert!(prompt.user.contains("Question: what is alpha?"));
    }
}
