//! Vector retrieval: query embedding, filter conversion, deterministic
//! ranking.
//!
//! Caller-supplied filters are a JSON map; conversion into the vector
//! store's native expression rejects unknown keys up front so typos surface
//! as `InvalidFilter` instead of silently matching nothing.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::errors::{InputError, QueryError};
use crate::providers::Embedder;
use crate::stores::{Filter, FilterCond, ScoredPoint, VectorStore};

/// Payload keys the filter layer understands; everything else is rejected.
pub const FILTERABLE_KEYS: &[&str] = &[
    "doc_id",
    "chunk_id",
    "ordinal",
    "source_type",
    "tier",
    "tags",
    "url",
    "title",
    "quality_score",
    "published_at",
    "video_id",
    "channel",
    "page_number",
    "timestamp_start",
    "timestamp_end",
];

/// Convert a caller filter map into the store's native filter: scalars become
/// equality, arrays become membership, `{gte,lte}` objects become ranges.
pub fn convert_filters(filters: &Map<String, Value>) -> Result<Filter, InputError> {
    let mut must = Vec::with_capacity(filters.len());
    for (key, value) in filters {
        if !FILTERABLE_KEYS.contains(&key.as_str()) {
            return Err(InputError::UnknownFilterKey { key: key.clone() });
        }
        let cond = match value {
            Value::Array(items) => FilterCond::In(key.clone(), items.clone()),
            Value::Object(bounds) => {
                let min = bounds.get("gte").cloned();
                let max = bounds.get("lte").cloned();
                if min.is_none() && max.is_none() {
                    return Err(InputError::UnknownFilterKey {
                        key: format!("{key} (expected gte/lte bounds)"),
                    });
                }
                FilterCond::Range {
                    field: key.clone(),
                    min,
                    max,
                }
            }
            scalar => FilterCond::Eq(key.clone(), scalar.clone()),
        };
        must.push(cond);
    }
    Ok(Filter { must })
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, vectors: Arc<dyn VectorStore>) -> Self {
        Self { embedder, vectors }
    }

    /// Embed the query and search the index. For identical inputs over an
    /// identical index this returns an identical hit order: score descending,
    /// ties by ordinal then chunk_id.
    #[instrument(skip(self, filters), fields(top_k), err)]
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        min_score: f32,
        filters: &Map<String, Value>,
    ) -> Result<Vec<ScoredPoint>, QueryError> {
        if query.trim().is_empty() {
            return Err(QueryError::Input(InputError::EmptyQuery));
        }
        let filter = convert_filters(filters).map_err(QueryError::Input)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let vector = vectors.into_iter().next().ok_or_else(|| {
            QueryError::Provider(crate::errors::ProviderError::Malformed(
                "embedder returned no query vector".to_string(),
            ))
        })?;

        let hits = self.vectors.search(&vector, top_k, min_score, &filter).await?;
        debug!(hits = hits.len(), "vector search complete");
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::HashEmbedder;
    use crate::stores::{InMemoryVectorStore, VectorPoint};
    use crate::ids::{ChunkId, DocId};
    use serde_json::json;

    fn filters(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn conversion_covers_eq_in_and_range() {
        let converted = convert_filters(&filters(json!({
            "source_type": "youtube",
            "tier": ["A", "B"],
            "published_at": {"gte": "2024-01-01T00:00:00Z"},
        })))
        .unwrap();
        assert_eq!(converted.must.len(), 3);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = convert_filters(&filters(json!({"vibe": "good"}))).unwrap_err();
        assert!(matches!(err, InputError::UnknownFilterKey { .. }));

        let err = convert_filters(&filters(json!({"published_at": {"between": 1}}))).unwrap_err();
        assert!(matches!(err, InputError::UnknownFilterKey { .. }));
    }

    async fn seeded_retriever() -> Retriever {
        let embedder = Arc::new(HashEmbedder::new(64));
        let vectors = Arc::new(InMemoryVectorStore::new(64));
        let texts = [
            ("urn:cl:chunk:a", "the radium institute in paris", "youtube"),
            ("urn:cl:chunk:b", "a history of radium research", "web"),
            ("urn:cl:chunk:c", "cooking with cast iron pans", "web"),
        ];
        let mut points = Vec::new();
        for (i, (id, text, source)) in texts.iter().enumerate() {
            let vector = embedder.embed(&[text.to_string()]).await.unwrap().remove(0);
            points.push(VectorPoint {
                chunk_id: ChunkId::from(*id),
                doc_id: DocId::from(format!("urn:cl:doc:{i}").as_str()),
                ordinal: 0,
                vector,
                payload: json!({"source_type": source, "text": text, "ordinal": 0}),
            });
        }
        vectors.upsert(points).await.unwrap();
        Retriever::new(embedder, vectors)
    }

    #[tokio::test]
    async fn empty_query_is_invalid_and_zero_k_is_empty() {
        let retriever = seeded_retriever().await;
        let err = retriever
            .search("   ", 5, 0.0, &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Input(InputError::EmptyQuery)
        ));

        let hits = retriever.search("radium", 0, 0.0, &Map::new()).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn search_ranks_relevant_chunks_and_honors_filters() {
        let retriever = seeded_retriever().await;
        let hits = retriever.search("radium", 3, 0.0, &Map::new()).await.unwrap();
        assert!(hits.len() >= 2);
        assert!(hits[0].score >= hits[1].score);

        let filtered = retriever
            .search(
                "radium",
                3,
                0.0,
                &filters(json!({"source_type": "youtube"})),
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].chunk_id.as_str(), "urn:cl:chunk:a");
    }

    #[tokio::test]
    async fn identical_searches_return_identical_order() {
        let retriever = seeded_retriever().await;
        let a = retriever.search("radium research", 3, 0.0, &Map::new()).await.unwrap();
        let b = retriever.search("radium research", 3, 0.0, &Map::new()).await.unwrap();
        assert_eq!(a, b);
    }
}
