//! In-memory backend implementations.
//!
//! These are the reference implementations of the four store traits:
//! deterministic, lock-protected maps with the same MERGE semantics a real
//! backend provides. Tests and local runs use them directly.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value};

use crate::config::Distance;
use crate::errors::StoreError;
use crate::ids::{ChunkId, DocId, EntityId, ExportId, JobId};
use crate::jobs::Job;
use crate::model::{Document, Entity, ExportArtifact, Relation};

use super::{
    BlobStore, CollectionInfo, EdgeType, Filter, GraphEdge, GraphNode, GraphStore, GraphTx,
    MetaStore, NodeLabel, ProcessingRecord, ScoredPoint, VectorPoint, VectorStore,
};

// ---------------------------------------------------------------------------
// MetaStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryMetaStore {
    documents: RwLock<FxHashMap<String, Document>>,
    jobs: RwLock<FxHashMap<String, Job>>,
    records: RwLock<Vec<ProcessingRecord>>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn upsert_document(&self, document: &Document) -> Result<(), StoreError> {
        self.documents
            .write()
            .insert(document.doc_id.as_str().to_string(), document.clone());
        Ok(())
    }

    async fn get_document(&self, doc_id: &DocId) -> Result<Option<Document>, StoreError> {
        Ok(self.documents.read().get(doc_id.as_str()).cloned())
    }

    async fn delete_document(&self, doc_id: &DocId) -> Result<(), StoreError> {
        self.documents.write().remove(doc_id.as_str());
        self.records
            .write()
            .retain(|r| r.doc_id.as_str() != doc_id.as_str());
        Ok(())
    }

    async fn list_document_ids(&self) -> Result<Vec<DocId>, StoreError> {
        let mut ids: Vec<DocId> = self
            .documents
            .read()
            .values()
            .map(|d| d.doc_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs
            .write()
            .insert(job.job_id.as_str().to_string(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().get(job_id.as_str()).cloned())
    }

    async fn record_processing(&self, record: &ProcessingRecord) -> Result<(), StoreError> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn processing_records(
        &self,
        doc_id: &DocId,
    ) -> Result<Vec<ProcessingRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.doc_id.as_str() == doc_id.as_str())
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// BlobStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<FxHashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(
        &self,
        doc_id: &DocId,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.blobs
            .write()
            .insert(doc_id.as_str().to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, doc_id: &DocId) -> Result<Option<(Vec<u8>, String)>, StoreError> {
        Ok(self.blobs.read().get(doc_id.as_str()).cloned())
    }

    async fn exists(&self, doc_id: &DocId) -> Result<bool, StoreError> {
        Ok(self.blobs.read().contains_key(doc_id.as_str()))
    }

    async fn delete(&self, doc_id: &DocId) -> Result<(), StoreError> {
        self.blobs.write().remove(doc_id.as_str());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VectorStore
// ---------------------------------------------------------------------------

/// Cosine-distance vector index over a lock-protected map. The declared
/// dimensionality plays the role of the live collection's schema: a config
/// mismatch surfaces at `ensure_collection`.
pub struct InMemoryVectorStore {
    dim: usize,
    points: RwLock<FxHashMap<String, VectorPoint>>,
}

impl InMemoryVectorStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            points: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(
        &self,
        name: &str,
        dim: usize,
        distance: Distance,
    ) -> Result<CollectionInfo, StoreError> {
        if dim != self.dim {
            return Err(StoreError::CollectionMismatch {
                collection: name.to_string(),
                expected_dim: dim,
                actual_dim: self.dim,
                expected_metric: distance.as_str().to_string(),
                actual_metric: Distance::Cosine.as_str().to_string(),
            });
        }
        Ok(CollectionInfo {
            name: name.to_string(),
            dim: self.dim,
            distance: Distance::Cosine,
        })
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), StoreError> {
        for point in &points {
            if point.vector.len() != self.dim {
                return Err(StoreError::Serialization {
                    message: format!(
                        "vector for {} has dim {}, collection expects {}",
                        point.chunk_id,
                        point.vector.len(),
                        self.dim
                    ),
                });
            }
        }
        let mut store = self.points.write();
        for point in points {
            store.insert(point.chunk_id.as_str().to_string(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        min_score: f32,
        filter: &Filter,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let mut hits: Vec<ScoredPoint> = self
            .points
            .read()
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| ScoredPoint {
                chunk_id: p.chunk_id.clone(),
                doc_id: p.doc_id.clone(),
                ordinal: p.ordinal,
                score: cosine(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .filter(|h| h.score >= min_score)
            .collect();
        // Deterministic order: score desc, ordinal asc, chunk_id lexicographic.
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.ordinal.cmp(&b.ordinal))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn fetch_by_doc(&self, doc_id: &DocId) -> Result<Vec<VectorPoint>, StoreError> {
        let mut points: Vec<VectorPoint> = self
            .points
            .read()
            .values()
            .filter(|p| p.doc_id.as_str() == doc_id.as_str())
            .cloned()
            .collect();
        points.sort_by_key(|p| p.ordinal);
        Ok(points)
    }

    async fn delete_by_doc(&self, doc_id: &DocId) -> Result<(), StoreError> {
        self.points
            .write()
            .retain(|_, p| p.doc_id.as_str() != doc_id.as_str());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

type EdgeKey = (String, String, String);

#[derive(Default)]
struct GraphState {
    nodes: FxHashMap<String, GraphNode>,
    edges: FxHashMap<EdgeKey, GraphEdge>,
}

/// Property graph with MERGE semantics over plain maps. Nodes merge by id,
/// edges by (from, type, to); duplicate relation edges average confidence and
/// union their evidence lists.
#[derive(Default)]
pub struct InMemoryGraphStore {
    state: RwLock<GraphState>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.state.read().edges.len()
    }
}

fn edge_key(edge: &GraphEdge) -> EdgeKey {
    (
        edge.from.clone(),
        edge.edge.as_str().to_string(),
        edge.to.clone(),
    )
}

fn merge_props(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(new)) => {
            for (k, v) in new {
                current.insert(k, v);
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

/// Entity nodes merge by unioning aliases and keeping the max confidence, so
/// concurrent ingests of different documents grow one entity instead of
/// overwriting each other.
fn merge_entity_props(existing: &mut Value, incoming: Value) {
    let mut aliases: Vec<Value> = existing
        .get("aliases")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if let Some(new_aliases) = incoming.get("aliases").and_then(Value::as_array) {
        for alias in new_aliases {
            if !aliases.contains(alias) {
                aliases.push(alias.clone());
            }
        }
    }
    let confidence = existing
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .max(
            incoming
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
        );
    merge_props(existing, incoming);
    existing["aliases"] = Value::Array(aliases);
    existing["confidence"] = json!(confidence);
}

fn merge_relation_props(existing: &mut Value, incoming: &Value) {
    let old_conf = existing
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let new_conf = incoming
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(old_conf);
    let mut evidence: Vec<Value> = existing
        .get("evidence_chunk_ids")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if let Some(new_evidence) = incoming.get("evidence_chunk_ids").and_then(Value::as_array) {
        for item in new_evidence {
            if !evidence.contains(item) {
                evidence.push(item.clone());
            }
        }
    }
    *existing = json!({
        "confidence": (old_conf + new_conf) / 2.0,
        "evidence_chunk_ids": evidence,
    });
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn commit(&self, tx: GraphTx) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for node in tx.nodes {
            match state.nodes.get_mut(&node.id) {
                Some(existing) if node.label == NodeLabel::Entity => {
                    merge_entity_props(&mut existing.props, node.props)
                }
                Some(existing) => merge_props(&mut existing.props, node.props),
                None => {
                    state.nodes.insert(node.id.clone(), node);
                }
            }
        }
        for edge in tx.edges {
            let key = edge_key(&edge);
            match state.edges.get_mut(&key) {
                Some(existing) => {
                    if matches!(edge.edge, EdgeType::Relation(_)) {
                        merge_relation_props(&mut existing.props, &edge.props);
                    } else {
                        merge_props(&mut existing.props, edge.props);
                    }
                }
                None => {
                    state.edges.insert(key, edge);
                }
            }
        }
        Ok(())
    }

    async fn document_exists(&self, doc_id: &DocId) -> Result<bool, StoreError> {
        Ok(self.state.read().nodes.contains_key(doc_id.as_str()))
    }

    async fn entities_by_doc(&self, doc_id: &DocId) -> Result<Vec<Entity>, StoreError> {
        let state = self.state.read();
        let chunk_ids: FxHashSet<&str> = state
            .edges
            .values()
            .filter(|e| e.edge == EdgeType::HasChunk && e.from == doc_id.as_str())
            .map(|e| e.to.as_str())
            .collect();
        collect_mentioned_entities(&state, &chunk_ids)
    }

    async fn entities_for_chunks(
        &self,
        chunk_ids: &[ChunkId],
    ) -> Result<Vec<Entity>, StoreError> {
        let state = self.state.read();
        let wanted: FxHashSet<&str> = chunk_ids.iter().map(|c| c.as_str()).collect();
        collect_mentioned_entities(&state, &wanted)
    }

    async fn relations_from(
        &self,
        entity_id: &EntityId,
        depth: usize,
    ) -> Result<Vec<Relation>, StoreError> {
        let depth = depth.clamp(1, 3);
        let state = self.state.read();
        let mut frontier: FxHashSet<String> = FxHashSet::default();
        frontier.insert(entity_id.as_str().to_string());
        let mut visited = frontier.clone();
        let mut found: Vec<Relation> = Vec::new();

        for _ in 0..depth {
            let mut next: FxHashSet<String> = FxHashSet::default();
            for edge in state.edges.values() {
                let EdgeType::Relation(predicate) = &edge.edge else {
                    continue;
                };
                if !frontier.contains(edge.from.as_str()) {
                    continue;
                }
                let relation = relation_from_edge(edge, *predicate);
                if !found.iter().any(|r| {
                    r.subject == relation.subject
                        && r.predicate == relation.predicate
                        && r.object == relation.object
                }) {
                    found.push(relation);
                }
                if visited.insert(edge.to.clone()) {
                    next.insert(edge.to.clone());
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        found.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.subject.cmp(&b.subject))
                .then_with(|| a.object.cmp(&b.object))
        });
        Ok(found)
    }

    async fn exports_from_doc(&self, doc_id: &DocId) -> Result<Vec<ExportArtifact>, StoreError> {
        let state = self.state.read();
        let mut exports = Vec::new();
        for edge in state.edges.values() {
            if edge.edge != EdgeType::GeneratedFrom || edge.to != doc_id.as_str() {
                continue;
            }
            if let Some(node) = state.nodes.get(&edge.from) {
                let artifact: ExportArtifact = serde_json::from_value(node.props.clone())
                    .map_err(|err| StoreError::Serialization {
                        message: format!("export node {}: {err}", node.id),
                    })?;
                exports.push(artifact);
            }
        }
        exports.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(exports)
    }

    async fn get_export(
        &self,
        export_id: &ExportId,
    ) -> Result<Option<ExportArtifact>, StoreError> {
        let state = self.state.read();
        let Some(node) = state.nodes.get(export_id.as_str()) else {
            return Ok(None);
        };
        let artifact = serde_json::from_value(node.props.clone()).map_err(|err| {
            StoreError::Serialization {
                message: format!("export node {}: {err}", node.id),
            }
        })?;
        Ok(Some(artifact))
    }

    async fn delete_document(&self, doc_id: &DocId) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let chunk_ids: FxHashSet<String> = state
            .edges
            .values()
            .filter(|e| e.edge == EdgeType::HasChunk && e.from == doc_id.as_str())
            .map(|e| e.to.clone())
            .collect();
        let mention_ids: FxHashSet<String> = state
            .nodes
            .values()
            .filter(|n| {
                n.label == NodeLabel::Mention
                    && n.props
                        .get("chunk_id")
                        .and_then(Value::as_str)
                        .is_some_and(|c| chunk_ids.contains(c))
            })
            .map(|n| n.id.clone())
            .collect();

        let mut doomed: FxHashSet<String> = chunk_ids;
        doomed.extend(mention_ids);
        doomed.insert(doc_id.as_str().to_string());

        state.nodes.retain(|id, _| !doomed.contains(id));
        state
            .edges
            .retain(|_, e| !doomed.contains(&e.from) && !doomed.contains(&e.to));
        Ok(())
    }
}

fn relation_from_edge(edge: &GraphEdge, predicate: crate::model::Predicate) -> Relation {
    let confidence = edge
        .props
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0) as f32;
    let evidence = edge
        .props
        .get("evidence_chunk_ids")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ChunkId::from)
                .collect()
        })
        .unwrap_or_default();
    Relation {
        subject: EntityId::from(edge.from.as_str()),
        predicate,
        object: EntityId::from(edge.to.as_str()),
        confidence,
        evidence_chunk_ids: evidence,
    }
}

fn collect_mentioned_entities(
    state: &GraphState,
    chunk_ids: &FxHashSet<&str>,
) -> Result<Vec<Entity>, StoreError> {
    let entity_ids: FxHashSet<&str> = state
        .edges
        .values()
        .filter(|e| e.edge == EdgeType::Mentions && chunk_ids.contains(e.from.as_str()))
        .map(|e| e.to.as_str())
        .collect();
    let mut entities = Vec::new();
    for id in entity_ids {
        if let Some(node) = state.nodes.get(id) {
            let entity: Entity = serde_json::from_value(node.props.clone()).map_err(|err| {
                StoreError::Serialization {
                    message: format!("entity node {id}: {err}"),
                }
            })?;
            entities.push(entity);
        }
    }
    entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Predicate;

    fn entity_node(id: &str, name: &str) -> GraphNode {
        let entity = Entity {
            entity_id: EntityId::from(id),
            canonical_name: name.to_string(),
            aliases: vec![],
            entity_type: crate::model::EntityType::Person,
            confidence: 0.9,
        };
        GraphNode {
            id: id.to_string(),
            label: NodeLabel::Entity,
            props: serde_json::to_value(&entity).unwrap(),
        }
    }

    #[tokio::test]
    async fn vector_search_orders_deterministically() {
        let store = InMemoryVectorStore::new(4);
        let mk = |id: &str, ordinal: usize, v: Vec<f32>| VectorPoint {
            chunk_id: ChunkId::from(id),
            doc_id: DocId::from("urn:cl:doc:d"),
            ordinal,
            vector: v,
            payload: json!({"ordinal": ordinal}),
        };
        store
            .upsert(vec![
                mk("urn:cl:chunk:b", 1, vec![1.0, 0.0, 0.0, 0.0]),
                mk("urn:cl:chunk:a", 0, vec![1.0, 0.0, 0.0, 0.0]),
                mk("urn:cl:chunk:c", 2, vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .search(&[1.0, 0.0, 0.0, 0.0], 10, 0.0, &Filter::default())
            .await
            .unwrap();
        // Tied scores break by ordinal.
        assert_eq!(hits[0].chunk_id.as_str(), "urn:cl:chunk:a");
        assert_eq!(hits[1].chunk_id.as_str(), "urn:cl:chunk:b");

        let again = store
            .search(&[1.0, 0.0, 0.0, 0.0], 10, 0.0, &Filter::default())
            .await
            .unwrap();
        assert_eq!(hits, again);
    }

    #[tokio::test]
    async fn vector_store_rejects_wrong_dimensionality() {
        let store = InMemoryVectorStore::new(4);
        let err = store
            .upsert(vec![VectorPoint {
                chunk_id: ChunkId::from("urn:cl:chunk:x"),
                doc_id: DocId::from("urn:cl:doc:d"),
                ordinal: 0,
                vector: vec![1.0, 0.0],
                payload: json!({}),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Serialization { .. }));

        let mismatch = store
            .ensure_collection("content_chunks", 8, Distance::Cosine)
            .await
            .unwrap_err();
        assert!(matches!(mismatch, StoreError::CollectionMismatch { .. }));
    }

    #[tokio::test]
    async fn graph_merge_is_idempotent_and_relations_merge() {
        let store = InMemoryGraphStore::new();
        let mut tx = GraphTx::default();
        tx.nodes.push(entity_node("urn:cl:entity:a", "A"));
        tx.nodes.push(entity_node("urn:cl:entity:b", "B"));
        tx.merge_edge(
            "urn:cl:entity:a",
            EdgeType::Relation(Predicate::Founded),
            "urn:cl:entity:b",
            json!({"confidence": 0.8, "evidence_chunk_ids": ["urn:cl:chunk:1"]}),
        );
        store.commit(tx.clone()).await.unwrap();
        let before_edges = store.edge_count();

        // Second commit with different evidence merges, never duplicates.
        let mut tx2 = tx.clone();
        tx2.edges[0].props = json!({"confidence": 0.4, "evidence_chunk_ids": ["urn:cl:chunk:2"]});
        store.commit(tx2).await.unwrap();
        assert_eq!(store.edge_count(), before_edges);

        let relations = store
            .relations_from(&EntityId::from("urn:cl:entity:a"), 1)
            .await
            .unwrap();
        assert_eq!(relations.len(), 1);
        assert!((relations[0].confidence - 0.6).abs() < 1e-6);
        assert_eq!(relations[0].evidence_chunk_ids.len(), 2);
    }

    #[tokio::test]
    async fn relations_traverse_up_to_depth() {
        let store = InMemoryGraphStore::new();
        let mut tx = GraphTx::default();
        for (id, name) in [("a", "A"), ("b", "B"), ("c", "C"), ("d", "D")] {
            tx.nodes
                .push(entity_node(&format!("urn:cl:entity:{id}"), name));
        }
        for (from, to) in [("a", "b"), ("b", "c"), ("c", "d")] {
            tx.merge_edge(
                format!("urn:cl:entity:{from}"),
                EdgeType::Relation(Predicate::Cites),
                format!("urn:cl:entity:{to}"),
                json!({"confidence": 0.5, "evidence_chunk_ids": []}),
            );
        }
        store.commit(tx).await.unwrap();

        let one = store
            .relations_from(&EntityId::from("urn:cl:entity:a"), 1)
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        let three = store
            .relations_from(&EntityId::from("urn:cl:entity:a"), 3)
            .await
            .unwrap();
        assert_eq!(three.len(), 3);
    }

    #[tokio::test]
    async fn delete_document_keeps_entities() {
        let store = InMemoryGraphStore::new();
        let mut tx = GraphTx::default();
        tx.merge_node("urn:cl:doc:d", NodeLabel::Document, json!({"title": "T"}));
        tx.merge_node("urn:cl:chunk:1", NodeLabel::Chunk, json!({"ordinal": 0}));
        tx.nodes.push(entity_node("urn:cl:entity:a", "A"));
        tx.merge_edge("urn:cl:doc:d", EdgeType::HasChunk, "urn:cl:chunk:1", json!({"ordinal": 0}));
        tx.merge_edge(
            "urn:cl:chunk:1",
            EdgeType::Mentions,
            "urn:cl:entity:a",
            json!({"confidence": 0.9}),
        );
        store.commit(tx).await.unwrap();

        store
            .delete_document(&DocId::from("urn:cl:doc:d"))
            .await
            .unwrap();
        assert!(!store
            .document_exists(&DocId::from("urn:cl:doc:d"))
            .await
            .unwrap());
        // The entity node survives the cascade.
        assert_eq!(store.node_count(), 1);
        assert_eq!(store.edge_count(), 0);
    }
}
