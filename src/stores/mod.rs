//! Backend seams: relational metadata, blob, vector, and property graph.
//!
//! Production deployments plug real backends into these traits; the crate
//! ships in-memory implementations (deterministic, used by tests and local
//! runs) and a SQLite metadata store. Writers rely on deterministic IDs and
//! MERGE semantics instead of cross-store transactions, so every operation
//! here must be an idempotent upsert.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Distance;
use crate::errors::StoreError;
use crate::ids::{ChunkId, DocId, EntityId, ExportId, JobId};
use crate::jobs::Job;
use crate::model::{Document, Entity, ExportArtifact, Predicate, Relation};

pub use memory::{InMemoryBlobStore, InMemoryGraphStore, InMemoryMetaStore, InMemoryVectorStore};
pub use sqlite::SqliteMetaStore;

/// Row in the `processing_records` audit table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub record_id: String,
    pub doc_id: DocId,
    pub operation: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Relational metadata backend (§ documents / jobs / processing_records).
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn upsert_document(&self, document: &Document) -> Result<(), StoreError>;
    async fn get_document(&self, doc_id: &DocId) -> Result<Option<Document>, StoreError>;
    async fn delete_document(&self, doc_id: &DocId) -> Result<(), StoreError>;
    async fn list_document_ids(&self) -> Result<Vec<DocId>, StoreError>;

    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError>;

    async fn record_processing(&self, record: &ProcessingRecord) -> Result<(), StoreError>;
    async fn processing_records(&self, doc_id: &DocId)
        -> Result<Vec<ProcessingRecord>, StoreError>;
}

/// Content-addressed blob backend; blobs are keyed by `doc_id`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        doc_id: &DocId,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError>;
    async fn get(&self, doc_id: &DocId) -> Result<Option<(Vec<u8>, String)>, StoreError>;
    async fn exists(&self, doc_id: &DocId) -> Result<bool, StoreError>;
    async fn delete(&self, doc_id: &DocId) -> Result<(), StoreError>;
}

/// One stored chunk vector plus its filterable payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    pub chunk_id: ChunkId,
    pub doc_id: DocId,
    pub ordinal: usize,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A search hit, ready for citation building.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub chunk_id: ChunkId,
    pub doc_id: DocId,
    pub ordinal: usize,
    pub score: f32,
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    pub dim: usize,
    pub distance: Distance,
}

/// Native filter expression handed to the vector backend.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Filter {
    pub must: Vec<FilterCond>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterCond {
    /// `field = value`; on list-valued payload fields this means "contains".
    Eq(String, Value),
    /// `field in [...]`; on list-valued fields this means "intersects".
    In(String, Vec<Value>),
    /// Inclusive bounds; either side may be open.
    Range {
        field: String,
        min: Option<Value>,
        max: Option<Value>,
    },
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    /// Evaluate against a payload object. All conditions must hold.
    pub fn matches(&self, payload: &Value) -> bool {
        self.must.iter().all(|cond| cond.matches(payload))
    }
}

impl FilterCond {
    fn matches(&self, payload: &Value) -> bool {
        match self {
            FilterCond::Eq(field, expected) => match payload.get(field) {
                Some(Value::Array(items)) => items.contains(expected),
                Some(actual) => loose_eq(actual, expected),
                None => false,
            },
            FilterCond::In(field, allowed) => match payload.get(field) {
                Some(Value::Array(items)) => items.iter().any(|i| allowed.contains(i)),
                Some(actual) => allowed.iter().any(|a| loose_eq(actual, a)),
                None => false,
            },
            FilterCond::Range { field, min, max } => {
                let Some(actual) = payload.get(field) else {
                    return false;
                };
                let lower_ok = min.as_ref().is_none_or(|m| cmp_ge(actual, m));
                let upper_ok = max.as_ref().is_none_or(|m| cmp_ge(m, actual));
                lower_ok && upper_ok
            }
        }
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// `a >= b` for numbers and strings (ISO-8601 timestamps compare correctly
/// as strings).
fn cmp_ge(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x >= y,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x >= y,
            _ => false,
        },
    }
}

/// Vector index backend for the single logical chunk collection.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Validate (or create) the collection. A dim/metric mismatch against the
    /// live collection is fatal at startup.
    async fn ensure_collection(
        &self,
        name: &str,
        dim: usize,
        distance: Distance,
    ) -> Result<CollectionInfo, StoreError>;

    /// Idempotent batch upsert; points are keyed by `chunk_id`.
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), StoreError>;

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        min_score: f32,
        filter: &Filter,
    ) -> Result<Vec<ScoredPoint>, StoreError>;

    /// All points of one document, ordinal ascending.
    async fn fetch_by_doc(&self, doc_id: &DocId) -> Result<Vec<VectorPoint>, StoreError>;

    async fn delete_by_doc(&self, doc_id: &DocId) -> Result<(), StoreError>;
}

/// Node labels of the provenance graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeLabel {
    Document,
    Chunk,
    Mention,
    Entity,
    Export,
    Scene,
    AiModel,
}

/// Relationship types of the provenance graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EdgeType {
    HasChunk,
    Mentions,
    RefersTo,
    Relation(Predicate),
    GeneratedFrom,
    HasScene,
    SourcedFrom,
    GeneratedBy,
    VersionOf,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::HasChunk => "HAS_CHUNK",
            EdgeType::Mentions => "MENTIONS",
            EdgeType::RefersTo => "REFERS_TO",
            EdgeType::Relation(p) => p.as_str(),
            EdgeType::GeneratedFrom => "GENERATED_FROM",
            EdgeType::HasScene => "HAS_SCENE",
            EdgeType::SourcedFrom => "SOURCED_FROM",
            EdgeType::GeneratedBy => "GENERATED_BY",
            EdgeType::VersionOf => "VERSION_OF",
        }
    }
}

/// Edges carry endpoint IDs, never owning references; the knowledge graph is
/// cyclic by nature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: NodeLabel,
    pub props: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub edge: EdgeType,
    pub props: Value,
}

/// A batch of MERGEs applied atomically by the graph backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphTx {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphTx {
    pub fn merge_node(&mut self, id: impl Into<String>, label: NodeLabel, props: Value) {
        self.nodes.push(GraphNode {
            id: id.into(),
            label,
            props,
        });
    }

    pub fn merge_edge(
        &mut self,
        from: impl Into<String>,
        edge: EdgeType,
        to: impl Into<String>,
        props: Value,
    ) {
        self.edges.push(GraphEdge {
            from: from.into(),
            to: to.into(),
            edge,
            props,
        });
    }
}

/// Property-graph backend.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Apply a transaction with MERGE semantics: nodes merge by id; edges
    /// merge by (from, type, to). Duplicate relation edges average confidence
    /// and union evidence.
    async fn commit(&self, tx: GraphTx) -> Result<(), StoreError>;

    /// The Document node is the commit marker for a completed ingest.
    async fn document_exists(&self, doc_id: &DocId) -> Result<bool, StoreError>;

    async fn entities_by_doc(&self, doc_id: &DocId) -> Result<Vec<Entity>, StoreError>;

    /// Entities mentioned by any of the given chunks.
    async fn entities_for_chunks(
        &self,
        chunk_ids: &[ChunkId],
    ) -> Result<Vec<Entity>, StoreError>;

    /// Outbound relation edges up to `depth` hops, confidence descending.
    async fn relations_from(
        &self,
        entity_id: &EntityId,
        depth: usize,
    ) -> Result<Vec<Relation>, StoreError>;

    async fn exports_from_doc(&self, doc_id: &DocId) -> Result<Vec<ExportArtifact>, StoreError>;

    async fn get_export(&self, export_id: &ExportId) -> Result<Option<ExportArtifact>, StoreError>;

    /// Cascade delete of a document's subtree: chunk and mention nodes plus
    /// their edges. Entity nodes survive — other documents may reference them.
    async fn delete_document(&self, doc_id: &DocId) -> Result<(), StoreError>;
}
