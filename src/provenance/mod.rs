//! Cross-backend provenance writer and reader.
//!
//! No shared transaction spans the four backends, so the contract is:
//! deterministic IDs + idempotent upserts + MERGE on the graph commit. The
//! write order is blob → metadata row → chunk vectors → graph transaction;
//! the Document graph node is the commit marker. If the graph commit fails,
//! the earlier writes are left in place — re-ingesting the same `doc_id` is a
//! clean compensation because every key is deterministic — and a periodic
//! sweep reconciles documents that never got their marker.

mod graph;

pub use graph::{ingest_graph_tx, validate_tx};

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::errors::StoreError;
use crate::ids::{DocId, EntityId};
use crate::model::{
    Chunk, ChunkPayload, Document, Entity, ExportArtifact, Mention, Relation, SourceDetails,
    SourceType,
};
use crate::stores::{
    BlobStore, EdgeType, GraphStore, GraphTx, MetaStore, NodeLabel, ProcessingRecord, VectorPoint,
    VectorStore,
};

/// Everything a completed pipeline run wants persisted.
#[derive(Clone, Debug)]
pub struct IngestBundle {
    pub document: Document,
    pub blob_bytes: Vec<u8>,
    pub content_type: String,
    pub chunks: Vec<Chunk>,
    pub tags: Vec<String>,
    pub mentions: Vec<Mention>,
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

pub struct ProvenanceStore {
    meta: Arc<dyn MetaStore>,
    blobs: Arc<dyn BlobStore>,
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
}

impl ProvenanceStore {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        blobs: Arc<dyn BlobStore>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
    ) -> Self {
        Self {
            meta,
            blobs,
            vectors,
            graph,
        }
    }

    pub fn meta(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }

    pub fn vectors(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    /// Steps 1–3 of the write order: blob, metadata row, chunk vectors.
    #[instrument(skip(self, bundle), fields(doc_id = %bundle.document.doc_id), err)]
    pub async fn write_content(&self, bundle: &IngestBundle) -> Result<(), StoreError> {
        let doc_id = &bundle.document.doc_id;

        self.blobs
            .put(doc_id, bundle.blob_bytes.clone(), &bundle.content_type)
            .await?;
        self.meta.upsert_document(&bundle.document).await?;

        let mut points = Vec::with_capacity(bundle.chunks.len());
        for chunk in &bundle.chunks {
            let Some(vector) = chunk.embedding.clone() else {
                return Err(StoreError::Serialization {
                    message: format!("chunk {} has no embedding", chunk.chunk_id),
                });
            };
            let payload = ChunkPayload::from_chunk(chunk, &bundle.document, &bundle.tags);
            points.push(VectorPoint {
                chunk_id: chunk.chunk_id.clone(),
                doc_id: doc_id.clone(),
                ordinal: chunk.ordinal,
                vector,
                payload: payload.to_value(),
            });
        }
        self.vectors.upsert(points).await?;

        self.record(doc_id, "write_content", "completed", None).await;
        info!(chunks = bundle.chunks.len(), "content written to blob/meta/vector stores");
        Ok(())
    }

    /// Step 4: the graph transaction that finalizes provenance. Its Document
    /// node is the commit marker readers filter on.
    #[instrument(skip(self, bundle), fields(doc_id = %bundle.document.doc_id), err)]
    pub async fn commit_graph(&self, bundle: &IngestBundle) -> Result<(), StoreError> {
        let tx = ingest_graph_tx(bundle);
        match self.graph.commit(tx).await {
            Ok(()) => {
                self.record(&bundle.document.doc_id, "graph_commit", "completed", None)
                    .await;
                Ok(())
            }
            Err(err) => {
                self.record(
                    &bundle.document.doc_id,
                    "graph_commit",
                    "failed",
                    Some(err.to_string()),
                )
                .await;
                Err(StoreError::Transaction {
                    message: err.to_string(),
                })
            }
        }
    }

    // -- readers ------------------------------------------------------------

    pub async fn get_document(&self, doc_id: &DocId) -> Result<Option<Document>, StoreError> {
        self.meta.get_document(doc_id).await
    }

    /// `true` when the document has both its metadata row and its graph
    /// commit marker.
    pub async fn has_provenance(&self, doc_id: &DocId) -> Result<bool, StoreError> {
        Ok(self.meta.get_document(doc_id).await?.is_some()
            && self.graph.document_exists(doc_id).await?)
    }

    /// Chunks of a document, ordinal ascending, reconstructed from the
    /// vector payloads.
    pub async fn get_chunks_by_doc(&self, doc_id: &DocId) -> Result<Vec<Chunk>, StoreError> {
        let points = self.vectors.fetch_by_doc(doc_id).await?;
        points.into_iter().map(|p| payload_to_chunk(&p)).collect()
    }

    /// Entities mentioned anywhere in a document.
    pub async fn get_entities_by_doc(&self, doc_id: &DocId) -> Result<Vec<Entity>, StoreError> {
        self.graph.entities_by_doc(doc_id).await
    }

    /// Relations reachable from an entity, up to `depth ≤ 3` hops,
    /// confidence descending.
    pub async fn get_relations(
        &self,
        entity_id: &EntityId,
        depth: usize,
    ) -> Result<Vec<Relation>, StoreError> {
        self.graph.relations_from(entity_id, depth).await
    }

    /// Exports generated from a document, oldest first.
    pub async fn get_generated_content_from_doc(
        &self,
        doc_id: &DocId,
    ) -> Result<Vec<ExportArtifact>, StoreError> {
        self.graph.exports_from_doc(doc_id).await
    }

    /// Record a generated artifact with scene-level attribution edges.
    #[instrument(skip(self, artifact), fields(export_id = %artifact.export_id), err)]
    pub async fn record_export(
        &self,
        artifact: &ExportArtifact,
        prior_version: Option<(&crate::ids::ExportId, &str)>,
    ) -> Result<(), StoreError> {
        let mut tx = GraphTx::default();
        let props = serde_json::to_value(artifact).map_err(|err| StoreError::Serialization {
            message: err.to_string(),
        })?;
        tx.merge_node(artifact.export_id.as_str(), NodeLabel::Export, props);

        let stamp = artifact.created_at.to_rfc3339();
        for doc_id in &artifact.source_doc_ids {
            tx.merge_edge(
                artifact.export_id.as_str(),
                EdgeType::GeneratedFrom,
                doc_id.as_str(),
                serde_json::json!({"timestamp": stamp}),
            );
        }
        for model in &artifact.models_used {
            let model_id = format!("model:{model}");
            tx.merge_node(
                model_id.clone(),
                NodeLabel::AiModel,
                serde_json::json!({"name": model}),
            );
            tx.merge_edge(
                artifact.export_id.as_str(),
                EdgeType::GeneratedBy,
                model_id,
                serde_json::json!({"timestamp": stamp}),
            );
        }
        for scene in &artifact.scenes {
            let scene_id = format!("{}:scene:{}", artifact.export_id, scene.ordinal);
            tx.merge_node(
                scene_id.clone(),
                NodeLabel::Scene,
                serde_json::json!({
                    "ordinal": scene.ordinal,
                    "text": scene.text,
                    "source_chunk_ids": scene.source_chunk_ids,
                }),
            );
            tx.merge_edge(
                artifact.export_id.as_str(),
                EdgeType::HasScene,
                scene_id.clone(),
                serde_json::json!({"ordinal": scene.ordinal}),
            );
            for doc_id in &scene.source_doc_ids {
                tx.merge_edge(
                    scene_id.clone(),
                    EdgeType::SourcedFrom,
                    doc_id.as_str(),
                    Value::Null,
                );
            }
        }
        if let Some((prior, reason)) = prior_version {
            tx.merge_edge(
                artifact.export_id.as_str(),
                EdgeType::VersionOf,
                prior.as_str(),
                serde_json::json!({"reason": reason}),
            );
        }
        self.graph.commit(tx).await
    }

    // -- lifecycle ----------------------------------------------------------

    /// Cascade delete by doc_id: blob, chunk vectors, graph subtree, and the
    /// metadata row. Entity nodes survive (other documents may cite them).
    #[instrument(skip(self), err)]
    pub async fn delete_document(&self, doc_id: &DocId) -> Result<(), StoreError> {
        self.graph.delete_document(doc_id).await?;
        self.vectors.delete_by_doc(doc_id).await?;
        self.blobs.delete(doc_id).await?;
        self.meta.delete_document(doc_id).await?;
        Ok(())
    }

    /// Reconcile half-written ingests: any document with a metadata row but
    /// no graph commit marker is deleted everywhere. Returns the doc_ids
    /// swept.
    #[instrument(skip(self), err)]
    pub async fn sweep_orphans(&self) -> Result<Vec<DocId>, StoreError> {
        let mut swept = Vec::new();
        for doc_id in self.meta.list_document_ids().await? {
            if self.graph.document_exists(&doc_id).await? {
                continue;
            }
            warn!(doc_id = %doc_id, "sweeping orphaned document (no graph commit marker)");
            self.delete_document(&doc_id).await?;
            swept.push(doc_id);
        }
        Ok(swept)
    }

    async fn record(&self, doc_id: &DocId, operation: &str, status: &str, error: Option<String>) {
        let record = ProcessingRecord {
            record_id: uuid::Uuid::new_v4().simple().to_string(),
            doc_id: doc_id.clone(),
            operation: operation.to_string(),
            status: status.to_string(),
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            error,
            metadata: Value::Null,
        };
        if let Err(err) = self.meta.record_processing(&record).await {
            warn!(doc_id = %doc_id, operation, error = %err, "failed to append processing record");
        }
    }
}

/// Rebuild a `Chunk` from its stored vector payload.
fn payload_to_chunk(point: &VectorPoint) -> Result<Chunk, StoreError> {
    let payload: ChunkPayload =
        serde_json::from_value(point.payload.clone()).map_err(|err| StoreError::Serialization {
            message: format!("chunk payload {}: {err}", point.chunk_id),
        })?;
    let details = match payload.source_type {
        SourceType::Web => SourceDetails::Web,
        SourceType::Pdf => SourceDetails::Pdf {
            page_number: payload.page_number,
        },
        SourceType::Youtube => SourceDetails::Youtube {
            video_id: payload.video_id.clone().unwrap_or_default(),
            channel: payload.channel.clone(),
            timestamp_start: payload.timestamp_start.clone().unwrap_or_default(),
            timestamp_end: payload.timestamp_end.clone().unwrap_or_default(),
        },
    };
    Ok(Chunk {
        chunk_id: payload.chunk_id,
        doc_id: payload.doc_id,
        ordinal: payload.ordinal,
        text: payload.text,
        byte_start: payload.byte_start,
        byte_end: payload.byte_end,
        details,
        embedding: Some(point.vector.clone()),
    })
}
