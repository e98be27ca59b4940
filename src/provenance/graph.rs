//! Graph transaction assembly for a completed ingest.
//!
//! Node and edge construction is pure so it can be unit-tested without a
//! backend: Document node, Chunk nodes with `HAS_CHUNK(ordinal)`, Mention
//! nodes with `REFERS_TO`, `MENTIONS` edges Chunk→Entity, and typed relation
//! edges Entity→Entity carrying confidence plus evidence chunk ids.

use serde_json::json;

use crate::errors::StoreError;
use crate::stores::{EdgeType, GraphTx, NodeLabel};

use super::IngestBundle;

/// Build the MERGE transaction finalizing one document's provenance.
pub fn ingest_graph_tx(bundle: &IngestBundle) -> GraphTx {
    let mut tx = GraphTx::default();
    let document = &bundle.document;

    tx.merge_node(
        document.doc_id.as_str(),
        NodeLabel::Document,
        json!({
            "url": document.source_url,
            "source_type": document.source_type,
            "title": document.title,
            "tier": document.tier,
            "quality_score": document.quality_score,
            "created_at": document.created_at.to_rfc3339(),
        }),
    );

    for chunk in &bundle.chunks {
        tx.merge_node(
            chunk.chunk_id.as_str(),
            NodeLabel::Chunk,
            json!({
                "doc_id": chunk.doc_id,
                "ordinal": chunk.ordinal,
                "byte_start": chunk.byte_start,
                "byte_end": chunk.byte_end,
            }),
        );
        tx.merge_edge(
            document.doc_id.as_str(),
            EdgeType::HasChunk,
            chunk.chunk_id.as_str(),
            json!({"ordinal": chunk.ordinal}),
        );
    }

    for entity in &bundle.entities {
        tx.merge_node(
            entity.entity_id.as_str(),
            NodeLabel::Entity,
            serde_json::to_value(entity).unwrap_or(serde_json::Value::Null),
        );
    }

    for mention in &bundle.mentions {
        tx.merge_node(
            mention.mention_id.as_str(),
            NodeLabel::Mention,
            json!({
                "chunk_id": mention.chunk_id,
                "entity_type": mention.entity_type,
                "surface_text": mention.surface_text,
                "span_start": mention.span_start,
                "span_end": mention.span_end,
                "confidence": mention.confidence,
            }),
        );
        tx.merge_edge(
            mention.mention_id.as_str(),
            EdgeType::RefersTo,
            mention.entity_id.as_str(),
            json!({"confidence": mention.confidence}),
        );
        tx.merge_edge(
            mention.chunk_id.as_str(),
            EdgeType::Mentions,
            mention.entity_id.as_str(),
            json!({"confidence": mention.confidence}),
        );
    }

    for relation in &bundle.relations {
        tx.merge_edge(
            relation.subject.as_str(),
            EdgeType::Relation(relation.predicate),
            relation.object.as_str(),
            json!({
                "confidence": relation.confidence,
                "evidence_chunk_ids": relation.evidence_chunk_ids,
            }),
        );
    }

    tx
}

/// Sanity checks a transaction before handing it to a backend; used by tests
/// and the in-memory store's debug assertions.
pub fn validate_tx(tx: &GraphTx) -> Result<(), StoreError> {
    for edge in &tx.edges {
        if edge.from.is_empty() || edge.to.is_empty() {
            return Err(StoreError::Serialization {
                message: format!("edge {:?} has an empty endpoint", edge.edge),
            });
        }
    }
    Ok(())
}
