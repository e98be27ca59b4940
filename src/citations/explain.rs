//! Answer explanation: the entity/relation subgraph behind a cited answer.

use serde::Serialize;
use std::sync::Arc;

use crate::errors::StoreError;
use crate::ids::{ChunkId, EntityId};
use crate::model::EntityType;
use crate::stores::GraphStore;

use super::CitationTable;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReasoningNode {
    pub id: EntityId,
    pub label: String,
    pub entity_type: EntityType,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReasoningEdge {
    pub from: EntityId,
    pub to: EntityId,
    pub predicate: String,
    pub confidence: f32,
}

/// Directed subgraph suitable for UI rendering: nodes are entities mentioned
/// in the answer, edges are relations evidenced by the cited chunks.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ReasoningGraph {
    pub nodes: Vec<ReasoningNode>,
    pub edges: Vec<ReasoningEdge>,
}

impl ReasoningGraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Build the reasoning graph for an answer: entities from the table's chunks
/// whose name (or alias) appears in the answer text, plus relations between
/// them that cite one of the table's chunks as evidence.
pub async fn explain(
    answer: &str,
    table: &CitationTable,
    graph: &Arc<dyn GraphStore>,
) -> Result<ReasoningGraph, StoreError> {
    let chunk_ids: Vec<ChunkId> = table.entries().iter().map(|e| e.chunk_id.clone()).collect();
    if chunk_ids.is_empty() {
        return Ok(ReasoningGraph::default());
    }

    let lowered = answer.to_lowercase();
    let candidates = graph.entities_for_chunks(&chunk_ids).await?;
    let mentioned: Vec<_> = candidates
        .into_iter()
        .filter(|entity| {
            let mut names = vec![entity.canonical_name.to_lowercase()];
            names.extend(entity.aliases.iter().map(|a| a.to_lowercase()));
            names.iter().any(|name| !name.is_empty() && lowered.contains(name))
        })
        .collect();

    let mut graph_out = ReasoningGraph::default();
    let mentioned_ids: Vec<&EntityId> = mentioned.iter().map(|e| &e.entity_id).collect();
    for entity in &mentioned {
        graph_out.nodes.push(ReasoningNode {
            id: entity.entity_id.clone(),
            label: entity.canonical_name.clone(),
            entity_type: entity.entity_type,
        });
    }

    for entity in &mentioned {
        let relations = graph.relations_from(&entity.entity_id, 1).await?;
        for relation in relations {
            if !mentioned_ids.contains(&&relation.object) {
                continue;
            }
            let evidenced = relation
                .evidence_chunk_ids
                .iter()
                .any(|c| chunk_ids.contains(c));
            if !evidenced {
                continue;
            }
            let duplicate = graph_out.edges.iter().any(|e| {
                e.from == relation.subject
                    && e.to == relation.object
                    && e.predicate == relation.predicate.as_str()
            });
            if !duplicate {
                graph_out.edges.push(ReasoningEdge {
                    from: relation.subject.clone(),
                    to: relation.object.clone(),
                    predicate: relation.predicate.as_str().to_string(),
                    confidence: relation.confidence,
                });
            }
        }
    }

    Ok(graph_out)
}
