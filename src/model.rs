//! Core entities of the provenance model.
//!
//! Everything here is plain data: construction happens in the pipeline,
//! persistence in the stores, and the graph layer only ever carries endpoint
//! IDs (never owning references) because the knowledge graph is cyclic.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ChunkId, DocId, EntityId, ExportId, MentionId};

/// Where a document came from; drives extractor selection and the shape of
/// per-chunk source details.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Web,
    Pdf,
    Youtube,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Web => "web",
            SourceType::Pdf => "pdf",
            SourceType::Youtube => "youtube",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "web" => Some(SourceType::Web),
            "pdf" => Some(SourceType::Pdf),
            "youtube" => Some(SourceType::Youtube),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality bucket derived from the screening score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    A,
    B,
    C,
    D,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::A => "A",
            Tier::B => "B",
            Tier::C => "C",
            Tier::D => "D",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "A" => Some(Tier::A),
            "B" => Some(Tier::B),
            "C" => Some(Tier::C),
            "D" => Some(Tier::D),
            _ => None,
        }
    }

    /// Bucket a screening score using the configured thresholds
    /// (score >= a ⇒ A, >= b ⇒ B, >= c ⇒ C, else D).
    pub fn from_score(score: f64, thresholds: &crate::config::TierThresholds) -> Self {
        if score >= thresholds.a {
            Tier::A
        } else if score >= thresholds.b {
            Tier::B
        } else if score >= thresholds.c {
            Tier::C
        } else {
            Tier::D
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata row for one ingested source. Core fields are immutable after the
/// screening stage; `metadata` is the extensible remainder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: DocId,
    pub source_url: String,
    pub source_type: SourceType,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub quality_score: f64,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

/// Source-specific locator carried by each chunk, tagged by source type so
/// youtube fields can never leak onto a web chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source_type", rename_all = "lowercase")]
pub enum SourceDetails {
    Web,
    Pdf {
        #[serde(skip_serializing_if = "Option::is_none")]
        page_number: Option<u32>,
    },
    Youtube {
        video_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        timestamp_start: String,
        timestamp_end: String,
    },
}

impl SourceDetails {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceDetails::Web => SourceType::Web,
            SourceDetails::Pdf { .. } => SourceType::Pdf,
            SourceDetails::Youtube { .. } => SourceType::Youtube,
        }
    }

    /// Human-readable locator for citation tables ("p. 4" / "12:05–12:58").
    pub fn locator(&self) -> Option<String> {
        match self {
            SourceDetails::Web => None,
            SourceDetails::Pdf { page_number } => page_number.map(|p| format!("p. {p}")),
            SourceDetails::Youtube {
                timestamp_start,
                timestamp_end,
                ..
            } => Some(format!("{timestamp_start}-{timestamp_end}")),
        }
    }
}

/// A contiguous byte-range slice of a document's normalized text; the
/// retrieval unit. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub doc_id: DocId,
    pub ordinal: usize,
    pub text: String,
    pub byte_start: usize,
    pub byte_end: usize,
    pub details: SourceDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Payload written alongside each chunk vector; the fields the filter layer
/// understands (§ vector index contract).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub doc_id: DocId,
    pub chunk_id: ChunkId,
    pub ordinal: usize,
    pub source_type: SourceType,
    pub tier: Tier,
    pub tags: Vec<String>,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub quality_score: f64,
    pub byte_start: usize,
    pub byte_end: usize,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_end: Option<String>,
}

impl ChunkPayload {
    pub fn from_chunk(chunk: &Chunk, document: &Document, tags: &[String]) -> Self {
        let (video_id, channel, timestamp_start, timestamp_end, page_number) =
            match &chunk.details {
                SourceDetails::Web => (None, None, None, None, None),
                SourceDetails::Pdf { page_number } => (None, None, None, None, *page_number),
                SourceDetails::Youtube {
                    video_id,
                    channel,
                    timestamp_start,
                    timestamp_end,
                } => (
                    Some(video_id.clone()),
                    channel.clone(),
                    Some(timestamp_start.clone()),
                    Some(timestamp_end.clone()),
                    None,
                ),
            };
        Self {
            doc_id: chunk.doc_id.clone(),
            chunk_id: chunk.chunk_id.clone(),
            ordinal: chunk.ordinal,
            source_type: document.source_type,
            tier: document.tier,
            tags: tags.to_vec(),
            url: document.source_url.clone(),
            title: document.title.clone(),
            quality_score: document.quality_score,
            byte_start: chunk.byte_start,
            byte_end: chunk.byte_end,
            text: chunk.text.clone(),
            published_at: document.published_at,
            video_id,
            channel,
            timestamp_start,
            timestamp_end,
            page_number,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Entity categories emitted by the transform stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Law,
    Date,
    Work,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Organization => "ORG",
            EntityType::Location => "LOC",
            EntityType::Law => "LAW",
            EntityType::Date => "DATE",
            EntityType::Work => "WORK",
        }
    }
}

/// An occurrence of an entity's surface form inside a chunk. Spans are
/// chunk-relative byte offsets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub mention_id: MentionId,
    pub chunk_id: ChunkId,
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub surface_text: String,
    pub span_start: usize,
    pub span_end: usize,
    pub confidence: f32,
}

/// A canonicalized real-world referent. Fuzzy merges grow `aliases`; they
/// never mint a second entity for the same (name, type) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: EntityId,
    pub canonical_name: String,
    pub aliases: Vec<String>,
    pub entity_type: EntityType,
    pub confidence: f32,
}

impl Entity {
    pub fn merge_alias(&mut self, alias: &str) {
        let normalized = crate::ids::normalize_name(alias);
        let known = crate::ids::normalize_name(&self.canonical_name) == normalized
            || self
                .aliases
                .iter()
                .any(|a| crate::ids::normalize_name(a) == normalized);
        if !known {
            self.aliases.push(alias.to_string());
        }
    }
}

/// Typed directed edge between two entities, supported by chunk evidence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Predicate {
    EmployedBy,
    Founded,
    Cites,
    LocatedIn,
    Authored,
}

impl Predicate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Predicate::EmployedBy => "EMPLOYED_BY",
            Predicate::Founded => "FOUNDED",
            Predicate::Cites => "CITES",
            Predicate::LocatedIn => "LOCATED_IN",
            Predicate::Authored => "AUTHORED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub subject: EntityId,
    pub predicate: Predicate,
    pub object: EntityId,
    pub confidence: f32,
    pub evidence_chunk_ids: Vec<ChunkId>,
}

impl Relation {
    /// Duplicate ingest of the same (subject, predicate, object) averages
    /// confidence and unions evidence.
    pub fn merge_from(&mut self, other: &Relation) {
        self.confidence = (self.confidence + other.confidence) / 2.0;
        for chunk in &other.evidence_chunk_ids {
            if !self.evidence_chunk_ids.contains(chunk) {
                self.evidence_chunk_ids.push(chunk.clone());
            }
        }
    }
}

/// One scene of a generated export, attributed back to source material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub ordinal: usize,
    pub text: String,
    pub source_doc_ids: Vec<DocId>,
    pub source_chunk_ids: Vec<ChunkId>,
}

/// A downstream generated artifact; lives only in the provenance graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub export_id: ExportId,
    pub source_doc_ids: Vec<DocId>,
    pub format: String,
    pub scenes: Vec<Scene>,
    pub models_used: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierThresholds;

    #[test]
    fn tier_bucketing_uses_thresholds() {
        let t = TierThresholds::default();
        assert_eq!(Tier::from_score(9.4, &t), Tier::A);
        assert_eq!(Tier::from_score(8.2, &t), Tier::B);
        assert_eq!(Tier::from_score(5.0, &t), Tier::C);
        assert_eq!(Tier::from_score(2.3, &t), Tier::D);
    }

    #[test]
    fn source_details_serialize_with_tag() {
        let details = SourceDetails::Youtube {
            video_id: "VID".into(),
            channel: Some("chan".into()),
            timestamp_start: "00:00:05".into(),
            timestamp_end: "00:00:42".into(),
        };
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["source_type"], "youtube");
        assert_eq!(value["video_id"], "VID");

        let web = serde_json::to_value(SourceDetails::Web).unwrap();
        assert!(web.get("video_id").is_none());
    }

    #[test]
    fn relation_merge_averages_and_unions() {
        let mut a = Relation {
            subject: EntityId::from("urn:cl:entity:s"),
            predicate: Predicate::Founded,
            object: EntityId::from("urn:cl:entity:o"),
            confidence: 0.8,
            evidence_chunk_ids: vec![ChunkId::from("urn:cl:chunk:1")],
        };
        let b = Relation {
            confidence: 0.4,
            evidence_chunk_ids: vec![
                ChunkId::from("urn:cl:chunk:1"),
                ChunkId::from("urn:cl:chunk:2"),
            ],
            ..a.clone()
        };
        a.merge_from(&b);
        assert!((a.confidence - 0.6).abs() < f32::EPSILON);
        assert_eq!(a.evidence_chunk_ids.len(), 2);
    }

    #[test]
    fn entity_alias_merge_dedupes_by_normalized_name() {
        let mut entity = Entity {
            entity_id: EntityId::from("urn:cl:entity:x"),
            canonical_name: "Marie Curie".into(),
            aliases: vec![],
            entity_type: EntityType::Person,
            confidence: 0.9,
        };
        entity.merge_alias("Curie");
        entity.merge_alias("curie");
        entity.merge_alias("MARIE  CURIE");
        assert_eq!(entity.aliases, vec!["Curie".to_string()]);
    }
}
