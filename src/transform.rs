//! Content transformation: summary, key points, tags, named-entity mentions,
//! coreference linking, and relation extraction.
//!
//! The `Annotator` seam lets an LLM-assisted implementation plug in; the
//! built-in `PatternAnnotator` is a deterministic regex ensemble, which keeps
//! ingestion reproducible and testable offline. Pattern sets are grouped per
//! entity type and applied in priority order so overlapping matches resolve
//! the same way every run.

use async_trait::async_trait;
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::errors::ProviderError;
use crate::ids::IdService;
use crate::model::{Chunk, Entity, EntityType, Mention, Predicate, Relation};

/// A mention located in the full normalized text (document-level byte spans).
#[derive(Clone, Debug, PartialEq)]
pub struct DocMention {
    pub entity_type: EntityType,
    pub surface: String,
    pub span_start: usize,
    pub span_end: usize,
    pub confidence: f32,
    /// Canonical surface after coreference resolution; equals `surface` for
    /// full mentions.
    pub canonical: String,
}

/// A relation candidate with document-level evidence span.
#[derive(Clone, Debug, PartialEq)]
pub struct DocRelation {
    pub subject: String,
    pub subject_type: EntityType,
    pub predicate: Predicate,
    pub object: String,
    pub object_type: EntityType,
    pub confidence: f32,
    pub evidence_start: usize,
    pub evidence_end: usize,
}

/// Full output of the transform stage for one document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocAnnotation {
    pub summary: String,
    pub key_points: Vec<String>,
    pub tags: Vec<String>,
    pub mentions: Vec<DocMention>,
    pub relations: Vec<DocRelation>,
}

#[async_trait]
pub trait Annotator: Send + Sync {
    async fn annotate(&self, text: &str) -> Result<DocAnnotation, ProviderError>;
}

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "along", "among", "because", "been", "before", "being", "between",
    "could", "every", "first", "found", "from", "have", "however", "into", "other", "over",
    "said", "should", "since", "some", "such", "than", "that", "their", "them", "then", "there",
    "these", "they", "this", "those", "through", "under", "until", "were", "when", "where",
    "which", "while", "will", "with", "would", "your",
];

/// Deterministic regex-ensemble annotator.
pub struct PatternAnnotator {
    org: Regex,
    person: Regex,
    location: Regex,
    law: Regex,
    date: Regex,
    work: Regex,
    short_form: Regex,
    pronoun: Regex,
    sentence_end: Regex,
    founded_by: Regex,
    founded: Regex,
    employed: Regex,
    located: Regex,
    authored: Regex,
    cites: Regex,
}

impl PatternAnnotator {
    pub fn new() -> Self {
        // Patterns are anchored on capitalization; matches yield byte spans.
        Self {
            org: Regex::new(
                r"\b([A-Z][\w&.-]*(?:\s+(?:of\s+)?[A-Z][\w&.-]*)*\s+(?:Inc|Corp|Corporation|Ltd|LLC|Company|University|Institute|Laboratories|Labs|Foundation|Agency|Society))\b",
            )
            .expect("org pattern"),
            person: Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z]\.)?\s+[A-Z][a-z]+)\b")
                .expect("person pattern"),
            location: Regex::new(r"\b(?:in|at|from|near)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)")
                .expect("location pattern"),
            law: Regex::new(
                r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\s+(?:Act|Treaty|Accord|Regulation|Directive))\b",
            )
            .expect("law pattern"),
            date: Regex::new(
                r"\b((?:January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{1,2},\s+\d{4}|(?:1[89]|20)\d{2})\b",
            )
            .expect("date pattern"),
            work: Regex::new(r#""([A-Z][^"\n]{2,80})""#).expect("work pattern"),
            short_form: Regex::new(r"\b([A-Z][a-z]+)\b").expect("short form pattern"),
            pronoun: Regex::new(r"\b(He|She|They|It)\b").expect("pronoun pattern"),
            sentence_end: Regex::new(r"[.!?](?:\s|$)").expect("sentence pattern"),
            founded_by: Regex::new(r"(?i)\bfounded\s+by\b").expect("founded_by pattern"),
            founded: Regex::new(r"(?i)\bfounded\b").expect("founded pattern"),
            employed: Regex::new(r"(?i)\b(?:works?\s+at|worked\s+at|employed\s+by|joined|researcher\s+at|professor\s+at)\b")
                .expect("employed pattern"),
            located: Regex::new(r"(?i)\b(?:located\s+in|based\s+in|headquartered\s+in)\b")
                .expect("located pattern"),
            authored: Regex::new(r"(?i)\b(?:authored|wrote|published)\b").expect("authored pattern"),
            cites: Regex::new(r"(?i)\b(?:cites|citing|cited)\b").expect("cites pattern"),
        }
    }

    fn collect_mentions(&self, text: &str) -> Vec<DocMention> {
        let mut mentions: Vec<DocMention> = Vec::new();

        let mut push = |entity_type: EntityType,
                        start: usize,
                        end: usize,
                        surface: &str,
                        confidence: f32,
                        mentions: &mut Vec<DocMention>| {
            let overlaps = mentions
                .iter()
                .any(|m| start < m.span_end && m.span_start < end);
            if !overlaps {
                mentions.push(DocMention {
                    entity_type,
                    surface: surface.to_string(),
                    span_start: start,
                    span_end: end,
                    confidence,
                    canonical: surface.to_string(),
                });
            }
        };

        // Priority order: specific shapes first so generic capitalized pairs
        // do not shadow them.
        for cap in self.org.captures_iter(text) {
            let m = cap.get(1).expect("org capture");
            push(
                EntityType::Organization,
                m.start(),
                m.end(),
                m.as_str(),
                0.9,
                &mut mentions,
            );
        }
        for cap in self.law.captures_iter(text) {
            let m = cap.get(1).expect("law capture");
            push(EntityType::Law, m.start(), m.end(), m.as_str(), 0.85, &mut mentions);
        }
        for cap in self.work.captures_iter(text) {
            let m = cap.get(1).expect("work capture");
            push(EntityType::Work, m.start(), m.end(), m.as_str(), 0.7, &mut mentions);
        }
        for cap in self.person.captures_iter(text) {
            let m = cap.get(1).expect("person capture");
            push(
                EntityType::Person,
                m.start(),
                m.end(),
                m.as_str(),
                0.8,
                &mut mentions,
            );
        }
        for cap in self.location.captures_iter(text) {
            let m = cap.get(1).expect("location capture");
            push(
                EntityType::Location,
                m.start(),
                m.end(),
                m.as_str(),
                0.6,
                &mut mentions,
            );
        }
        for cap in self.date.captures_iter(text) {
            let m = cap.get(1).expect("date capture");
            push(EntityType::Date, m.start(), m.end(), m.as_str(), 0.75, &mut mentions);
        }

        mentions.sort_by_key(|m| m.span_start);
        mentions
    }

    /// Link short-form and pronoun mentions to their antecedents.
    fn resolve_coreference(&self, text: &str, mentions: &mut Vec<DocMention>) {
        // Short forms: a lone capitalized token matching the last token of an
        // earlier PERSON mention or the head token of an earlier ORG mention.
        let full: Vec<DocMention> = mentions.clone();
        let mut extra: Vec<DocMention> = Vec::new();

        for cap in self.short_form.captures_iter(text) {
            let m = cap.get(1).expect("short form capture");
            if mentions
                .iter()
                .any(|known| m.start() < known.span_end && known.span_start < m.end())
            {
                continue;
            }
            let token = m.as_str();
            let antecedent = full.iter().rev().find(|known| {
                known.span_end <= m.start()
                    && match known.entity_type {
                        EntityType::Person => known
                            .surface
                            .rsplit(' ')
                            .next()
                            .is_some_and(|last| last == token),
                        EntityType::Organization => known
                            .surface
                            .split(' ')
                            .next()
                            .is_some_and(|head| head == token),
                        _ => false,
                    }
            });
            if let Some(known) = antecedent {
                extra.push(DocMention {
                    entity_type: known.entity_type,
                    surface: token.to_string(),
                    span_start: m.start(),
                    span_end: m.end(),
                    confidence: known.confidence * 0.9,
                    canonical: known.canonical.clone(),
                });
            }
        }

        // Pronouns link to the nearest preceding person or organization.
        for cap in self.pronoun.captures_iter(text) {
            let m = cap.get(1).expect("pronoun capture");
            let wanted = if m.as_str() == "It" {
                EntityType::Organization
            } else {
                EntityType::Person
            };
            let antecedent = full
                .iter()
                .rev()
                .find(|known| known.span_end <= m.start() && known.entity_type == wanted);
            if let Some(known) = antecedent {
                extra.push(DocMention {
                    entity_type: known.entity_type,
                    surface: m.as_str().to_string(),
                    span_start: m.start(),
                    span_end: m.end(),
                    confidence: known.confidence * 0.5,
                    canonical: known.canonical.clone(),
                });
            }
        }

        mentions.extend(extra);
        mentions.sort_by_key(|m| m.span_start);
    }

    fn sentences<'t>(&self, text: &'t str) -> Vec<(usize, usize, &'t str)> {
        let mut out = Vec::new();
        let mut start = 0;
        for m in self.sentence_end.find_iter(text) {
            let end = m.end();
            if end > start {
                out.push((start, end, &text[start..end]));
            }
            start = end;
        }
        if start < text.len() {
            out.push((start, text.len(), &text[start..]));
        }
        out
    }

    fn extract_relations(&self, text: &str, mentions: &[DocMention]) -> Vec<DocRelation> {
        let mut relations = Vec::new();
        for (sent_start, sent_end, _sentence) in self.sentences(text) {
            let in_sentence: Vec<&DocMention> = mentions
                .iter()
                .filter(|m| m.span_start >= sent_start && m.span_end <= sent_end)
                .collect();
            if in_sentence.len() < 2 {
                continue;
            }
            for (i, left) in in_sentence.iter().enumerate() {
                for right in in_sentence.iter().skip(i + 1) {
                    let between = &text[left.span_end.min(sent_end)..right.span_start.max(left.span_end).min(sent_end)];
                    let candidate = self.classify_pair(left, right, between);
                    if let Some((subject, predicate, object, confidence)) = candidate {
                        relations.push(DocRelation {
                            subject: subject.canonical.clone(),
                            subject_type: subject.entity_type,
                            predicate,
                            object: object.canonical.clone(),
                            object_type: object.entity_type,
                            confidence,
                            evidence_start: sent_start,
                            evidence_end: sent_end,
                        });
                    }
                }
            }
        }
        relations
    }

    /// Decide whether the text between two mentions encodes a relation, and
    /// in which direction.
    fn classify_pair<'m>(
        &self,
        left: &'m DocMention,
        right: &'m DocMention,
        between: &str,
    ) -> Option<(&'m DocMention, Predicate, &'m DocMention, f32)> {
        use EntityType::*;
        if self.founded_by.is_match(between) {
            // "Org, founded by Person" reverses the surface order.
            if left.entity_type == Organization && right.entity_type == Person {
                return Some((right, Predicate::Founded, left, 0.85));
            }
        }
        if self.founded.is_match(between)
            && left.entity_type == Person
            && right.entity_type == Organization
        {
            return Some((left, Predicate::Founded, right, 0.85));
        }
        if self.employed.is_match(between)
            && left.entity_type == Person
            && right.entity_type == Organization
        {
            return Some((left, Predicate::EmployedBy, right, 0.8));
        }
        if self.located.is_match(between)
            && matches!(left.entity_type, Organization | Person)
            && right.entity_type == Location
        {
            return Some((left, Predicate::LocatedIn, right, 0.75));
        }
        if self.authored.is_match(between)
            && left.entity_type == Person
            && right.entity_type == Work
        {
            return Some((left, Predicate::Authored, right, 0.8));
        }
        if self.cites.is_match(between)
            && left.entity_type == Work
            && right.entity_type == Work
        {
            return Some((left, Predicate::Cites, right, 0.7));
        }
        None
    }

    fn summarize(&self, text: &str) -> (String, Vec<String>) {
        let sentences = self.sentences(text);
        let summary: String = sentences
            .iter()
            .take(2)
            .map(|(_, _, s)| s.trim())
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(400)
            .collect();

        let mut key_points = Vec::new();
        for paragraph in text.split("\n\n").take(5) {
            let trimmed = paragraph.trim();
            if trimmed.is_empty() {
                continue;
            }
            let first = self
                .sentences(trimmed)
                .first()
                .map(|(_, _, s)| s.trim().to_string());
            if let Some(point) = first {
                if !point.is_empty() {
                    key_points.push(point.chars().take(200).collect());
                }
            }
        }
        (summary, key_points)
    }

    fn tag(&self, text: &str) -> Vec<String> {
        let mut counts: FxHashMap<String, usize> = FxHashMap::default();
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            if token.len() < 5 {
                continue;
            }
            let lowered = token.to_lowercase();
            if STOPWORDS.contains(&lowered.as_str()) {
                continue;
            }
            *counts.entry(lowered).or_default() += 1;
        }
        let mut ranked: Vec<(String, usize)> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.into_iter().take(8).map(|(tag, _)| tag).collect()
    }
}

impl Default for PatternAnnotator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Annotator for PatternAnnotator {
    async fn annotate(&self, text: &str) -> Result<DocAnnotation, ProviderError> {
        let mut mentions = self.collect_mentions(text);
        self.resolve_coreference(text, &mut mentions);
        let relations = self.extract_relations(text, &mentions);
        let (summary, key_points) = self.summarize(text);
        let tags = self.tag(text);
        Ok(DocAnnotation {
            summary,
            key_points,
            tags,
            mentions,
            relations,
        })
    }
}

/// Knowledge produced by linking a document annotation onto its chunks.
#[derive(Clone, Debug, Default)]
pub struct LinkedKnowledge {
    pub entities: Vec<Entity>,
    pub mentions: Vec<Mention>,
    pub relations: Vec<Relation>,
}

/// Resolve document-level mentions and relations into canonical entities,
/// chunk-scoped mentions, and merged relations. Deterministic IDs make this
/// idempotent across re-ingests; fuzzy alias merges never mint new entities.
pub fn link_annotation(
    ids: &IdService,
    annotation: &DocAnnotation,
    chunks: &[Chunk],
) -> LinkedKnowledge {
    const PRONOUN_SURFACES: &[&str] = &["He", "She", "They", "It"];

    let mut knowledge = LinkedKnowledge::default();
    let mut entity_index: FxHashMap<String, usize> = FxHashMap::default();

    // Pronoun surfaces resolve to their antecedent but never become aliases;
    // "She" must not match every future document mentioning the entity.
    let mut entity_for = |canonical: &str,
                          entity_type: EntityType,
                          surface: &str,
                          confidence: f32,
                          knowledge: &mut LinkedKnowledge|
     -> crate::ids::EntityId {
        let alias_worthy = !PRONOUN_SURFACES.contains(&surface);
        let id = ids.entity_id(canonical, entity_type);
        match entity_index.get(id.as_str()) {
            Some(&idx) => {
                let entity = &mut knowledge.entities[idx];
                if alias_worthy {
                    entity.merge_alias(surface);
                }
                entity.confidence = entity.confidence.max(confidence);
                entity.entity_id.clone()
            }
            None => {
                let mut entity = Entity {
                    entity_id: id.clone(),
                    canonical_name: canonical.to_string(),
                    aliases: Vec::new(),
                    entity_type,
                    confidence,
                };
                if alias_worthy {
                    entity.merge_alias(surface);
                }
                entity_index.insert(id.as_str().to_string(), knowledge.entities.len());
                knowledge.entities.push(entity);
                id
            }
        }
    };

    for mention in &annotation.mentions {
        let entity_id = entity_for(
            &mention.canonical,
            mention.entity_type,
            &mention.surface,
            mention.confidence,
            &mut knowledge,
        );
        let Some(chunk) = chunk_covering(chunks, mention.span_start) else {
            continue;
        };
        let span_start = mention.span_start - chunk.byte_start;
        let span_end = (mention.span_end.min(chunk.byte_end)) - chunk.byte_start;
        let mention_id = ids.mention_id(&chunk.chunk_id, span_start, span_end, &mention.surface);
        knowledge.mentions.push(Mention {
            mention_id,
            chunk_id: chunk.chunk_id.clone(),
            entity_id,
            entity_type: mention.entity_type,
            surface_text: mention.surface.clone(),
            span_start,
            span_end,
            confidence: mention.confidence,
        });
    }

    for relation in &annotation.relations {
        let subject = entity_for(
            &relation.subject,
            relation.subject_type,
            &relation.subject,
            relation.confidence,
            &mut knowledge,
        );
        let object = entity_for(
            &relation.object,
            relation.object_type,
            &relation.object,
            relation.confidence,
            &mut knowledge,
        );
        let evidence: Vec<crate::ids::ChunkId> = chunk_covering(chunks, relation.evidence_start)
            .map(|c| vec![c.chunk_id.clone()])
            .unwrap_or_default();
        let candidate = Relation {
            subject,
            predicate: relation.predicate,
            object,
            confidence: relation.confidence,
            evidence_chunk_ids: evidence,
        };
        match knowledge.relations.iter_mut().find(|r| {
            r.subject == candidate.subject
                && r.predicate == candidate.predicate
                && r.object == candidate.object
        }) {
            Some(existing) => existing.merge_from(&candidate),
            None => knowledge.relations.push(candidate),
        }
    }

    knowledge
}

fn chunk_covering(chunks: &[Chunk], offset: usize) -> Option<&Chunk> {
    chunks
        .iter()
        .find(|c| offset >= c.byte_start && offset < c.byte_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::normalize_name;

    const SAMPLE: &str = "Marie Curie joined Paris University in 1906. \
Curie later founded Radium Institute to continue the work. \
She published \"Treatise on Radioactivity\" in 1910. \
Radium Institute is based in Paris.";

    #[tokio::test]
    async fn finds_typed_mentions() {
        let annotator = PatternAnnotator::new();
        let annotation = annotator.annotate(SAMPLE).await.unwrap();
        let types: Vec<EntityType> = annotation.mentions.iter().map(|m| m.entity_type).collect();
        assert!(types.contains(&EntityType::Person));
        assert!(types.contains(&EntityType::Organization));
        assert!(types.contains(&EntityType::Date));
        assert!(types.contains(&EntityType::Work));
    }

    #[tokio::test]
    async fn short_form_coref_links_to_antecedent() {
        let annotator = PatternAnnotator::new();
        let annotation = annotator.annotate(SAMPLE).await.unwrap();
        let short = annotation
            .mentions
            .iter()
            .find(|m| m.surface == "Curie")
            .expect("short-form mention");
        assert_eq!(short.canonical, "Marie Curie");
        let pronoun = annotation
            .mentions
            .iter()
            .find(|m| m.surface == "She")
            .expect("pronoun mention");
        assert_eq!(pronoun.canonical, "Marie Curie");
    }

    #[tokio::test]
    async fn extracts_relations_with_direction() {
        let annotator = PatternAnnotator::new();
        let annotation = annotator.annotate(SAMPLE).await.unwrap();
        assert!(annotation.relations.iter().any(|r| {
            r.predicate == Predicate::Founded
                && r.subject == "Marie Curie"
                && r.object == "Radium Institute"
        }));
        assert!(annotation.relations.iter().any(|r| {
            r.predicate == Predicate::EmployedBy && r.object == "Paris University"
        }));
        assert!(annotation
            .relations
            .iter()
            .any(|r| r.predicate == Predicate::LocatedIn));
    }

    #[tokio::test]
    async fn linking_is_idempotent_and_merges_entities() {
        let annotator = PatternAnnotator::new();
        let annotation = annotator.annotate(SAMPLE).await.unwrap();
        let ids = IdService::default();
        let doc_id = crate::ids::DocId::from("urn:cl:doc:test");
        let chunk = Chunk {
            chunk_id: ids.chunk_id(&doc_id, 0, SAMPLE.len()),
            doc_id: doc_id.clone(),
            ordinal: 0,
            text: SAMPLE.to_string(),
            byte_start: 0,
            byte_end: SAMPLE.len(),
            details: crate::model::SourceDetails::Web,
            embedding: None,
        };
        let first = link_annotation(&ids, &annotation, std::slice::from_ref(&chunk));
        let second = link_annotation(&ids, &annotation, std::slice::from_ref(&chunk));

        let curie_entities: Vec<&Entity> = first
            .entities
            .iter()
            .filter(|e| normalize_name(&e.canonical_name) == "marie curie")
            .collect();
        assert_eq!(curie_entities.len(), 1);

        let ids_a: Vec<_> = first.entities.iter().map(|e| e.entity_id.clone()).collect();
        let ids_b: Vec<_> = second.entities.iter().map(|e| e.entity_id.clone()).collect();
        assert_eq!(ids_a, ids_b);

        assert!(first.mentions.iter().all(|m| m.span_end <= SAMPLE.len()));
    }
}
