//! Deterministic identifier derivation and URL normalization.
//!
//! Every core identifier is a pure function of its inputs so that re-ingesting
//! the same source produces identical IDs across runs and across processes.
//! The wire form is a URN-like string: `urn:cl:<kind>:<32 hex chars>`
//! (a 128-bit truncation of a blake3 digest).
//!
//! Components of a compound ID are joined with the ASCII unit separator
//! (0x1F); literal separators and backslashes inside components are escaped
//! first, so two different component tuples can never hash identically.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::InputError;
use crate::model::EntityType;

const URN_PREFIX: &str = "urn:cl";
const SEPARATOR: char = '\u{1f}';

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub const KIND: &'static str = $kind;

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

id_type!(
    /// Identifier of an ingested document, derived from its normalized URL.
    DocId,
    "doc"
);
id_type!(
    /// Identifier of a chunk, derived from its document and byte range.
    ChunkId,
    "chunk"
);
id_type!(
    /// Identifier of an entity mention inside a chunk.
    MentionId,
    "mention"
);
id_type!(
    /// Identifier of a canonical entity, stable across documents.
    EntityId,
    "entity"
);
id_type!(
    /// Identifier of an ingestion job. Random, unlike the content IDs.
    JobId,
    "job"
);
id_type!(
    /// Identifier of a generated export artifact.
    ExportId,
    "export"
);

impl JobId {
    /// Job IDs are not content-addressed; a fresh one is random.
    pub fn random() -> Self {
        Self(format!("{URN_PREFIX}:job:{}", uuid::Uuid::new_v4().simple()))
    }
}

/// Pure ID derivation and URL normalization service. No I/O.
#[derive(Clone, Debug)]
pub struct IdService {
    tracking_params: Vec<String>,
}

impl Default for IdService {
    fn default() -> Self {
        Self::new(default_tracking_params())
    }
}

/// Query parameters stripped during URL normalization unless overridden.
pub fn default_tracking_params() -> Vec<String> {
    [
        "utm_source",
        "utm_medium",
        "utm_campaign",
        "utm_term",
        "utm_content",
        "fbclid",
        "gclid",
        "mc_cid",
        "mc_eid",
        "ref",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl IdService {
    pub fn new(tracking_params: Vec<String>) -> Self {
        Self { tracking_params }
    }

    /// Normalize a URL so that equivalent spellings map to one canonical form:
    /// lowercase scheme and host, fragment dropped, configured tracking params
    /// removed, duplicate path slashes collapsed, trailing slash removed
    /// except for the root path.
    pub fn normalize_url(&self, raw: &str) -> Result<Url, InputError> {
        let mut url = Url::parse(raw.trim()).map_err(|err| InputError::InvalidUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(InputError::InvalidUrl {
                    url: raw.to_string(),
                    reason: format!("unsupported scheme '{other}'"),
                });
            }
        }
        if url.host_str().is_none() {
            return Err(InputError::InvalidUrl {
                url: raw.to_string(),
                reason: "missing host".to_string(),
            });
        }

        url.set_fragment(None);

        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !self.is_tracking_param(key))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (k, v) in &kept {
                serializer.append_pair(k, v);
            }
            url.set_query(Some(&serializer.finish()));
        }

        let path = normalize_path(url.path());
        url.set_path(&path);

        Ok(url)
    }

    fn is_tracking_param(&self, key: &str) -> bool {
        self.tracking_params.iter().any(|p| p == key)
    }

    /// `doc_id` is the digest of the normalized URL string.
    pub fn doc_id(&self, normalized: &Url) -> DocId {
        DocId(derive(DocId::KIND, &[normalized.as_str()]))
    }

    /// Convenience: normalize then derive in one call.
    pub fn doc_id_for(&self, raw: &str) -> Result<(Url, DocId), InputError> {
        let url = self.normalize_url(raw)?;
        let id = self.doc_id(&url);
        Ok((url, id))
    }

    pub fn chunk_id(&self, doc_id: &DocId, byte_start: usize, byte_end: usize) -> ChunkId {
        ChunkId(derive(
            ChunkId::KIND,
            &[
                doc_id.as_str(),
                &byte_start.to_string(),
                &byte_end.to_string(),
            ],
        ))
    }

    pub fn mention_id(
        &self,
        chunk_id: &ChunkId,
        span_start: usize,
        span_end: usize,
        surface: &str,
    ) -> MentionId {
        MentionId(derive(
            MentionId::KIND,
            &[
                chunk_id.as_str(),
                &span_start.to_string(),
                &span_end.to_string(),
                surface,
            ],
        ))
    }

    /// Entity IDs hash the whitespace-collapsed, lowercased canonical name
    /// plus the entity type, so the same real-world referent converges across
    /// documents.
    pub fn entity_id(&self, canonical_name: &str, entity_type: EntityType) -> EntityId {
        let normalized = normalize_name(canonical_name);
        EntityId(derive(
            EntityId::KIND,
            &[&normalized, entity_type.as_str()],
        ))
    }

    pub fn export_id(&self, source_doc_ids: &[DocId], format: &str) -> ExportId {
        let mut parts: Vec<&str> = source_doc_ids.iter().map(DocId::as_str).collect();
        parts.push(format);
        ExportId(derive(ExportId::KIND, &parts))
    }
}

/// Collapse whitespace runs and lowercase; used for entity canonicalization.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Digest of the extracted normalized text; keys the screening cache so the
/// same content published at several URLs reuses one screening decision.
pub fn content_hash(text: &str) -> String {
    let digest = blake3::hash(text.as_bytes());
    hex::encode(&digest.as_bytes()[..16])
}

fn derive(kind: &str, components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (i, component) in components.iter().enumerate() {
        if i > 0 {
            hasher.update(SEPARATOR.to_string().as_bytes());
        }
        hasher.update(escape(component).as_bytes());
    }
    let digest = hasher.finalize();
    format!(
        "{URN_PREFIX}:{kind}:{}",
        hex::encode(&digest.as_bytes()[..16])
    )
}

fn escape(component: &str) -> String {
    if !component.contains(['\\', SEPARATOR]) {
        return component.to_string();
    }
    let mut out = String::with_capacity(component.len() + 2);
    for ch in component.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            SEPARATOR => out.push_str("\\u"),
            other => out.push(other),
        }
    }
    out
}

fn normalize_path(path: &str) -> String {
    let mut collapsed = String::with_capacity(path.len());
    let mut prev_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        collapsed.push(ch);
    }
    if collapsed.len() > 1 && collapsed.ends_with('/') {
        collapsed.pop();
    }
    if collapsed.is_empty() {
        collapsed.push('/');
    }
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> IdService {
        IdService::default()
    }

    #[test]
    fn tracking_params_are_stripped() {
        let ids = service();
        let a = ids.doc_id_for("https://example.com/a?utm_source=x").unwrap();
        let b = ids.doc_id_for("https://example.com/a").unwrap();
        assert_eq!(a.1, b.1);
        assert_eq!(a.0.as_str(), "https://example.com/a");
    }

    #[test]
    fn host_and_scheme_are_lowercased() {
        let ids = service();
        let a = ids.doc_id_for("HTTPS://Example.COM/Path").unwrap();
        let b = ids.doc_id_for("https://example.com/Path").unwrap();
        assert_eq!(a.1, b.1);
    }

    #[test]
    fn trailing_slash_removed_except_root() {
        let ids = service();
        let a = ids.normalize_url("https://example.com/docs/").unwrap();
        assert_eq!(a.path(), "/docs");
        let root = ids.normalize_url("https://example.com/").unwrap();
        assert_eq!(root.path(), "/");
    }

    #[test]
    fn duplicate_slashes_collapse() {
        let ids = service();
        let a = ids.normalize_url("https://example.com//a///b").unwrap();
        assert_eq!(a.path(), "/a/b");
    }

    #[test]
    fn fragment_is_dropped() {
        let ids = service();
        let a = ids.doc_id_for("https://example.com/a#section-2").unwrap();
        let b = ids.doc_id_for("https://example.com/a").unwrap();
        assert_eq!(a.1, b.1);
    }

    #[test]
    fn non_http_scheme_rejected() {
        let err = service().normalize_url("ftp://example.com/a").unwrap_err();
        assert!(matches!(err, InputError::InvalidUrl { .. }));
    }

    #[test]
    fn ids_are_deterministic_and_urn_shaped() {
        let ids = service();
        let (_, doc) = ids.doc_id_for("https://example.com/a").unwrap();
        let chunk = ids.chunk_id(&doc, 0, 1000);
        let again = ids.chunk_id(&doc, 0, 1000);
        assert_eq!(chunk, again);
        assert!(chunk.as_str().starts_with("urn:cl:chunk:"));
        assert_eq!(chunk.as_str().len(), "urn:cl:chunk:".len() + 32);
    }

    #[test]
    fn component_boundaries_cannot_collide() {
        let a = derive("x", &["ab", "c"]);
        let b = derive("x", &["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn entity_id_normalizes_name() {
        let ids = service();
        let a = ids.entity_id("Marie  Curie", EntityType::Person);
        let b = ids.entity_id("marie curie", EntityType::Person);
        assert_eq!(a, b);
        let c = ids.entity_id("marie curie", EntityType::Organization);
        assert_ne!(a, c);
    }

    #[test]
    fn job_ids_are_random() {
        assert_ne!(JobId::random(), JobId::random());
    }
}
