//! Source extraction seam.
//!
//! Fetching and format-specific parsing (HTML readability, PDF text layers,
//! YouTube transcripts) are external collaborators. This module owns the
//! trait they implement, the registry that selects one by source type, and
//! the normalized shape they all produce.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use url::Url;

use crate::errors::ExtractError;
use crate::model::SourceType;

/// One transcript line with its position in the normalized text and its
/// place on the video timeline.
#[derive(Clone, Debug, PartialEq)]
pub struct TranscriptLine {
    pub byte_start: usize,
    pub byte_end: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
}

/// Normalized output of an extractor: UTF-8 text plus source metadata.
#[derive(Clone, Debug, Default)]
pub struct RawContent {
    pub text: String,
    /// Original fetched bytes, stored verbatim as the document blob.
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
    pub video_id: Option<String>,
    pub channel: Option<String>,
    /// Present for youtube sources; maps normalized-text ranges to timestamps.
    pub transcript: Option<Vec<TranscriptLine>>,
    /// Page break byte offsets for pdf sources (offset where page N+1 starts).
    pub page_breaks: Option<Vec<usize>>,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &Url) -> Result<RawContent, ExtractError>;
}

impl std::fmt::Debug for dyn Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Extractor")
    }
}

/// Classify a normalized URL into a source type. YouTube hosts and `.pdf`
/// paths are special-cased; everything else is treated as a web page.
pub fn sniff_source_type(url: &Url) -> SourceType {
    let host = url.host_str().unwrap_or_default();
    if host == "www.youtube.com"
        || host == "youtube.com"
        || host == "m.youtube.com"
        || host == "youtu.be"
    {
        return SourceType::Youtube;
    }
    if url.path().to_ascii_lowercase().ends_with(".pdf") {
        return SourceType::Pdf;
    }
    SourceType::Web
}

/// Extract the video id from a normalized YouTube URL.
pub fn youtube_video_id(url: &Url) -> Option<String> {
    if url.host_str() == Some("youtu.be") {
        return url.path_segments()?.next().map(|s| s.to_string());
    }
    url.query_pairs()
        .find(|(k, _)| k == "v")
        .map(|(_, v)| v.into_owned())
}

/// Selects an extractor implementation per source type.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    by_type: FxHashMap<SourceType, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, source_type: SourceType, extractor: Arc<dyn Extractor>) -> Self {
        self.by_type.insert(source_type, extractor);
        self
    }

    pub fn register(&mut self, source_type: SourceType, extractor: Arc<dyn Extractor>) {
        self.by_type.insert(source_type, extractor);
    }

    pub fn get(&self, source_type: SourceType) -> Result<Arc<dyn Extractor>, ExtractError> {
        self.by_type.get(&source_type).cloned().ok_or_else(|| {
            ExtractError::Unsupported(format!("no extractor registered for {source_type}"))
        })
    }
}

pub mod fake {
    //! In-process extractors for tests: serve canned content per URL.

    use parking_lot::Mutex;

    use super::*;

    /// Serves preloaded content keyed by normalized URL string. Unknown URLs
    /// produce a configurable failure, defaulting to 404.
    pub struct StaticExtractor {
        pages: Mutex<FxHashMap<String, RawContent>>,
        missing: ExtractError,
        /// Errors returned before the first success, to exercise retries.
        failures: Mutex<Vec<ExtractError>>,
    }

    impl StaticExtractor {
        pub fn new() -> Self {
            Self {
                pages: Mutex::new(FxHashMap::default()),
                missing: ExtractError::Http { status: 404 },
                failures: Mutex::new(Vec::new()),
            }
        }

        pub fn with_page(self, url: &str, content: RawContent) -> Self {
            self.pages.lock().insert(url.to_string(), content);
            self
        }

        pub fn with_missing(mut self, err: ExtractError) -> Self {
            self.missing = err;
            self
        }

        /// Queue transient failures to be served before any page.
        pub fn fail_times(self, err: ExtractError, times: usize) -> Self {
            {
                let mut failures = self.failures.lock();
                for _ in 0..times {
                    failures.push(err.clone());
                }
            }
            self
        }

        pub fn insert(&self, url: &str, content: RawContent) {
            self.pages.lock().insert(url.to_string(), content);
        }
    }

    impl Default for StaticExtractor {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Extractor for StaticExtractor {
        async fn extract(&self, url: &Url) -> Result<RawContent, ExtractError> {
            if let Some(err) = self.failures.lock().pop() {
                return Err(err);
            }
            self.pages
                .lock()
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| self.missing.clone())
        }
    }

    /// Build a plain web page fixture.
    pub fn web_page(text: &str, title: &str) -> RawContent {
        RawContent {
            text: text.to_string(),
            bytes: text.as_bytes().to_vec(),
            content_type: "text/html".to_string(),
            title: Some(title.to_string()),
            ..RawContent::default()
        }
    }

    /// Build a youtube transcript fixture: lines joined with newlines, each
    /// line covering `seconds_per_line` of the timeline.
    pub fn youtube_transcript(
        lines: &[&str],
        video_id: &str,
        channel: &str,
        seconds_per_line: f64,
    ) -> RawContent {
        let mut text = String::new();
        let mut transcript = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            let byte_start = text.len();
            text.push_str(line);
            let byte_end = text.len();
            if i + 1 < lines.len() {
                text.push('\n');
            }
            transcript.push(TranscriptLine {
                byte_start,
                byte_end,
                start_seconds: i as f64 * seconds_per_line,
                end_seconds: (i + 1) as f64 * seconds_per_line,
            });
        }
        RawContent {
            bytes: text.as_bytes().to_vec(),
            text,
            content_type: "text/vtt".to_string(),
            title: Some(format!("video {video_id}")),
            duration_seconds: Some((lines.len() as f64 * seconds_per_line) as u64),
            video_id: Some(video_id.to_string()),
            channel: Some(channel.to_string()),
            transcript: Some(transcript),
            ..RawContent::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffing_recognizes_youtube_and_pdf() {
        let yt = Url::parse("https://www.youtube.com/watch?v=VID").unwrap();
        assert_eq!(sniff_source_type(&yt), SourceType::Youtube);
        assert_eq!(youtube_video_id(&yt).as_deref(), Some("VID"));

        let short = Url::parse("https://youtu.be/VID2").unwrap();
        assert_eq!(sniff_source_type(&short), SourceType::Youtube);
        assert_eq!(youtube_video_id(&short).as_deref(), Some("VID2"));

        let pdf = Url::parse("https://example.com/paper.PDF").unwrap();
        assert_eq!(sniff_source_type(&pdf), SourceType::Pdf);

        let web = Url::parse("https://example.com/article").unwrap();
        assert_eq!(sniff_source_type(&web), SourceType::Web);
    }

    #[tokio::test]
    async fn registry_rejects_unregistered_types() {
        let registry = ExtractorRegistry::new();
        let err = registry.get(SourceType::Pdf).unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[tokio::test]
    async fn static_extractor_serves_queued_failures_first() {
        let extractor = fake::StaticExtractor::new()
            .with_page("https://example.com/a", fake::web_page("body", "A"))
            .fail_times(ExtractError::Http { status: 503 }, 1);
        let url = Url::parse("https://example.com/a").unwrap();
        assert!(extractor.extract(&url).await.is_err());
        assert!(extractor.extract(&url).await.is_ok());
    }
}
