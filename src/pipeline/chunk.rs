//! Sliding-window chunking with byte-accurate offsets.
//!
//! Chunks target `target_chars` characters with `overlap_chars` of overlap,
//! biased toward sentence boundaries when one falls inside the overlap
//! window. Offsets are byte positions into the normalized text so citations
//! can quote exact source ranges; all cuts land on char boundaries.

use crate::config::ChunkConfig;
use crate::extract::TranscriptLine;

/// A cut of the normalized text, before IDs and embeddings are attached.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkSlice {
    pub byte_start: usize,
    pub byte_end: usize,
    pub text: String,
}

#[derive(Clone, Debug)]
pub struct Chunker {
    target_chars: usize,
    overlap_chars: usize,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Self {
        let target_chars = config.target_chars.max(1);
        // Overlap must leave room for forward progress.
        let overlap_chars = config.overlap_chars.min(target_chars / 2);
        Self {
            target_chars,
            overlap_chars,
        }
    }

    /// Split `text` into overlapping windows. A text at or under the target
    /// yields exactly one chunk spanning the whole input.
    pub fn split(&self, text: &str) -> Vec<ChunkSlice> {
        if text.is_empty() {
            return Vec::new();
        }

        // Byte offset of every char boundary, plus the end sentinel.
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let total_chars = boundaries.len() - 1;

        if total_chars <= self.target_chars {
            return vec![ChunkSlice {
                byte_start: 0,
                byte_end: text.len(),
                text: text.to_string(),
            }];
        }

        let mut slices = Vec::new();
        let mut start_char = 0usize;
        loop {
            let hard_end = (start_char + self.target_chars).min(total_chars);
            let end_char = if hard_end < total_chars {
                self.biased_end(text, &boundaries, start_char, hard_end)
            } else {
                hard_end
            };

            let byte_start = boundaries[start_char];
            let byte_end = boundaries[end_char];
            slices.push(ChunkSlice {
                byte_start,
                byte_end,
                text: text[byte_start..byte_end].to_string(),
            });

            if end_char >= total_chars {
                break;
            }
            let next = end_char.saturating_sub(self.overlap_chars);
            // Overlap may never stall the window.
            start_char = next.max(start_char + 1);
        }
        slices
    }

    /// Prefer cutting just after a sentence end found within the tail
    /// `overlap_chars` of the window; fall back to the hard cut.
    fn biased_end(
        &self,
        text: &str,
        boundaries: &[usize],
        start_char: usize,
        hard_end: usize,
    ) -> usize {
        let search_from = hard_end
            .saturating_sub(self.overlap_chars.max(1))
            .max(start_char + 1);
        let mut best = None;
        for candidate in search_from..hard_end {
            let byte = boundaries[candidate];
            let ch = text[byte..].chars().next();
            if matches!(ch, Some('.') | Some('!') | Some('?') | Some('\n')) {
                let after = boundaries[candidate + 1];
                let next_is_break = text[after..]
                    .chars()
                    .next()
                    .is_none_or(|c| c.is_whitespace());
                if next_is_break {
                    best = Some(candidate + 1);
                }
            }
        }
        best.unwrap_or(hard_end)
    }
}

/// Seconds to a `HH:MM:SS` wall-clock label.
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Timeline range covered by a byte range of the normalized transcript text.
/// Returns the start of the first overlapping line and the end of the last.
pub fn timestamp_range(
    lines: &[TranscriptLine],
    byte_start: usize,
    byte_end: usize,
) -> Option<(f64, f64)> {
    let mut start = None;
    let mut end = None;
    for line in lines {
        if line.byte_end <= byte_start || line.byte_start >= byte_end {
            continue;
        }
        if start.is_none() {
            start = Some(line.start_seconds);
        }
        end = Some(line.end_seconds);
    }
    match (start, end) {
        (Some(s), Some(e)) => Some((s, e)),
        _ => None,
    }
}
