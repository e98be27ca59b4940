//! Citation marker extraction and validation.
//!
//! Markers are `[k]` tokens in the answer text. Markers inside fenced code
//! blocks, inline code spans, or double-quoted strings are ignored: quoted
//! source text may legitimately contain bracketed numbers that are not
//! citations.

use regex::Regex;
use std::sync::OnceLock;

use crate::errors::QueryError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CitationMarker {
    pub index: usize,
    /// Byte offset of the `[` in the answer text.
    pub position: usize,
}

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("marker pattern"))
}

/// Byte mask of regions to ignore: fenced code blocks, inline code, quoted
/// strings.
fn ignored_regions(text: &str) -> Vec<bool> {
    let mut masked = vec![false; text.len()];
    let mut in_fence = false;
    let mut in_inline = false;
    let mut in_quote = false;

    let bytes = text.as_bytes();
    let mut i = 0;
    let mut line_start = true;
    while i < bytes.len() {
        if line_start && bytes[i..].starts_with(b"```") {
            in_fence = !in_fence;
            for slot in masked.iter_mut().skip(i).take(3) {
                *slot = true;
            }
            i += 3;
            line_start = false;
            continue;
        }
        let b = bytes[i];
        if in_fence {
            masked[i] = true;
        } else if b == b'`' {
            in_inline = !in_inline;
            masked[i] = true;
        } else if b == b'"' && !in_inline {
            in_quote = !in_quote;
            masked[i] = true;
        } else if in_inline || in_quote {
            masked[i] = true;
        }
        line_start = b == b'\n';
        if b == b'\n' {
            // Quotes do not span lines; unterminated quotes would otherwise
            // swallow the rest of the answer.
            in_quote = false;
        }
        i += 1;
    }
    masked
}

/// Extract citation markers outside ignored regions, in textual order.
pub fn extract_markers(answer: &str) -> Vec<CitationMarker> {
    let masked = ignored_regions(answer);
    marker_pattern()
        .captures_iter(answer)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            if masked.get(whole.start()).copied().unwrap_or(false) {
                return None;
            }
            let index: usize = cap.get(1)?.as_str().parse().ok()?;
            Some(CitationMarker {
                index,
                position: whole.start(),
            })
        })
        .collect()
}

/// A validated answer: every marker falls inside `1..=table_len`.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedAnswer {
    pub answer: String,
    pub markers: Vec<CitationMarker>,
    /// Distinct cited indices, ascending.
    pub cited_indices: Vec<usize>,
}

/// Check every `[k]` against the table size. Out-of-range markers fail the
/// whole answer; no partial answer is returned.
pub fn validate_answer(answer: &str, table_len: usize) -> Result<ValidatedAnswer, QueryError> {
    let markers = extract_markers(answer);
    let mut offenders: Vec<usize> = markers
        .iter()
        .filter(|m| m.index == 0 || m.index > table_len)
        .map(|m| m.index)
        .collect();
    if !offenders.is_empty() {
        offenders.sort_unstable();
        offenders.dedup();
        return Err(QueryError::InvalidCitationIndex { indices: offenders });
    }
    let mut cited: Vec<usize> = markers.iter().map(|m| m.index).collect();
    cited.sort_unstable();
    cited.dedup();
    Ok(ValidatedAnswer {
        answer: answer.to_string(),
        markers,
        cited_indices: cited,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_markers_in_order() {
        let markers = extract_markers("Claim one [1]. Claim two [3] and [2].");
        let indices: Vec<usize> = markers.iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![1, 3, 2]);
    }

    #[test]
    fn ignores_markers_in_fenced_code() {
        let answer = "Real claim [1].\n```\narr[2] = 5;\n```\nAnother [2].";
        let indices: Vec<usize> = extract_markers(answer).iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn ignores_markers_in_inline_code_and_quotes() {
        let answer = "Use `v[3]` carefully [1]. The source says \"see [9] above\" [2].";
        let indices: Vec<usize> = extract_markers(answer).iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn in_range_markers_validate() {
        let validated = validate_answer("A [1] and B [2].", 3).unwrap();
        assert_eq!(validated.cited_indices, vec![1, 2]);
    }

    #[test]
    fn out_of_range_markers_fail_with_offenders() {
        let err = validate_answer("A [1], bogus [9], zero [0].", 3).unwrap_err();
        match err {
            QueryError::InvalidCitationIndex { indices } => {
                assert_eq!(indices, vec![0, 9]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn mutating_one_marker_out_of_range_is_caught() {
        // The fuzz-style regression from the validation contract: a single
        // mutated marker must flip a valid answer to invalid.
        let valid = "Finding [1]; more [2]; last [3].";
        assert!(validate_answer(valid, 3).is_ok());
        let mutated = valid.replace("[2]", "[9]");
        let err = validate_answer(&mutated, 3).unwrap_err();
        assert!(matches!(
            err,
            QueryError::InvalidCitationIndex { ref indices } if indices == &vec![9]
        ));
    }
}
