//! Chunk post-processing: cleaning, titles, quality scores and semantic markers

use std::cmp::Ordering;
use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{SemanticChunk, SemanticMarker, DEFAULT_SECTION_TITLE};

/// Chunks shorter than this after cleaning are dropped
pub const MIN_CHUNK_CHARS: usize = 50;

/// Section title is prepended unless it appears within this many leading characters
pub const TITLE_WINDOW_CHARS: usize = 100;

/// Upper bound of the quality score
pub const MAX_QUALITY: f32 = 2.0;

static MARKER_PATTERNS: Lazy<Vec<(SemanticMarker, Regex)>> = Lazy::new(|| {
    [
        (SemanticMarker::Introductory, r"(?i)\b(introduction|overview|summary)\b"),
        (SemanticMarker::Conclusive, r"(?i)\b(conclusion|summary|final)\b"),
        (SemanticMarker::Methodological, r"(?i)\b(method|approach|process)\b"),
        (SemanticMarker::Results, r"(?i)\b(result|finding|outcome)\b"),
        (SemanticMarker::VisualReference, r"(?i)\b(table|figure|chart|graph)\b"),
        (SemanticMarker::Technical, r"(?i)\b(algorithm|formula|equation)\b"),
    ]
    .into_iter()
    .map(|(marker, pattern)| (marker, Regex::new(pattern).unwrap()))
    .collect()
});

/// Replace control characters, drop NULs and collapse all whitespace to single spaces
pub fn clean_text(text: &str) -> String {
    let replaced: String = text
        .chars()
        .filter(|c| *c != '\0')
        .map(|c| {
            if (c.is_control() && !c.is_whitespace()) || c == char::REPLACEMENT_CHARACTER {
                ' '
            } else {
                c
            }
        })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Length, sentence-structure and vocabulary heuristic in `0.0..=2.0`
pub fn content_quality(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }
    let mut score = 0.0f32;

    let length = text.chars().count();
    if (100..=1000).contains(&length) {
        score += 1.0;
    } else if (50..2000).contains(&length) {
        score += 0.5;
    }

    let sentences = text.chars().filter(|c| matches!(c, '.' | '!' | '?')).count();
    if sentences > 0 {
        score += (sentences as f32 * 0.1).min(0.5);
    }

    let lower = text.to_lowercase();
    let distinct_lower: HashSet<&str> = lower.split_whitespace().collect();
    if distinct_lower.len() > 10 {
        score += 0.3;
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    let distinct: HashSet<&str> = words.iter().copied().collect();
    score += distinct.len() as f32 / words.len().max(1) as f32 * 0.2;

    score.min(MAX_QUALITY)
}

/// Keyword-category markers present in the text, in a fixed order
pub fn semantic_markers(text: &str) -> Vec<SemanticMarker> {
    MARKER_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(marker, _)| *marker)
        .collect()
}

/// Clean, title, score and order chunks; drops chunks that end up too short
pub fn post_process(chunks: Vec<SemanticChunk>) -> Vec<SemanticChunk> {
    let mut out: Vec<SemanticChunk> = chunks
        .into_iter()
        .filter_map(|c| refine_chunk(c, MIN_CHUNK_CHARS))
        .collect();
    sort_chunks(&mut out);
    out
}

/// Clean, title and score a single chunk; `None` if it ends up shorter than `min_chars`
pub fn refine_chunk(mut chunk: SemanticChunk, min_chars: usize) -> Option<SemanticChunk> {
    let mut text = clean_text(&chunk.text);
    if let Some(title) = chunk.section_title.as_deref().filter(|t| !t.is_empty()) {
        let window: String = text.chars().take(TITLE_WINDOW_CHARS).collect();
        if !window.contains(title) {
            text = format!("[{title}]\n\n{text}");
        }
    }
    if text.trim().chars().count() < min_chars {
        return None;
    }

    chunk.content_quality_score = content_quality(&text);
    chunk.semantic_markers = semantic_markers(&text);
    chunk.text = text;
    if chunk.section_title.as_deref().map_or(true, str::is_empty) {
        chunk.section_title = Some(DEFAULT_SECTION_TITLE.to_string());
    }
    Some(chunk)
}

/// Score outline chunks without dropping or re-titling them
pub fn finish_outline_chunks(chunks: Vec<SemanticChunk>) -> Vec<SemanticChunk> {
    chunks
        .into_iter()
        .filter_map(|mut chunk| {
            chunk.text = clean_text(&chunk.text);
            if chunk.text.is_empty() {
                return None;
            }
            chunk.content_quality_score = content_quality(&chunk.text);
            chunk.semantic_markers = semantic_markers(&chunk.text);
            Some(chunk)
        })
        .collect()
}

/// Page ascending, then quality descending; stable for equal keys
pub fn sort_chunks(chunks: &mut [SemanticChunk]) {
    chunks.sort_by(|a, b| {
        a.page_number.cmp(&b.page_number).then(
            b.content_quality_score
                .partial_cmp(&a.content_quality_score)
                .unwrap_or(Ordering::Equal),
        )
    });
}
