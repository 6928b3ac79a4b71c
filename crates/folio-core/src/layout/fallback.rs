//! Plain text-stream fallback extraction
//!
//! Used when the structured extractor cannot read the document. The text
//! stream has no positions, so pages and lines are reconstructed:
//!
//! 1. explicit breaks: form feeds, "Page N" lines, bare page numbers
//! 2. otherwise an estimated 45 lines per page
//! 3. when that still gives two breaks or fewer, chapter/section lines,
//!    numbered headings and blank-line separated short capitalised lines
//!
//! Each pseudo-page gets synthetic geometry so the rest of the pipeline can
//! treat it like any other page.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use super::{BBox, ExtractedDocument, ExtractionSource, PageLayout, TextRun};

/// Synthetic page width (A4 in points)
pub const SYNTHETIC_PAGE_WIDTH: f32 = 595.0;

/// Synthetic page height (A4 in points)
pub const SYNTHETIC_PAGE_HEIGHT: f32 = 842.0;

/// Estimated lines per page when the text has no break markers
pub const ESTIMATED_LINES_PER_PAGE: usize = 45;

const SYNTHETIC_MARGIN: f32 = 50.0;
const SYNTHETIC_LINE_HEIGHT: f32 = 12.0;
const SYNTHETIC_LINE_STEP: f32 = 20.0;
const SYNTHETIC_BLANK_STEP: f32 = 15.0;
const SYNTHETIC_FONT_SIZE: f32 = 12.0;
const SYNTHETIC_FONT: &str = "Unknown";

static PAGE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*page\s+\d+").unwrap());
static BARE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d+\s*$").unwrap());
static NUMBERED_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.?\s+[A-Z]").unwrap());

/// Extract plain text and rebuild pseudo-pages from it
pub fn extract_document(bytes: &[u8]) -> Result<ExtractedDocument> {
    let text = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| anyhow::anyhow!("Text extractor panicked on malformed input"))?
        .context("Failed to extract text stream")?;

    Ok(ExtractedDocument {
        pages: pages_from_text(&text),
        outline: Vec::new(),
        metadata: Default::default(),
        source: ExtractionSource::TextFallback,
        skipped_pages: Vec::new(),
    })
}

/// Split a text stream into synthetic pages
pub fn pages_from_text(text: &str) -> Vec<PageLayout> {
    let lines: Vec<&str> = text.split('\n').collect();
    let breaks = page_breaks(&lines);

    let mut pages = Vec::new();
    for (i, &start) in breaks.iter().enumerate() {
        let end = breaks.get(i + 1).copied().unwrap_or(lines.len());
        if let Some(page) = synthetic_page(&lines[start..end], pages.len()) {
            pages.push(page);
        }
    }
    pages
}

fn page_breaks(lines: &[&str]) -> Vec<usize> {
    let mut breaks: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            PAGE_MARKER.is_match(line)
                || (BARE_NUMBER.is_match(trimmed) && trimmed.len() <= 3)
                || line.contains('\x0c')
        })
        .map(|(i, _)| i)
        .collect();

    if breaks.is_empty() {
        breaks = (0..lines.len()).step_by(ESTIMATED_LINES_PER_PAGE).collect();
    }

    if breaks.len() <= 2 {
        let mut extra = Vec::new();
        for i in 1..lines.len().saturating_sub(1) {
            let line = lines[i].trim();
            let prev = lines[i - 1].trim();
            let next = lines[i + 1].trim();

            if line.is_empty()
                && prev.is_empty()
                && !next.is_empty()
                && next.chars().count() < 50
                && next.chars().any(char::is_uppercase)
            {
                extra.push(i + 1);
            } else if ["Chapter", "Section", "CHAPTER", "SECTION"]
                .iter()
                .any(|p| line.starts_with(p))
                || NUMBERED_HEADING.is_match(line)
            {
                extra.push(i);
            }
        }
        if !extra.is_empty() {
            breaks.extend(extra);
            breaks.sort_unstable();
            breaks.dedup();
        }
    }

    if breaks.first() != Some(&0) {
        breaks.insert(0, 0);
    }
    breaks
}

fn synthetic_page(lines: &[&str], index: usize) -> Option<PageLayout> {
    let mut page = PageLayout::new(index, SYNTHETIC_PAGE_WIDTH, SYNTHETIC_PAGE_HEIGHT);
    let mut y = SYNTHETIC_MARGIN;

    for line in lines {
        let text = line.replace('\x0c', "");
        let text = text.trim();
        if text.is_empty() {
            y += SYNTHETIC_BLANK_STEP;
            continue;
        }
        page.runs.push(TextRun::new(
            text,
            BBox::new(
                SYNTHETIC_MARGIN,
                y,
                SYNTHETIC_PAGE_WIDTH - SYNTHETIC_MARGIN,
                y + SYNTHETIC_LINE_HEIGHT,
            ),
            SYNTHETIC_FONT,
            SYNTHETIC_FONT_SIZE,
            0,
            index,
            SYNTHETIC_PAGE_WIDTH,
            SYNTHETIC_PAGE_HEIGHT,
        ));
        y += SYNTHETIC_LINE_STEP;
    }

    page.has_text().then_some(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_feed_breaks() {
        let text = "First page line one\nFirst page line two\n\x0cSecond page text\nMore text";
        let pages = pages_from_text(text);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].runs.len(), 2);
        assert_eq!(pages[1].runs[0].text, "Second page text");
        assert_eq!(pages[1].index, 1);
    }

    #[test]
    fn test_page_marker_breaks() {
        let text = "Intro text here\nPage 2\nBody of the second page\nPage 3\nThird page body";
        let pages = pages_from_text(text);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[1].runs[0].text, "Page 2");
    }

    #[test]
    fn test_estimated_lines_per_page() {
        let text: String = (0..100)
            .map(|i| format!("plain line number {i} of body text"))
            .collect::<Vec<_>>()
            .join("\n");
        let pages = pages_from_text(&text);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].runs.len(), ESTIMATED_LINES_PER_PAGE);
        assert_eq!(pages[2].runs.len(), 10);
    }

    #[test]
    fn test_synthetic_geometry() {
        let pages = pages_from_text("alpha line\n\nbeta line");
        let runs = &pages[0].runs;
        assert_eq!(runs[0].bbox.x0, 50.0);
        assert_eq!(runs[0].bbox.x1, 545.0);
        assert_eq!(runs[0].bbox.y0, 50.0);
        // One text step plus one blank step
        assert_eq!(runs[1].bbox.y0, 50.0 + 20.0 + 15.0);
        assert_eq!(runs[0].font_name, "Unknown");
        assert_eq!(runs[0].font_size, 12.0);
        assert_eq!(pages[0].width, 595.0);
        assert_eq!(pages[0].height, 842.0);
    }

    #[test]
    fn test_empty_text_yields_no_pages() {
        assert!(pages_from_text("\n\n   \n").is_empty());
    }
}
