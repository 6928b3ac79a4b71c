//! Fast path: one chunk per embedded outline entry

use tracing::debug;

use super::{ChunkType, ExtractionMethod, SemanticChunk};
use crate::features::merge_lines;
use crate::layout::{OutlineEntry, PageLayout};

/// Zero-based inclusive page range covered by outline entry `i`
///
/// An entry runs from its own page to the page before the next entry starts
/// (never less than its own page); the last entry runs to the final page.
pub fn entry_range(outline: &[OutlineEntry], i: usize, page_count: usize) -> Option<(usize, usize)> {
    let last_page = page_count.checked_sub(1)?;
    let start = outline[i].page.saturating_sub(1);
    if start > last_page {
        return None;
    }
    let end = match outline.get(i + 1) {
        Some(next) => next.page.saturating_sub(1).saturating_sub(1).max(start),
        None => last_page,
    };
    Some((start, end.min(last_page)))
}

fn page_text(page: &PageLayout) -> String {
    merge_lines(&page.runs)
        .into_iter()
        .map(|l| l.text)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build chunks straight from the outline; entries without text are skipped
pub fn chunks_from_outline(outline: &[OutlineEntry], pages: &[PageLayout]) -> Vec<SemanticChunk> {
    let mut chunks = Vec::with_capacity(outline.len());
    for (i, entry) in outline.iter().enumerate() {
        let Some((start, end)) = entry_range(outline, i, pages.len()) else {
            debug!("Outline entry '{}' points past the last page", entry.title);
            continue;
        };
        let text = pages[start..=end]
            .iter()
            .map(page_text)
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            debug!("Outline entry '{}' has no text", entry.title);
            continue;
        }
        chunks.push(SemanticChunk::new(
            start,
            text,
            Some(entry.title.clone()),
            ChunkType::from_level(entry.level),
            ExtractionMethod::EmbeddedToc,
        ));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::test_support::{page, run};

    fn entry(level: usize, title: &str, page: usize) -> OutlineEntry {
        OutlineEntry {
            level,
            title: title.to_string(),
            page,
        }
    }

    fn pages(n: usize) -> Vec<PageLayout> {
        (0..n)
            .map(|i| page(i, vec![run(&format!("Text of page {i}"), 72.0, 100.0, 200.0, 12.0, i)]))
            .collect()
    }

    #[test]
    fn test_entry_ranges() {
        let outline = vec![entry(1, "A", 1), entry(2, "B", 3), entry(1, "C", 3), entry(1, "D", 5)];
        assert_eq!(entry_range(&outline, 0, 6), Some((0, 1)));
        // Next entry starts on the same page: range is just the start page
        assert_eq!(entry_range(&outline, 1, 6), Some((2, 2)));
        assert_eq!(entry_range(&outline, 2, 6), Some((2, 3)));
        assert_eq!(entry_range(&outline, 3, 6), Some((4, 5)));
        assert_eq!(entry_range(&[entry(1, "X", 9)], 0, 6), None);
    }

    #[test]
    fn test_chunks_follow_outline() {
        let outline = vec![entry(1, "Intro", 1), entry(4, "Deep", 2), entry(2, "End", 3)];
        let chunks = chunks_from_outline(&outline, &pages(4));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].page_number, 0);
        assert_eq!(chunks[1].chunk_type, ChunkType::H3);
        assert_eq!(chunks[2].text, "Text of page 2\nText of page 3");
        assert!(chunks.iter().all(|c| c.extraction_method == ExtractionMethod::EmbeddedToc));
        assert_eq!(chunks[0].section_title.as_deref(), Some("Intro"));
    }

    #[test]
    fn test_empty_entry_skipped() {
        let mut ps = pages(3);
        ps[1].runs.clear();
        let outline = vec![entry(1, "A", 1), entry(1, "Blank", 2), entry(1, "C", 3)];
        let chunks = chunks_from_outline(&outline, &ps);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].section_title.as_deref(), Some("C"));
    }
}
