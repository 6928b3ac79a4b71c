//! Chunk building: classified lines to semantically coherent chunks
//!
//! Entry paths, in order of preference:
//!
//! 1. **Outline**: one chunk per embedded outline entry (see [`outline`])
//! 2. **Sections**: headings open sections, body lines accumulate, long
//!    sections are split at sentence boundaries
//! 3. **Pages**: one chunk (or a few sentence-packed pieces) per page when
//!    the section walk yields nothing
//! 4. **Simple fallback**: one chunk per pseudo-page of the text-stream
//!    extractor, used when the structured pipeline fails outright

pub mod outline;
pub mod post;
pub mod split;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::{Classification, HeadingLabel};
use crate::layout::PageLayout;

pub use outline::chunks_from_outline;
pub use post::{clean_text, content_quality, post_process, refine_chunk, semantic_markers, sort_chunks};

/// Lines shorter than this are ignored when building sections
pub const MIN_LINE_CHARS: usize = 3;

/// Finalized sections with less body text than this are discarded
pub const MIN_SECTION_CHARS: usize = 30;

/// Chunks longer than this are split
pub const MAX_CHUNK_CHARS: usize = 2000;

/// Hard cut position when no sentence boundary exists
pub const HARD_CUT_CHARS: usize = 1500;

/// Target size of page-fallback pieces
pub const PAGE_PIECE_CHARS: usize = 1500;

/// Sections holding more body lines than this at a page end are flushed per page
pub const PAGE_SECTION_LINES: usize = 20;

/// Title given to chunks that end up without one
pub const DEFAULT_SECTION_TITLE: &str = "Untitled Section";

/// Structural kind of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkType {
    H1,
    H2,
    H3,
    #[serde(rename = "content")]
    Content,
    #[serde(rename = "page_section")]
    PageSection,
    #[serde(rename = "fallback")]
    Fallback,
}

impl ChunkType {
    /// Heading chunk type for an outline depth; deeper levels collapse to H3
    pub fn from_level(level: usize) -> Self {
        match level {
            0 | 1 => ChunkType::H1,
            2 => ChunkType::H2,
            _ => ChunkType::H3,
        }
    }

    pub fn from_label(label: HeadingLabel) -> Self {
        match label {
            HeadingLabel::H1 => ChunkType::H1,
            HeadingLabel::H2 => ChunkType::H2,
            HeadingLabel::H3 => ChunkType::H3,
            HeadingLabel::Paragraph => ChunkType::Content,
        }
    }

    pub fn heading_level(self) -> Option<u8> {
        match self {
            ChunkType::H1 => Some(1),
            ChunkType::H2 => Some(2),
            ChunkType::H3 => Some(3),
            _ => None,
        }
    }

    pub fn is_heading(self) -> bool {
        self.heading_level().is_some()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkType::H1 => "H1",
            ChunkType::H2 => "H2",
            ChunkType::H3 => "H3",
            ChunkType::Content => "content",
            ChunkType::PageSection => "page_section",
            ChunkType::Fallback => "fallback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "H1" => Some(ChunkType::H1),
            "H2" => Some(ChunkType::H2),
            "H3" => Some(ChunkType::H3),
            "content" => Some(ChunkType::Content),
            "page_section" => Some(ChunkType::PageSection),
            "fallback" => Some(ChunkType::Fallback),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which path produced a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    EmbeddedToc,
    EnhancedPipeline,
    PageFallback,
    SimpleFallback,
}

impl ExtractionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionMethod::EmbeddedToc => "embedded_toc",
            ExtractionMethod::EnhancedPipeline => "enhanced_pipeline",
            ExtractionMethod::PageFallback => "page_fallback",
            ExtractionMethod::SimpleFallback => "simple_fallback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "embedded_toc" => Some(ExtractionMethod::EmbeddedToc),
            "enhanced_pipeline" => Some(ExtractionMethod::EnhancedPipeline),
            "page_fallback" => Some(ExtractionMethod::PageFallback),
            "simple_fallback" => Some(ExtractionMethod::SimpleFallback),
            _ => None,
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyword category detected in a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticMarker {
    Introductory,
    Conclusive,
    Methodological,
    Results,
    VisualReference,
    Technical,
}

impl SemanticMarker {
    pub fn as_str(self) -> &'static str {
        match self {
            SemanticMarker::Introductory => "introductory",
            SemanticMarker::Conclusive => "conclusive",
            SemanticMarker::Methodological => "methodological",
            SemanticMarker::Results => "results",
            SemanticMarker::VisualReference => "visual_reference",
            SemanticMarker::Technical => "technical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            SemanticMarker::Introductory,
            SemanticMarker::Conclusive,
            SemanticMarker::Methodological,
            SemanticMarker::Results,
            SemanticMarker::VisualReference,
            SemanticMarker::Technical,
        ]
        .into_iter()
        .find(|m| m.as_str() == s)
    }
}

/// A bounded unit of document text with page and structure metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticChunk {
    /// Zero-based source page
    pub page_number: usize,
    pub text: String,
    pub section_title: Option<String>,
    pub chunk_type: ChunkType,
    pub extraction_method: ExtractionMethod,
    /// Heuristic quality in `0.0..=2.0`
    pub content_quality_score: f32,
    pub semantic_markers: Vec<SemanticMarker>,
}

impl SemanticChunk {
    pub fn new(
        page_number: usize,
        text: impl Into<String>,
        section_title: Option<String>,
        chunk_type: ChunkType,
        extraction_method: ExtractionMethod,
    ) -> Self {
        Self {
            page_number,
            text: text.into(),
            section_title,
            chunk_type,
            extraction_method,
            content_quality_score: 0.0,
            semantic_markers: Vec::new(),
        }
    }

    pub fn heading_level(&self) -> Option<u8> {
        self.chunk_type.heading_level()
    }

    pub fn title_or_default(&self) -> &str {
        self.section_title.as_deref().unwrap_or(DEFAULT_SECTION_TITLE)
    }
}

/// Length and grouping limits for chunk building
#[derive(Debug, Clone)]
pub struct ChunkSettings {
    pub min_line_chars: usize,
    /// Post-processed chunks shorter than this are dropped
    pub min_chunk_chars: usize,
    pub min_section_chars: usize,
    pub max_chunk_chars: usize,
    pub hard_cut_chars: usize,
    pub page_piece_chars: usize,
    pub page_section_lines: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            min_line_chars: MIN_LINE_CHARS,
            min_chunk_chars: post::MIN_CHUNK_CHARS,
            min_section_chars: MIN_SECTION_CHARS,
            max_chunk_chars: MAX_CHUNK_CHARS,
            hard_cut_chars: HARD_CUT_CHARS,
            page_piece_chars: PAGE_PIECE_CHARS,
            page_section_lines: PAGE_SECTION_LINES,
        }
    }
}

#[derive(Debug, Default)]
struct OpenSection {
    title: Option<String>,
    label: Option<HeadingLabel>,
    start_page: usize,
    /// (page, line text)
    body: Vec<(usize, String)>,
}

impl OpenSection {
    fn title_or_start(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| format!("Section starting at page {}", self.start_page + 1))
    }
}

/// Turns classified lines into raw (not yet post-processed) chunks
#[derive(Debug, Clone, Default)]
pub struct ChunkBuilder {
    settings: ChunkSettings,
}

impl ChunkBuilder {
    pub fn new(settings: ChunkSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ChunkSettings {
        &self.settings
    }

    /// Section walk over classified lines; falls back to page chunks when it yields nothing
    pub fn build(&self, classification: &Classification, pages: &[PageLayout]) -> Vec<SemanticChunk> {
        let chunks = self.build_sections(classification);
        if chunks.is_empty() {
            debug!("Section walk produced no chunks, chunking by page");
            return self.page_chunks(pages);
        }
        chunks
    }

    pub fn build_sections(&self, classification: &Classification) -> Vec<SemanticChunk> {
        let mut chunks = Vec::new();
        let mut section = OpenSection::default();

        for (page_idx, lines) in classification.pages.iter().enumerate() {
            for line in lines {
                let text = line.features.text.trim();
                if text.chars().count() < self.settings.min_line_chars {
                    continue;
                }
                if line.label.is_heading() {
                    if !section.body.is_empty() {
                        chunks.extend(self.finalize(&section));
                    }
                    section = OpenSection {
                        title: Some(text.to_string()),
                        label: Some(line.label),
                        start_page: page_idx,
                        body: Vec::new(),
                    };
                } else {
                    section.body.push((page_idx, text.to_string()));
                }
            }

            if section.body.len() > self.settings.page_section_lines {
                chunks.extend(self.page_sections(&section));
                section.body.clear();
            }
        }

        if !section.body.is_empty() {
            chunks.extend(self.finalize(&section));
        }
        chunks
    }

    fn finalize(&self, section: &OpenSection) -> Vec<SemanticChunk> {
        let text = section
            .body
            .iter()
            .map(|(_, t)| t.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        if text.trim().chars().count() < self.settings.min_section_chars {
            return Vec::new();
        }

        // Page holding most of the body text; earliest wins ties
        let mut per_page: BTreeMap<usize, usize> = BTreeMap::new();
        for (page, line) in &section.body {
            *per_page.entry(*page).or_default() += line.chars().count();
        }
        let primary_page = per_page
            .iter()
            .fold(None::<(usize, usize)>, |best, (&page, &chars)| match best {
                Some((_, best_chars)) if best_chars >= chars => best,
                _ => Some((page, chars)),
            })
            .map_or(section.start_page, |(page, _)| page);

        let title = section.title_or_start();
        let chunk_type = section.label.map_or(ChunkType::Content, ChunkType::from_label);
        split::split_long_text(&text, self.settings.max_chunk_chars, self.settings.hard_cut_chars)
            .into_iter()
            .map(|piece| {
                SemanticChunk::new(
                    primary_page,
                    piece,
                    Some(title.clone()),
                    chunk_type,
                    ExtractionMethod::EnhancedPipeline,
                )
            })
            .collect()
    }

    /// One `page_section` chunk per page of an overlong section body
    fn page_sections(&self, section: &OpenSection) -> Vec<SemanticChunk> {
        let title = section.title_or_start();
        let mut per_page: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for (page, line) in &section.body {
            per_page.entry(*page).or_default().push(line);
        }

        let mut chunks = Vec::new();
        for (page, lines) in per_page {
            let text = lines.join(" ");
            if text.trim().chars().count() < self.settings.min_section_chars {
                continue;
            }
            for piece in split::split_long_text(&text, self.settings.max_chunk_chars, self.settings.hard_cut_chars) {
                chunks.push(SemanticChunk::new(
                    page,
                    piece,
                    Some(format!("{title} (Page {})", page + 1)),
                    ChunkType::PageSection,
                    ExtractionMethod::EnhancedPipeline,
                ));
            }
        }
        chunks
    }

    /// One chunk per page with text; long pages packed into sentence groups
    pub fn page_chunks(&self, pages: &[PageLayout]) -> Vec<SemanticChunk> {
        let mut chunks = Vec::new();
        for page in pages {
            let text = page_text(page);
            if text.is_empty() {
                continue;
            }
            let pieces = if text.chars().count() > self.settings.max_chunk_chars {
                split::pack_sentences(&text, self.settings.page_piece_chars)
                    .into_iter()
                    .flat_map(|p| {
                        split::split_long_text(&p, self.settings.max_chunk_chars, self.settings.hard_cut_chars)
                    })
                    .collect()
            } else {
                vec![text]
            };
            chunks.extend(pieces.into_iter().map(|piece| {
                SemanticChunk::new(
                    page.index,
                    piece,
                    None,
                    ChunkType::Content,
                    ExtractionMethod::PageFallback,
                )
            }));
        }
        chunks
    }

    /// Last-resort chunks from text-stream pseudo-pages
    pub fn simple_fallback(&self, pages: &[PageLayout]) -> Vec<SemanticChunk> {
        pages
            .iter()
            .filter_map(|page| {
                let text = page_text(page);
                (!text.is_empty()).then(|| {
                    SemanticChunk::new(
                        page.index,
                        text,
                        Some(format!("Page {} Content", page.index + 1)),
                        ChunkType::Fallback,
                        ExtractionMethod::SimpleFallback,
                    )
                })
            })
            .collect()
    }
}

fn page_text(page: &PageLayout) -> String {
    page.runs
        .iter()
        .map(|r| r.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
