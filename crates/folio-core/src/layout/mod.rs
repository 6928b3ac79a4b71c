//! Layout extraction: raw document bytes to ordered, positioned text runs
//!
//! Pipeline per document:
//!
//! ```text
//! bytes -> [structured extractor] -> pages of TextRun
//!              | (load failure / no usable text)
//!              v
//!          [text-stream fallback] -> synthetic pseudo-pages
//!
//! pages -> strip recurring headers/footers -> column reflow per page
//! ```
//!
//! Coordinates use a top-left origin with y growing downwards, so `y0` is
//! the top edge of a run and `y1` its bottom edge.

pub mod cmap;
pub mod columns;
pub mod fallback;
pub mod headers;
pub mod outline;
pub mod pdf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FolioError, Result};

/// Default page width when the document does not declare one (US Letter)
pub const DEFAULT_PAGE_WIDTH: f32 = 612.0;

/// Default page height when the document does not declare one (US Letter)
pub const DEFAULT_PAGE_HEIGHT: f32 = 792.0;

/// Horizontal distance from the page center that separates the columns
pub const COLUMN_MARGIN: f32 = 50.0;

/// Fraction of runs required on each side of the page for a multi-column layout
pub const COLUMN_MIN_RATIO: f32 = 0.2;

/// Pages with fewer runs than this are always treated as single-column
pub const COLUMN_MIN_RUNS: usize = 10;

/// Runs wider than this fraction of the page span both columns
pub const SPANNING_WIDTH_RATIO: f32 = 0.7;

/// Top band (fraction of page height) where running headers live
pub const HEADER_BAND_RATIO: f32 = 0.15;

/// Bottom band start (fraction of page height) where running footers live
pub const FOOTER_BAND_RATIO: f32 = 0.85;

/// Fraction of pages a band text must appear on to be stripped
pub const RECURRENCE_RATIO: f32 = 0.4;

/// Band texts of this many characters or fewer are never stripped
pub const MIN_RECURRING_TEXT_LEN: usize = 3;

/// Minimum share of printable characters for structured output to be trusted
const MIN_PRINTABLE_RATIO: f32 = 0.6;

/// Axis-aligned bounding box in page space (top-left origin)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn center_x(&self) -> f32 {
        (self.x0 + self.x1) / 2.0
    }

    /// Smallest box containing both boxes
    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }
}

/// A run of text drawn with a single font at a single position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    pub bbox: BBox,
    pub font_name: String,
    pub font_size: f32,
    /// Style flags: 2 = italic, 4 = serif, 8 = monospaced, 16 = bold
    pub font_flags: u32,
    pub is_bold: bool,
    pub is_italic: bool,
    pub page_index: usize,
    pub page_width: f32,
    pub page_height: f32,
}

/// Font flag bit for italic faces
pub const FLAG_ITALIC: u32 = 1 << 1;

/// Font flag bit for bold faces
pub const FLAG_BOLD: u32 = 1 << 4;

/// Bold if the face name says so or the bold flag is set
pub fn is_bold_font(font_name: &str, flags: u32) -> bool {
    let name = font_name.to_lowercase();
    ["bold", "black", "heavy", "semibold", "thick"]
        .iter()
        .any(|marker| name.contains(marker))
        || flags & FLAG_BOLD != 0
}

/// Italic if the face name says so or the italic flag is set
pub fn is_italic_font(font_name: &str, flags: u32) -> bool {
    let name = font_name.to_lowercase();
    ["italic", "oblique", "slanted"]
        .iter()
        .any(|marker| name.contains(marker))
        || flags & FLAG_ITALIC != 0
}

impl TextRun {
    /// Build a run, deriving bold/italic from the font name and flags
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        text: impl Into<String>,
        bbox: BBox,
        font_name: impl Into<String>,
        font_size: f32,
        font_flags: u32,
        page_index: usize,
        page_width: f32,
        page_height: f32,
    ) -> Self {
        let font_name = font_name.into();
        Self {
            text: text.into(),
            bbox,
            is_bold: is_bold_font(&font_name, font_flags),
            is_italic: is_italic_font(&font_name, font_flags),
            font_name,
            font_size,
            font_flags,
            page_index,
            page_width,
            page_height,
        }
    }
}

/// All runs of one page, in reading order once layout analysis has run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageLayout {
    /// Zero-based page index within the document
    pub index: usize,
    pub width: f32,
    pub height: f32,
    pub runs: Vec<TextRun>,
}

impl PageLayout {
    pub fn new(index: usize, width: f32, height: f32) -> Self {
        Self {
            index,
            width,
            height,
            runs: Vec::new(),
        }
    }

    /// Concatenated run text, one run per line
    pub fn plain_text(&self) -> String {
        self.runs
            .iter()
            .map(|r| r.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_text(&self) -> bool {
        self.runs.iter().any(|r| !r.text.trim().is_empty())
    }
}

/// One entry of a document-native table of contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineEntry {
    /// Nesting depth, 1 for top-level entries
    pub level: usize,
    pub title: String,
    /// One-based page the entry points at
    pub page: usize,
}

/// Descriptive metadata from the document information dictionary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
}

/// Which extractor produced the pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionSource {
    /// Positioned runs from the page content streams
    Structured,
    /// Plain text stream with reconstructed pseudo-pages
    TextFallback,
}

/// Output of layout extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub pages: Vec<PageLayout>,
    pub outline: Vec<OutlineEntry>,
    pub metadata: DocumentMetadata,
    pub source: ExtractionSource,
    /// Pages that failed to decode and were skipped
    pub skipped_pages: Vec<usize>,
}

impl ExtractedDocument {
    /// Wrap already-positioned pages (synthetic input, tests)
    pub fn from_pages(pages: Vec<PageLayout>) -> Self {
        Self {
            pages,
            outline: Vec::new(),
            metadata: DocumentMetadata::default(),
            source: ExtractionSource::Structured,
            skipped_pages: Vec::new(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn has_text(&self) -> bool {
        self.pages.iter().any(PageLayout::has_text)
    }
}

/// Tunables for column detection and header/footer suppression
#[derive(Debug, Clone)]
pub struct LayoutSettings {
    pub column_margin: f32,
    pub column_min_ratio: f32,
    pub column_min_runs: usize,
    pub spanning_width_ratio: f32,
    pub header_band_ratio: f32,
    pub footer_band_ratio: f32,
    pub recurrence_ratio: f32,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            column_margin: COLUMN_MARGIN,
            column_min_ratio: COLUMN_MIN_RATIO,
            column_min_runs: COLUMN_MIN_RUNS,
            spanning_width_ratio: SPANNING_WIDTH_RATIO,
            header_band_ratio: HEADER_BAND_RATIO,
            footer_band_ratio: FOOTER_BAND_RATIO,
            recurrence_ratio: RECURRENCE_RATIO,
        }
    }
}

/// Turns document bytes into reading-ordered pages
#[derive(Debug, Clone, Default)]
pub struct LayoutExtractor {
    settings: LayoutSettings,
}

impl LayoutExtractor {
    pub fn new(settings: LayoutSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LayoutSettings {
        &self.settings
    }

    /// Extract and arrange pages, trying the text-stream fallback when the
    /// structured extractor fails or yields no usable text
    pub fn extract(&self, bytes: &[u8]) -> Result<ExtractedDocument> {
        let structured = match pdf::extract_document(bytes) {
            Ok(doc) if doc.has_text() && printable_ratio(&doc) >= MIN_PRINTABLE_RATIO => {
                return Ok(self.arrange(doc));
            }
            Ok(doc) => {
                warn!(
                    "Structured extraction produced no usable text ({} pages), trying fallback",
                    doc.page_count()
                );
                Some(doc)
            }
            Err(e) => {
                warn!("Structured extraction failed: {e:#}, trying fallback");
                None
            }
        };

        match fallback::extract_document(bytes) {
            Ok(mut doc) if doc.has_text() => {
                info!("Text fallback produced {} pseudo-pages", doc.page_count());
                if let Some(structured) = &structured {
                    // The outline and metadata survive even when the runs are unusable
                    doc.outline = structured.outline.clone();
                    doc.metadata = structured.metadata.clone();
                }
                Ok(self.arrange(doc))
            }
            Ok(_) => match structured {
                Some(_) => Err(FolioError::EmptyContent),
                None => Err(FolioError::Extraction(
                    "fallback extractor recovered no text".to_string(),
                )),
            },
            Err(e) => match structured {
                Some(_) => {
                    debug!("Fallback extraction failed after empty structured output: {e:#}");
                    Err(FolioError::EmptyContent)
                }
                None => Err(FolioError::Extraction(format!("{e:#}"))),
            },
        }
    }

    /// Strip recurring headers/footers, then put each page in reading order
    pub fn arrange(&self, mut doc: ExtractedDocument) -> ExtractedDocument {
        let removed = headers::strip_recurring(&mut doc.pages, &self.settings);
        if removed > 0 {
            debug!("Removed {removed} recurring header/footer runs");
        }
        for page in &mut doc.pages {
            columns::reflow_page(page, &self.settings);
        }
        doc
    }
}

/// Share of non-whitespace characters that are printable
fn printable_ratio(doc: &ExtractedDocument) -> f32 {
    let mut total = 0usize;
    let mut printable = 0usize;
    for run in doc.pages.iter().flat_map(|p| p.runs.iter()) {
        for ch in run.text.chars().filter(|c| !c.is_whitespace()) {
            total += 1;
            if !ch.is_control() && ch != char::REPLACEMENT_CHARACTER && !is_private_use(ch) {
                printable += 1;
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        printable as f32 / total as f32
    }
}

fn is_private_use(ch: char) -> bool {
    ('\u{E000}'..='\u{F8FF}').contains(&ch)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bold_detection_by_name_and_flags() {
        assert!(is_bold_font("Arial-BoldMT", 0));
        assert!(is_bold_font("Montserrat-SemiBold", 0));
        assert!(is_bold_font("Helvetica", FLAG_BOLD));
        assert!(!is_bold_font("Helvetica", FLAG_ITALIC));
    }

    #[test]
    fn test_italic_detection_by_name_and_flags() {
        assert!(is_italic_font("Times-Italic", 0));
        assert!(is_italic_font("Helvetica-Oblique", 0));
        assert!(is_italic_font("Helvetica", FLAG_ITALIC));
        assert!(!is_italic_font("Helvetica-Bold", 0));
    }

    #[test]
    fn test_bbox_union_and_center() {
        let a = BBox::new(10.0, 10.0, 20.0, 20.0);
        let b = BBox::new(15.0, 5.0, 40.0, 18.0);
        let u = a.union(&b);
        assert_eq!(u, BBox::new(10.0, 5.0, 40.0, 20.0));
        assert_eq!(u.center_x(), 25.0);
        assert_eq!(u.width(), 30.0);
    }

    #[test]
    fn test_printable_ratio_flags_garbage() {
        let mut page = test_support::page(0, vec![]);
        page.runs
            .push(test_support::run("\u{0001}\u{0002}\u{E001}ab", 50.0, 50.0, 100.0, 12.0, 0));
        let doc = ExtractedDocument::from_pages(vec![page]);
        assert!(printable_ratio(&doc) < MIN_PRINTABLE_RATIO);
    }

    #[test]
    fn test_extract_rejects_non_pdf_bytes() {
        let extractor = LayoutExtractor::default();
        let result = extractor.extract(b"definitely not a document");
        assert!(result.is_err());
    }
}
