//! Line merging, page statistics and per-line feature vectors
//!
//! Runs arrive in reading order. Consecutive runs on the same baseline are
//! merged into [`TextLine`]s; each page then gets a [`PageStatistics`]
//! baseline (modal font size, dominant margin, average line metrics) that
//! normalises the [`LineFeatures`] of its lines.

pub mod language;
pub mod patterns;

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::layout::{BBox, PageLayout, TextRun};

pub use language::{detect_document_language, is_caseless, LanguageDetector, ScriptDetector};

/// Runs whose bottoms differ by at most this much are on the same line
pub const LINE_BASELINE_TOLERANCE: f32 = 2.0;

/// Modal font size assumed for a page without lines
pub const DEFAULT_FONT_SIZE: f32 = 12.0;

/// Average line height assumed when no line has a positive height
pub const DEFAULT_LINE_HEIGHT: f32 = 12.0;

/// Average line width assumed when no line has a positive width
pub const DEFAULT_LINE_WIDTH: f32 = 400.0;

/// Rank reported for a font size missing from the page's rank table
pub const UNKNOWN_FONT_RANK: usize = 10;

/// Lines must be within this fraction of the page width from center to count as centered
pub const CENTER_TOLERANCE_RATIO: f32 = 0.02;

/// Centered lines must be narrower than this fraction of the average line width
pub const CENTERED_MAX_WIDTH_RATIO: f32 = 0.8;

/// A group of runs sharing a baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub text: String,
    pub bbox: BBox,
    /// Typography of the largest run on the line
    pub font_name: String,
    pub font_size: f32,
    pub font_flags: u32,
    pub is_bold: bool,
    pub is_italic: bool,
    pub page_index: usize,
    pub page_width: f32,
    pub page_height: f32,
}

impl TextLine {
    fn from_runs(runs: &mut [&TextRun]) -> Option<TextLine> {
        runs.sort_by(|a, b| a.bbox.x0.partial_cmp(&b.bbox.x0).unwrap_or(Ordering::Equal));
        let text = runs
            .iter()
            .map(|r| r.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if text.is_empty() {
            return None;
        }

        let bbox = runs
            .iter()
            .skip(1)
            .fold(runs[0].bbox, |acc, r| acc.union(&r.bbox));
        let largest = runs.iter().copied().fold(runs[0], |best, r| {
            if r.font_size > best.font_size {
                r
            } else {
                best
            }
        });

        Some(TextLine {
            text,
            bbox,
            font_name: largest.font_name.clone(),
            font_size: largest.font_size,
            font_flags: largest.font_flags,
            is_bold: largest.is_bold,
            is_italic: largest.is_italic,
            page_index: largest.page_index,
            page_width: largest.page_width,
            page_height: largest.page_height,
        })
    }
}

/// Merge consecutive runs on the same baseline into lines, keeping reading order
pub fn merge_lines(runs: &[TextRun]) -> Vec<TextLine> {
    let mut lines = Vec::new();
    let mut group: Vec<&TextRun> = Vec::new();

    for run in runs.iter().filter(|r| !r.text.trim().is_empty()) {
        let same_line = group.last().is_some_and(|prev| {
            (run.bbox.y1 - prev.bbox.y1).abs() <= LINE_BASELINE_TOLERANCE
                || (run.bbox.y0 * 10.0).round() == (prev.bbox.y0 * 10.0).round()
        });
        if !same_line && !group.is_empty() {
            lines.extend(TextLine::from_runs(&mut group));
            group.clear();
        }
        group.push(run);
    }
    if !group.is_empty() {
        lines.extend(TextLine::from_runs(&mut group));
    }
    lines
}

/// Font sizes are compared at 0.1pt resolution
fn size_key(size: f32) -> i32 {
    (size * 10.0).round() as i32
}

/// Per-page normalization baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageStatistics {
    /// Most frequent line font size (a mode, never a mean)
    pub modal_font_size: f32,
    pub dominant_left_margin: f32,
    pub avg_line_height: f32,
    pub avg_line_width: f32,
    pub page_width: f32,
    pub page_height: f32,
    /// Distinct font sizes, largest first; rank is position + 1
    pub font_sizes_desc: Vec<f32>,
}

impl PageStatistics {
    pub fn compute(lines: &[TextLine], page_width: f32, page_height: f32) -> Self {
        if lines.is_empty() {
            return Self {
                modal_font_size: DEFAULT_FONT_SIZE,
                dominant_left_margin: 0.0,
                avg_line_height: DEFAULT_LINE_HEIGHT,
                avg_line_width: DEFAULT_LINE_WIDTH,
                page_width,
                page_height,
                font_sizes_desc: vec![DEFAULT_FONT_SIZE],
            };
        }

        let modal_font_size = mode(lines.iter().map(|l| l.font_size)).unwrap_or(DEFAULT_FONT_SIZE);
        let dominant_left_margin = mode(lines.iter().map(|l| l.bbox.x0)).unwrap_or(0.0);

        let mut font_sizes_desc: Vec<f32> = Vec::new();
        for line in lines {
            if !font_sizes_desc.iter().any(|s| size_key(*s) == size_key(line.font_size)) {
                font_sizes_desc.push(line.font_size);
            }
        }
        font_sizes_desc.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));

        Self {
            modal_font_size,
            dominant_left_margin,
            avg_line_height: positive_mean(lines.iter().map(|l| l.bbox.height()))
                .unwrap_or(DEFAULT_LINE_HEIGHT),
            avg_line_width: positive_mean(lines.iter().map(|l| l.bbox.width()))
                .unwrap_or(DEFAULT_LINE_WIDTH),
            page_width,
            page_height,
            font_sizes_desc,
        }
    }

    /// One-based rank of a font size, largest first
    pub fn font_rank(&self, size: f32) -> usize {
        self.font_sizes_desc
            .iter()
            .position(|s| size_key(*s) == size_key(size))
            .map_or(UNKNOWN_FONT_RANK, |i| i + 1)
    }
}

/// Most frequent value at 0.1 resolution; ties go to the first seen
fn mode(values: impl Iterator<Item = f32>) -> Option<f32> {
    let mut counts: HashMap<i32, (usize, usize, f32)> = HashMap::new();
    for (order, v) in values.enumerate() {
        let entry = counts.entry(size_key(v)).or_insert((0, order, v));
        entry.0 += 1;
    }
    counts
        .into_values()
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|(_, _, v)| v)
}

fn positive_mean(values: impl Iterator<Item = f32>) -> Option<f32> {
    let (sum, n) = values
        .filter(|v| *v > 0.0)
        .fold((0.0f32, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f32)
}

/// Feature vector of one line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineFeatures {
    pub text: String,
    pub bbox: BBox,
    pub page_index: usize,
    pub line_index: usize,

    pub font_size: f32,
    pub relative_font_size: f32,
    pub font_size_rank: usize,
    pub is_bold: bool,
    pub is_italic: bool,
    pub font_name_has_bold: bool,

    pub indentation: f32,
    pub is_centered: bool,
    pub line_width_ratio: f32,
    pub space_before_ratio: f32,
    pub vertical_position_ratio: f32,

    pub char_count: usize,
    pub word_count: usize,
    pub ends_with_punct: bool,
    pub has_colon_suffix: bool,
    pub has_numeric_prefix: bool,
    pub is_chapter_heading: bool,
    pub is_appendix: bool,
    pub starts_with_bullet: bool,
    pub is_uppercase: bool,
    pub is_titlecase: bool,
    pub language: String,
}

impl LineFeatures {
    /// Features of `lines[index]` against its page baseline
    pub fn compute(lines: &[TextLine], index: usize, stats: &PageStatistics, language: &str) -> Self {
        let line = &lines[index];
        let text = line.text.trim().to_string();
        let bbox = line.bbox;
        let width = bbox.width();

        let modal = if stats.modal_font_size > 0.0 {
            stats.modal_font_size
        } else {
            DEFAULT_FONT_SIZE
        };
        let avg_width = if stats.avg_line_width > 0.0 {
            stats.avg_line_width
        } else {
            DEFAULT_LINE_WIDTH
        };

        let page_center = stats.page_width / 2.0;
        let is_centered = (bbox.center_x() - page_center).abs()
            < stats.page_width * CENTER_TOLERANCE_RATIO
            && width < avg_width * CENTERED_MAX_WIDTH_RATIO;

        let space_before_ratio = match index.checked_sub(1).map(|i| &lines[i]) {
            Some(prev) => (bbox.y0 - prev.bbox.y1) / prev.bbox.height().max(1.0),
            None => 0.0,
        };

        let caseless = is_caseless(language);
        let font_lower = line.font_name.to_lowercase();

        Self {
            page_index: line.page_index,
            line_index: index,
            font_size: line.font_size,
            relative_font_size: line.font_size / modal,
            font_size_rank: stats.font_rank(line.font_size),
            is_bold: line.is_bold,
            is_italic: line.is_italic,
            font_name_has_bold: ["bold", "black", "heavy", "semibold"]
                .iter()
                .any(|m| font_lower.contains(m)),
            indentation: bbox.x0 - stats.dominant_left_margin,
            is_centered,
            line_width_ratio: width / avg_width,
            space_before_ratio,
            vertical_position_ratio: bbox.y0 / stats.page_height.max(1.0),
            char_count: text.chars().count(),
            word_count: text.split_whitespace().count(),
            ends_with_punct: patterns::ends_with_sentence_punct(&text),
            has_colon_suffix: patterns::has_colon_suffix(&text),
            has_numeric_prefix: patterns::has_numeric_prefix(&text),
            is_chapter_heading: patterns::is_chapter_heading(&text),
            is_appendix: patterns::is_appendix(&text),
            starts_with_bullet: patterns::starts_with_bullet(&text),
            is_uppercase: !caseless && patterns::is_uppercase(&text),
            is_titlecase: !caseless && patterns::is_titlecase(&text),
            language: language.to_string(),
            text,
            bbox,
        }
    }
}

/// Features of every page, plus the language applied to all of them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFeatures {
    pub language: String,
    /// One entry per page, in page order; empty for pages without text
    pub pages: Vec<Vec<LineFeatures>>,
}

impl DocumentFeatures {
    pub fn line_count(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.line_count() == 0
    }
}

/// Computes line features for arranged pages
pub struct FeatureExtractor {
    detector: Option<Box<dyn LanguageDetector>>,
    default_language: String,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(Some(Box::new(ScriptDetector)), language::DEFAULT_LANGUAGE)
    }
}

impl FeatureExtractor {
    pub fn new(detector: Option<Box<dyn LanguageDetector>>, default_language: impl Into<String>) -> Self {
        Self {
            detector,
            default_language: default_language.into(),
        }
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    pub fn detect_language(&self, pages: &[PageLayout]) -> String {
        detect_document_language(pages, self.detector.as_deref(), &self.default_language)
    }

    /// Lines of a single page with their features
    pub fn page_features(&self, page: &PageLayout, language: &str) -> Vec<LineFeatures> {
        let lines = merge_lines(&page.runs);
        if lines.is_empty() {
            return Vec::new();
        }
        let stats = PageStatistics::compute(&lines, page.width, page.height);
        (0..lines.len())
            .map(|i| LineFeatures::compute(&lines, i, &stats, language))
            .collect()
    }

    pub fn extract(&self, pages: &[PageLayout]) -> DocumentFeatures {
        let language = self.detect_language(pages);
        let pages: Vec<Vec<LineFeatures>> = pages
            .iter()
            .map(|p| self.page_features(p, &language))
            .collect();
        let features = DocumentFeatures { language, pages };
        debug!(
            "Extracted features for {} lines (language: {})",
            features.line_count(),
            features.language
        );
        features
    }
}
