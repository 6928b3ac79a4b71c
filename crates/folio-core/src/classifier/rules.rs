//! Weighted-signal heading rules
//!
//! Each line accumulates a heading score from typography, layout and content
//! signals. The score decides heading vs paragraph; the level comes from a
//! numeric prefix when there is one, otherwise from font tiers.

use crate::features::{patterns, LineFeatures};

use super::{HeadingLabel, LineLabeler};
use crate::error::Result;

/// Lines longer than this are never headings
pub const MAX_TITLE_LENGTH: usize = 200;

/// Score at or above which a line is a heading
pub const HEADING_SCORE: i32 = 8;

/// Score at or above which a line is a low-confidence third-level heading
pub const LOW_CONFIDENCE_SCORE: i32 = 6;

/// Lines this short are always paragraphs
const MIN_HEADING_CHARS: usize = 3;

/// Heading score of a line before the hard paragraph overrides
pub fn heading_score(f: &LineFeatures) -> i32 {
    let mut score = 0;

    if f.relative_font_size >= 1.5 {
        score += 4;
    } else if f.relative_font_size >= 1.3 {
        score += 3;
    } else if f.relative_font_size >= 1.1 {
        score += 1;
    }

    if f.font_size_rank <= 2 {
        score += 3;
    } else if f.font_size_rank <= 3 {
        score += 2;
    }

    if f.is_bold {
        score += 3;
    }
    if f.is_centered {
        score += 2;
    }

    if f.space_before_ratio >= 2.0 {
        score += 3;
    } else if f.space_before_ratio >= 1.5 {
        score += 2;
    }

    if f.has_numeric_prefix {
        if patterns::is_likely_form_field(&f.text) {
            score -= 2;
        } else {
            score += 4;
        }
    }
    if f.is_chapter_heading {
        score += 4;
    }
    if f.is_appendix {
        score += 3;
    }
    if !f.ends_with_punct {
        score += 1;
    }

    if (5..=80).contains(&f.char_count) {
        score += 1;
    } else if f.char_count > 150 {
        score -= 2;
    }

    score
}

/// Level of a line already judged to be a heading
pub fn heading_level(f: &LineFeatures) -> HeadingLabel {
    match patterns::numeric_depth(&f.text) {
        Some(1) => return HeadingLabel::H1,
        Some(2) => return HeadingLabel::H2,
        Some(_) => return HeadingLabel::H3,
        None => {}
    }

    if f.relative_font_size >= 1.8 || f.font_size_rank == 1 || f.is_centered {
        HeadingLabel::H1
    } else if f.relative_font_size >= 1.4 || f.font_size_rank <= 2 {
        HeadingLabel::H2
    } else {
        HeadingLabel::H3
    }
}

/// Label one line
pub fn rule_label(f: &LineFeatures) -> HeadingLabel {
    let text = f.text.trim();
    let len = text.chars().count();
    if text.is_empty()
        || len > MAX_TITLE_LENGTH
        || len <= MIN_HEADING_CHARS
        || patterns::is_bare_page_number(text)
    {
        return HeadingLabel::Paragraph;
    }

    let score = heading_score(f);
    if score >= HEADING_SCORE {
        heading_level(f)
    } else if score >= LOW_CONFIDENCE_SCORE {
        HeadingLabel::H3
    } else {
        HeadingLabel::Paragraph
    }
}

/// Pure rule-based labeler; also labels the perceptron's bootstrap set
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleLabeler;

impl RuleLabeler {
    pub fn label_pages(pages: &[Vec<LineFeatures>]) -> Vec<Vec<HeadingLabel>> {
        pages
            .iter()
            .map(|page| page.iter().map(rule_label).collect())
            .collect()
    }
}

impl LineLabeler for RuleLabeler {
    fn label(&self, pages: &[Vec<LineFeatures>]) -> Result<Vec<Vec<HeadingLabel>>> {
        Ok(Self::label_pages(pages))
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}
