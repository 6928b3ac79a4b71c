//! Content-signal patterns shared by feature extraction and classification
//!
//! Patterns accept CJK forms alongside Latin ones so that numbered and
//! chapter headings are recognised regardless of script.

use once_cell::sync::Lazy;
use regex::Regex;

static NUMERIC_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+(\.\d+)*[.)\s]").unwrap());
static NUMERIC_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\d+(?:\.\d+)*)").unwrap());
static CHAPTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(chapter|section|part|章|節|部)\s+\d+").unwrap());
static APPENDIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(appendix|附錄|附录)").unwrap());
static BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[•\-*・]").unwrap());
static BARE_PAGE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d+[.)\s]*$").unwrap());
static FORM_FIELD_PATTERNS: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r"^\d+\.\s+[A-Z][^.]*:?\s*$").unwrap(),
        Regex::new(r"^\d+\.\s+[A-Z][a-z\s]{2,15}:?\s*$").unwrap(),
    ]
});

const SENTENCE_FINAL: [char; 6] = ['.', '?', '!', '。', '？', '！'];
const COLON_SUFFIX: [char; 2] = [':', '：'];
const FORM_KEYWORDS: [&str; 6] = ["name", "address", "phone", "email", "date", "signature"];

/// Texts shorter than this containing a form keyword look like form fields
const FORM_KEYWORD_MAX_LEN: usize = 50;

/// "1.", "2.3 ", "4)" at the start of the line
pub fn has_numeric_prefix(text: &str) -> bool {
    NUMERIC_PREFIX.is_match(text)
}

/// Depth of a leading section number: "2" is 1, "2.3.1" is 3
pub fn numeric_depth(text: &str) -> Option<usize> {
    NUMERIC_LABEL
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split('.').count())
}

pub fn is_chapter_heading(text: &str) -> bool {
    CHAPTER.is_match(text)
}

pub fn is_appendix(text: &str) -> bool {
    APPENDIX.is_match(text)
}

pub fn starts_with_bullet(text: &str) -> bool {
    BULLET.is_match(text)
}

/// A line holding nothing but a page number like "12" or "3."
pub fn is_bare_page_number(text: &str) -> bool {
    BARE_PAGE_NUMBER.is_match(text)
}

pub fn ends_with_sentence_punct(text: &str) -> bool {
    text.trim_end().ends_with(SENTENCE_FINAL)
}

pub fn has_colon_suffix(text: &str) -> bool {
    text.trim_end().ends_with(COLON_SUFFIX)
}

/// Numbered lines such as "3. Name:" are form fields, not headings
pub fn is_likely_form_field(text: &str) -> bool {
    if FORM_FIELD_PATTERNS.iter().any(|re| re.is_match(text)) {
        return true;
    }
    let lower = text.to_lowercase();
    text.chars().count() < FORM_KEYWORD_MAX_LEN && FORM_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// At least one cased letter and no lowercase letters
pub fn is_uppercase(text: &str) -> bool {
    let mut cased = false;
    for ch in text.chars() {
        if ch.is_lowercase() {
            return false;
        }
        if ch.is_uppercase() {
            cased = true;
        }
    }
    cased
}

/// Every word starts with an uppercase letter followed only by lowercase ones
pub fn is_titlecase(text: &str) -> bool {
    let mut cased = false;
    let mut prev_cased = false;
    for ch in text.chars() {
        if ch.is_uppercase() {
            if prev_cased {
                return false;
            }
            prev_cased = true;
            cased = true;
        } else if ch.is_lowercase() {
            if !prev_cased {
                return false;
            }
            prev_cased = true;
            cased = true;
        } else {
            prev_cased = false;
        }
    }
    cased
}
