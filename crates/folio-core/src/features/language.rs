//! Document language detection
//!
//! Language is detected once per document from a sample of early-page text
//! and applied to every line. Detection sits behind [`LanguageDetector`];
//! the built-in [`ScriptDetector`] decides by Unicode script and, for Latin
//! text, by stopword frequency.

use crate::layout::PageLayout;

/// Language tag used when detection is unavailable or inconclusive
pub const DEFAULT_LANGUAGE: &str = "unknown";

/// Languages whose scripts have no letter case
pub const CASELESS_LANGUAGES: [&str; 6] = ["japanese", "chinese", "korean", "thai", "arabic", "hebrew"];

const SAMPLE_PAGES: usize = 3;
const SAMPLE_RUNS_PER_PAGE: usize = 10;
const SAMPLE_MIN_CHARS: usize = 20;
const SAMPLE_MAX_TEXTS: usize = 5;

/// Pluggable language detection
pub trait LanguageDetector: Send + Sync {
    /// Lowercase English language name, or `None` if undecided
    fn detect(&self, text: &str) -> Option<String>;
}

/// True for languages where upper/title case must not be inferred
pub fn is_caseless(language: &str) -> bool {
    let lower = language.to_lowercase();
    CASELESS_LANGUAGES.contains(&lower.as_str())
}

/// Text sample from the first pages: long runs only, a handful joined together
pub fn language_sample(pages: &[PageLayout]) -> Option<String> {
    let samples: Vec<&str> = pages
        .iter()
        .take(SAMPLE_PAGES)
        .flat_map(|p| p.runs.iter().take(SAMPLE_RUNS_PER_PAGE))
        .map(|r| r.text.trim())
        .filter(|t| t.chars().count() > SAMPLE_MIN_CHARS)
        .take(SAMPLE_MAX_TEXTS)
        .collect();
    if samples.is_empty() {
        None
    } else {
        Some(samples.join(" "))
    }
}

/// Detect the document language, falling back to `default_language`
pub fn detect_document_language(
    pages: &[PageLayout],
    detector: Option<&dyn LanguageDetector>,
    default_language: &str,
) -> String {
    let detected = detector.zip(language_sample(pages)).and_then(|(d, text)| d.detect(&text));
    detected.unwrap_or_else(|| default_language.to_string())
}

#[derive(Debug, Default, Clone, Copy)]
struct ScriptCounts {
    latin: usize,
    han: usize,
    kana: usize,
    hangul: usize,
    thai: usize,
    arabic: usize,
    hebrew: usize,
    cyrillic: usize,
    greek: usize,
}

impl ScriptCounts {
    fn tally(text: &str) -> Self {
        let mut c = Self::default();
        for ch in text.chars() {
            match ch as u32 {
                0x0041..=0x005A | 0x0061..=0x007A | 0x00C0..=0x024F => c.latin += 1,
                0x0370..=0x03FF => c.greek += 1,
                0x0400..=0x04FF => c.cyrillic += 1,
                0x0590..=0x05FF => c.hebrew += 1,
                0x0600..=0x06FF | 0x0750..=0x077F => c.arabic += 1,
                0x0E00..=0x0E7F => c.thai += 1,
                0x3040..=0x30FF => c.kana += 1,
                0x1100..=0x11FF | 0xAC00..=0xD7AF => c.hangul += 1,
                0x4E00..=0x9FFF | 0x3400..=0x4DBF => c.han += 1,
                _ => {}
            }
        }
        c
    }
}

/// Script-based detector with a stopword vote among common Latin-script languages
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptDetector;

const LATIN_STOPWORDS: [(&str, &[&str]); 5] = [
    ("english", &["the", "and", "of", "to", "is", "in", "that", "with", "for"]),
    ("french", &["le", "la", "les", "et", "des", "est", "une", "dans", "pour"]),
    ("german", &["der", "die", "das", "und", "ist", "nicht", "mit", "ein", "zu"]),
    ("spanish", &["el", "los", "las", "y", "es", "una", "del", "para", "con"]),
    ("italian", &["il", "della", "che", "è", "per", "una", "non", "con", "gli"]),
];

impl ScriptDetector {
    fn latin_language(text: &str) -> Option<String> {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphabetic())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        let (name, hits) = LATIN_STOPWORDS
            .iter()
            .map(|(name, stops)| {
                (
                    *name,
                    words.iter().filter(|w| stops.contains(&w.as_str())).count(),
                )
            })
            .max_by_key(|(_, hits)| *hits)?;
        (hits > 0).then(|| name.to_string())
    }
}

impl LanguageDetector for ScriptDetector {
    fn detect(&self, text: &str) -> Option<String> {
        let c = ScriptCounts::tally(text);
        let scripts = [
            (c.han + c.kana, "cjk"),
            (c.hangul, "korean"),
            (c.thai, "thai"),
            (c.arabic, "arabic"),
            (c.hebrew, "hebrew"),
            (c.cyrillic, "russian"),
            (c.greek, "greek"),
            (c.latin, "latin"),
        ];
        let (count, script) = scripts.iter().copied().max_by_key(|(n, _)| *n)?;
        if count == 0 {
            return None;
        }
        match script {
            "cjk" if c.kana > 0 => Some("japanese".to_string()),
            "cjk" => Some("chinese".to_string()),
            "latin" => Self::latin_language(text),
            other => Some(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::test_support::{page, run};

    #[test]
    fn test_script_detection() {
        let d = ScriptDetector;
        assert_eq!(d.detect("これは日本語の文章です").as_deref(), Some("japanese"));
        assert_eq!(d.detect("这是一个中文句子").as_deref(), Some("chinese"));
        assert_eq!(d.detect("이것은 한국어 문장입니다").as_deref(), Some("korean"));
        assert_eq!(d.detect("Это русский текст").as_deref(), Some("russian"));
        assert_eq!(
            d.detect("The results of the study show that the method is robust").as_deref(),
            Some("english")
        );
        assert_eq!(
            d.detect("Le rapport est dans la boîte pour les enfants").as_deref(),
            Some("french")
        );
        assert_eq!(d.detect("12345 !!"), None);
    }

    #[test]
    fn test_caseless_languages() {
        assert!(is_caseless("Japanese"));
        assert!(is_caseless("hebrew"));
        assert!(!is_caseless("english"));
    }

    #[test]
    fn test_sample_skips_short_runs() {
        let pages = vec![page(
            0,
            vec![
                run("Short", 50.0, 50.0, 40.0, 12.0, 0),
                run("This line is comfortably longer than twenty characters", 50.0, 70.0, 300.0, 12.0, 0),
            ],
        )];
        let sample = language_sample(&pages).unwrap();
        assert!(!sample.contains("Short"));
    }

    #[test]
    fn test_default_language_when_no_sample() {
        let pages = vec![page(0, vec![run("tiny", 50.0, 50.0, 40.0, 12.0, 0)])];
        let lang = detect_document_language(&pages, Some(&ScriptDetector), "unknown");
        assert_eq!(lang, "unknown");
        let lang = detect_document_language(&pages, None, "english");
        assert_eq!(lang, "english");
    }
}
