//! Length-bounded splitting at sentence boundaries

/// Sentence separator used for splitting
const SENTENCE_BREAK: &str = ". ";

/// Marker appended to a hard-cut piece
const ELLIPSIS: &str = "...";

/// Split `text` until every piece is at most `max_chars` characters.
///
/// A long piece is divided at the sentence boundary nearest its middle
/// sentence; without any boundary it is cut after `hard_cut_chars` characters
/// and the first part gets an ellipsis.
pub fn split_long_text(text: &str, max_chars: usize, hard_cut_chars: usize) -> Vec<String> {
    let text = text.trim();
    if text.chars().count() <= max_chars || max_chars == 0 {
        return if text.is_empty() {
            Vec::new()
        } else {
            vec![text.to_string()]
        };
    }

    let sentences: Vec<&str> = text.split(SENTENCE_BREAK).collect();
    let (first, rest) = if sentences.len() > 1 {
        let mid = sentences.len() / 2;
        (
            format!("{}.", sentences[..mid].join(SENTENCE_BREAK)),
            sentences[mid..].join(SENTENCE_BREAK),
        )
    } else {
        let cut = hard_cut_chars.clamp(1, max_chars.saturating_sub(ELLIPSIS.len()).max(1));
        let byte = text
            .char_indices()
            .nth(cut)
            .map_or(text.len(), |(i, _)| i);
        (format!("{}{ELLIPSIS}", &text[..byte]), text[byte..].to_string())
    };

    let mut pieces = split_long_text(&first, max_chars, hard_cut_chars);
    pieces.extend(split_long_text(&rest, max_chars, hard_cut_chars));
    pieces
}

/// Group sentences into pieces of roughly `target_chars`, for page-level chunks
pub fn pack_sentences(text: &str, target_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for sentence in text.split(SENTENCE_BREAK) {
        if current.chars().count() + sentence.chars().count() > target_chars {
            if !current.trim().is_empty() {
                pieces.push(format!("{}.", current.trim()));
            }
            current = sentence.to_string();
        } else if current.is_empty() {
            current = sentence.to_string();
        } else {
            current.push_str(SENTENCE_BREAK);
            current.push_str(sentence);
        }
    }
    if !current.trim().is_empty() {
        pieces.push(current.trim().to_string());
    }
    pieces
}
