//! Text preparation for reading aloud.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_SPACE_BEFORE_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r" ([,.;:!?])").unwrap());

/// Share of the character cap a sentence break must reach before the
/// truncated text is cut back to it.
const SENTENCE_CUT_RATIO: f64 = 0.8;

/// NFKC-normalize, collapse every whitespace run to one space, and trim.
pub fn clean_text(raw: &str) -> String {
    let normalized: String = raw.nfkc().collect();
    let collapsed = RE_WHITESPACE.replace_all(&normalized, " ");
    let tightened = RE_SPACE_BEFORE_PUNCT.replace_all(&collapsed, "$1");
    tightened.trim().to_string()
}

/// Cap `text` at `max_chars` characters, preferring to end on a sentence
/// when the last period falls in the final fifth of the cap.
pub fn truncate_at_sentence(text: &str, max_chars: usize) -> &str {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return text;
    };
    let capped = &text[..cut];
    if let Some(period) = capped.rfind('.') {
        let period_chars = capped[..period].chars().count();
        if period_chars as f64 > max_chars as f64 * SENTENCE_CUT_RATIO {
            return &capped[..=period];
        }
    }
    capped
}

/// Readable text for a whole page, or `None` when nothing is left.
pub fn page_text(raw: &str, max_chars: usize) -> Option<String> {
    let cleaned = clean_text(raw);
    let text = truncate_at_sentence(&cleaned, max_chars).trim_end();
    (!text.is_empty()).then(|| text.to_string())
}

/// The user's selection, trimmed; `None` when it is blank.
pub fn selection_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Lightweight sentence splitter based on terminal punctuation.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_collapsed_and_normalized() {
        let raw = "  Hello\u{00A0}\u{00A0}world \n\n\t and ﬁne  print .  ";
        assert_eq!(clean_text(raw), "Hello world and fine print.");
    }

    #[test]
    fn truncation_prefers_a_late_sentence_break() {
        let text = format!("{}. {}", "a".repeat(90), "b".repeat(50));
        assert_eq!(truncate_at_sentence(&text, 100), format!("{}.", "a".repeat(90)));
    }

    #[test]
    fn truncation_ignores_an_early_sentence_break() {
        let text = format!("{}. {}", "a".repeat(10), "b".repeat(200));
        let capped = truncate_at_sentence(&text, 100);
        assert_eq!(capped.chars().count(), 100);
        assert!(capped.ends_with('b'));
    }

    #[test]
    fn short_text_is_untouched_and_multibyte_is_safe() {
        assert_eq!(truncate_at_sentence("Hi.", 100), "Hi.");
        let text = "é".repeat(120);
        assert_eq!(truncate_at_sentence(&text, 100).chars().count(), 100);
    }

    #[test]
    fn blank_input_yields_nothing() {
        assert_eq!(page_text(" \n\t ", 5000), None);
        assert_eq!(selection_text("   "), None);
        assert_eq!(selection_text("  pick me "), Some("pick me".to_string()));
    }

    #[test]
    fn sentences_split_on_terminal_punctuation() {
        assert_eq!(
            split_sentences("One. Two? Three! tail"),
            vec!["One.", "Two?", "Three!", "tail"]
        );
    }
}
