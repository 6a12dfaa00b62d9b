//! Word breaking and normalization for full-text indexes.

use std::collections::HashSet;

use deunicode::deunicode;
use serde_json::Value;

use crate::keypath::get_value_for_single_keypath;
use crate::schema::KeyPath;

/// How multiple search terms combine: `And` requires every term to match
/// (with prefix semantics), `Or` matches any term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullTextTermResolution {
    #[default]
    And,
    Or,
}

/// Breaks a phrase into its set of normalized word tokens: deburred,
/// lowercased, split on non-alphanumeric runs and camel-case boundaries,
/// deduplicated in first-seen order.
pub fn break_and_normalize_search_phrase(phrase: &str) -> Vec<String> {
    let folded = deunicode(phrase);
    let mut words = Vec::new();
    let mut current = String::new();
    let mut previous_was_lower = false;
    for c in folded.chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && previous_was_lower {
                words.push(std::mem::take(&mut current));
            }
            current.push(c.to_ascii_lowercase());
            previous_was_lower = c.is_ascii_lowercase();
        } else {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            previous_was_lower = false;
        }
    }
    if !current.is_empty() {
        words.push(current);
    }

    let mut seen = HashSet::new();
    words.retain(|word| seen.insert(word.clone()));
    words
}

/// Reads the text an index's key path points at and tokenizes it. Absent or
/// non-string values contribute no words.
pub fn get_full_text_index_words_for_item(key_path: &KeyPath, item: &Value) -> Vec<String> {
    if key_path.is_compound() {
        return Vec::new();
    }
    match get_value_for_single_keypath(item, key_path.components()[0]) {
        Some(Value::String(text)) => break_and_normalize_search_phrase(text),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn splits_on_whitespace_and_punctuation() {
        assert_eq!(
            break_and_normalize_search_phrase("the quick, brown fox!"),
            vec!["the", "quick", "brown", "fox"]
        );
    }

    #[test]
    fn splits_camel_case_words() {
        assert_eq!(
            break_and_normalize_search_phrase("camelCaseWords"),
            vec!["camel", "case", "words"]
        );
    }

    #[test]
    fn lowercases_and_deburrs() {
        assert_eq!(
            break_and_normalize_search_phrase("Crème Brûlée"),
            vec!["creme", "brulee"]
        );
    }

    #[test]
    fn collapses_duplicates_keeping_first_occurrence() {
        assert_eq!(
            break_and_normalize_search_phrase("dog cat dog bird cat"),
            vec!["dog", "cat", "bird"]
        );
    }

    #[test]
    fn empty_phrase_yields_no_tokens() {
        assert!(break_and_normalize_search_phrase("  ... !! ").is_empty());
    }

    #[test]
    fn reads_words_at_the_key_path() {
        let doc = json!({"txt": "bob likes his dog"});
        assert_eq!(
            get_full_text_index_words_for_item(&KeyPath::from("txt"), &doc),
            vec!["bob", "likes", "his", "dog"]
        );
        assert!(get_full_text_index_words_for_item(&KeyPath::from("missing"), &doc).is_empty());
    }
}
