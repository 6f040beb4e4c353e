//! Text processing shared by topic tagging and keyword classification

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").expect("valid regex");
    static ref TOKEN_REGEX: Regex = Regex::new(r"[\p{L}\p{N}]+").expect("valid regex");
    static ref STOP_WORDS: Vec<&'static str> = vec![
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for",
        "of", "with", "by", "is", "am", "are", "was", "were", "be", "been",
        "being", "have", "has", "had", "do", "does", "did", "will", "would",
        "shall", "should", "may", "might", "must", "can", "could", "i", "you",
        "he", "she", "it", "we", "they", "me", "him", "her", "us", "them",
        "my", "your", "his", "its", "our", "their", "mine", "yours", "hers",
        "ours", "theirs", "this", "that", "these", "those", "please", "what",
        "how", "why", "when", "where", "who", "which", "there", "here", "so",
        "just", "not", "no", "from", "into", "about", "as", "if", "then",
    ];
}

/// Token span within the original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

pub struct TextUtils;

impl TextUtils {
    /// Lowercased word tokens with their byte offsets.
    pub fn tokens(text: &str) -> Vec<Token> {
        TOKEN_REGEX
            .find_iter(text)
            .map(|m| Token {
                text: m.as_str().to_lowercase(),
                start: m.start(),
                end: m.end(),
            })
            .collect()
    }

    pub fn tokenize(text: &str) -> Vec<String> {
        TOKEN_REGEX
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect()
    }

    /// Tokens worth scoring: not stop words, at least `min_len` chars.
    pub fn content_words(text: &str, min_len: usize) -> Vec<String> {
        Self::tokenize(text)
            .into_iter()
            .filter(|w| Self::is_significant_word(w, min_len))
            .collect()
    }

    pub fn is_stop_word(word: &str) -> bool {
        STOP_WORDS.contains(&word.to_lowercase().as_str())
    }

    pub fn is_significant_word(word: &str, min_len: usize) -> bool {
        word.chars().count() >= min_len && !Self::is_stop_word(word)
    }

    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Truncate on a char boundary, appending an ellipsis when shortened.
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result: String = text.chars().take(max_chars - 3).collect();
            result.push_str("...");
            Cow::Owned(result)
        }
    }
}
