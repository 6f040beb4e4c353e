//! Topic tags for conversations, derived from message text

use crate::utils::text_utils::TextUtils;
use std::collections::HashMap;

/// Extract lowercase topic tags from text with configurable limits
pub struct TopicExtractor {
    max_topics: usize,
    min_word_length: usize,
}

impl Default for TopicExtractor {
    fn default() -> Self {
        Self {
            max_topics: 3,
            min_word_length: 4,
        }
    }
}

impl TopicExtractor {
    pub fn new(max_topics: usize, min_word_length: usize) -> Self {
        Self {
            max_topics,
            min_word_length,
        }
    }

    /// Words following "about"/"regarding" win; otherwise the most frequent
    /// significant words, first occurrence breaking ties.
    pub fn extract_from_text(&self, text: &str) -> Vec<String> {
        let words = TextUtils::tokenize(text);
        let mut topics: Vec<String> = Vec::new();

        for (i, word) in words.iter().enumerate() {
            if matches!(word.as_str(), "about" | "regarding" | "discussing") {
                if let Some(next) = words[i + 1..]
                    .iter()
                    .take(3)
                    .find(|w| TextUtils::is_significant_word(w, self.min_word_length))
                {
                    push_unique(&mut topics, next);
                }
            }
        }

        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for (pos, word) in words.iter().enumerate() {
            if TextUtils::is_significant_word(word, self.min_word_length) {
                counts.entry(word.as_str()).or_insert((0, pos)).0 += 1;
            }
        }
        let mut ranked: Vec<(&str, (usize, usize))> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
        for (word, _) in ranked {
            push_unique(&mut topics, word);
        }

        topics.truncate(self.max_topics);
        topics
    }

    /// Merge new topics into an existing tag list, keeping order and capping length.
    pub fn merge(&self, existing: &[String], text: &str, cap: usize) -> Vec<String> {
        let mut merged = existing.to_vec();
        for topic in self.extract_from_text(text) {
            if merged.len() >= cap {
                break;
            }
            push_unique(&mut merged, &topic);
        }
        merged
    }
}

fn push_unique(list: &mut Vec<String>, word: &str) {
    if !list.iter().any(|w| w == word) {
        list.push(word.to_string());
    }
}
