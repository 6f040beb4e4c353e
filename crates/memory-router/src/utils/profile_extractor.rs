//! Profile hints learned from what a user says about themselves

use crate::utils::text_utils::TextUtils;

const LANGUAGES: &[(&str, &str)] = &[
    ("python", "Python"),
    ("javascript", "JavaScript"),
    ("typescript", "TypeScript"),
    ("java", "Java"),
    ("rust", "Rust"),
    ("golang", "Go"),
    ("ruby", "Ruby"),
    ("php", "PHP"),
];

const AI_WORDS: &[&str] = &["ai", "llm", "llms", "neural", "ml"];
const AI_PHRASES: &[&str] = &["machine learning", "artificial intelligence", "neural network"];
const DEVOPS_WORDS: &[&str] = &["docker", "kubernetes", "k8s", "devops", "terraform"];
const NAME_LEADS: &[&[&str]] = &[&["my", "name", "is"], &["call", "me"]];

const REPLY_LANGUAGES: &[(&str, &str)] = &[
    ("in english", "en"),
    ("in russian", "ru"),
    ("на русском", "ru"),
    ("по-русски", "ru"),
    ("in spanish", "es"),
    ("en español", "es"),
    ("in german", "de"),
    ("auf deutsch", "de"),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileHints {
    pub facts: Vec<String>,
    /// Preferred reply language as an ISO 639-1 code.
    pub language: Option<&'static str>,
}

impl ProfileHints {
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.language.is_none()
    }
}

#[derive(Debug, Default)]
pub struct ProfileExtractor;

impl ProfileExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, text: &str) -> ProfileHints {
        let words = TextUtils::tokenize(text);
        let lower = text.to_lowercase();
        let has_word = |w: &str| words.iter().any(|t| t == w);
        let mut hints = ProfileHints::default();

        for (token, label) in LANGUAGES {
            if has_word(token) {
                hints.facts.push(format!("Interested in {} programming", label));
            }
        }
        if lower.contains("c++") {
            hints.facts.push("Interested in C++ programming".to_string());
        }
        if AI_WORDS.iter().any(|w| has_word(w)) || AI_PHRASES.iter().any(|p| lower.contains(p)) {
            hints.facts.push("Interested in artificial intelligence".to_string());
        }
        if DEVOPS_WORDS.iter().any(|w| has_word(w)) {
            hints.facts.push("Works with DevOps tooling".to_string());
        }
        if let Some(name) = Self::name(text, &words) {
            hints.facts.push(format!("Name: {}", name));
        }

        hints.language = REPLY_LANGUAGES
            .iter()
            .find(|(phrase, _)| lower.contains(phrase))
            .map(|(_, code)| *code);
        hints
    }

    /// The word after "my name is" / "call me", as written in the original text.
    fn name(text: &str, words: &[String]) -> Option<String> {
        for lead in NAME_LEADS {
            let Some(hit) = words
                .windows(lead.len() + 1)
                .find(|w| w[..lead.len()].iter().zip(lead.iter()).all(|(a, b)| a == b))
            else {
                continue;
            };
            let candidate = &hit[lead.len()];
            if candidate.chars().count() < 2 || !candidate.chars().all(char::is_alphabetic) {
                continue;
            }
            return TextUtils::tokens(text)
                .into_iter()
                .find(|t| t.text == *candidate)
                .map(|t| text[t.start..t.end].to_string());
        }
        None
    }
}
