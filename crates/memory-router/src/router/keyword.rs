//! Token-overlap classifier. Needs no model and is fully deterministic.

use crate::error::MemoryResult;
use crate::memory_db::{Message, MessageRole, RouterExample, RouterSchema};
use crate::router::classifier::{ClassScore, Classification, ClassificationBackend};
use crate::utils::{TextUtils, Token};
use async_trait::async_trait;
use moka::sync::Cache;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

const NAME_WEIGHT: f64 = 1.5;
const DESCRIPTION_WEIGHT: f64 = 1.0;
const EXAMPLE_WEIGHT: f64 = 2.0;
const CONTEXT_WEIGHT: f64 = 0.5;
const MIN_TERM_LEN: usize = 2;
const INDEX_CACHE_CAPACITY: u64 = 256;

fn terms(text: &str) -> HashSet<String> {
    TextUtils::content_words(text, MIN_TERM_LEN).into_iter().collect()
}

struct ClassIndex {
    name: String,
    name_terms: HashSet<String>,
    description_terms: HashSet<String>,
    /// (index into `schema.examples`, terms)
    examples: Vec<(usize, HashSet<String>)>,
}

impl ClassIndex {
    /// Weighted overlap with `query`, and the best-matching example.
    fn score(&self, query: &HashSet<String>) -> (f64, Option<usize>) {
        let name_hits = self.name_terms.intersection(query).count() as f64;
        let description_hits = self.description_terms.intersection(query).count() as f64;
        let mut best_example = None;
        let mut best_hits = 0;
        for (idx, example_terms) in &self.examples {
            let hits = example_terms.intersection(query).count();
            if hits > best_hits {
                best_hits = hits;
                best_example = Some(*idx);
            }
        }
        let score = name_hits * NAME_WEIGHT
            + description_hits * DESCRIPTION_WEIGHT
            + best_hits as f64 * EXAMPLE_WEIGHT;
        (score, best_example)
    }
}

struct SchemaIndex {
    classes: Vec<ClassIndex>,
}

impl SchemaIndex {
    fn build(schema: &RouterSchema) -> Self {
        let classes = schema
            .classes
            .iter()
            .map(|class| ClassIndex {
                name: class.name.clone(),
                name_terms: terms(&class.name),
                description_terms: terms(&class.description),
                examples: schema
                    .examples
                    .iter()
                    .enumerate()
                    .filter(|(_, ex)| ex.expected.class == class.name)
                    .map(|(idx, ex)| (idx, terms(&ex.query)))
                    .collect(),
            })
            .collect();
        Self { classes }
    }
}

/// Top score is zero or shared.
fn is_ambiguous(scores: &[f64]) -> bool {
    let top = scores.iter().cloned().fold(0.0_f64, f64::max);
    top <= 0.0 || scores.iter().filter(|s| **s == top).count() > 1
}

/// Highest positive score; earlier declaration wins ties.
fn best_class(scores: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, score) in scores.iter().enumerate() {
        if *score <= 0.0 {
            continue;
        }
        match best {
            Some(b) if scores[b] >= *score => {}
            _ => best = Some(idx),
        }
    }
    best
}

fn find_sequence(haystack: &[Token], needle: &[String]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&start| {
        needle
            .iter()
            .enumerate()
            .all(|(offset, word)| haystack[start + offset].text == *word)
    })
}

/// Locate the value in the new query using the words around it in the
/// example: text after the example's lead-in word, up to its trailing word.
fn extract_span(example_tokens: &[Token], value: &str, query: &str, query_tokens: &[Token]) -> Option<String> {
    let value_words = TextUtils::tokenize(value);
    let at = find_sequence(example_tokens, &value_words)?;
    let lead = at.checked_sub(1).map(|i| &example_tokens[i].text);
    let trail = example_tokens.get(at + value_words.len()).map(|t| &t.text);

    let start = match lead {
        Some(word) => query_tokens.iter().position(|t| &t.text == word)? + 1,
        None => 0,
    };
    let end = match trail {
        Some(word) => query_tokens[start..]
            .iter()
            .position(|t| &t.text == word)
            .map(|p| start + p)
            .unwrap_or(query_tokens.len()),
        None => query_tokens.len(),
    };
    if start >= end {
        return None;
    }
    let span = &query[query_tokens[start].start..query_tokens[end - 1].end];
    Some(span.trim().to_string())
}

/// Arguments for `query`, shaped like the example's expected arguments.
fn extract_arguments(example: &RouterExample, query: &str) -> Map<String, Value> {
    let example_tokens = TextUtils::tokens(&example.query);
    let query_tokens = TextUtils::tokens(query);
    let mut arguments = Map::new();
    for (name, expected) in &example.expected.arguments {
        let extracted = match expected {
            Value::String(s) => {
                extract_span(&example_tokens, s, query, &query_tokens).map(Value::String)
            }
            Value::Number(n) => extract_span(&example_tokens, &n.to_string(), query, &query_tokens)
                .and_then(|span| {
                    TextUtils::tokenize(&span)
                        .into_iter()
                        .find_map(|word| serde_json::from_str::<serde_json::Number>(&word).ok())
                })
                .map(Value::Number),
            _ => None,
        };
        if let Some(value) = extracted {
            arguments.insert(name.clone(), value);
        }
    }
    arguments
}

pub struct KeywordBackend {
    indices: Cache<(String, i64), Arc<SchemaIndex>>,
}

impl KeywordBackend {
    pub fn new() -> Self {
        Self {
            indices: Cache::builder().max_capacity(INDEX_CACHE_CAPACITY).build(),
        }
    }

    /// Index for this revision of the schema; an update changes `updated_at`
    /// and therefore the cache key.
    fn index_for(&self, schema: &RouterSchema) -> Arc<SchemaIndex> {
        let key = (schema.key.clone(), schema.updated_at.timestamp_micros());
        if let Some(index) = self.indices.get(&key) {
            return index;
        }
        debug!("Indexing router schema {}", schema.key);
        let index = Arc::new(SchemaIndex::build(schema));
        self.indices.insert(key, Arc::clone(&index));
        index
    }
}

impl Default for KeywordBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClassificationBackend for KeywordBackend {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn classify(
        &self,
        schema: &RouterSchema,
        query: &str,
        context: &[Message],
    ) -> MemoryResult<Classification> {
        let index = self.index_for(schema);
        let query_terms = terms(query);
        let scored: Vec<(f64, Option<usize>)> =
            index.classes.iter().map(|c| c.score(&query_terms)).collect();
        let mut scores: Vec<f64> = scored.iter().map(|(s, _)| *s).collect();

        if is_ambiguous(&scores) {
            let context_terms: HashSet<String> = context
                .iter()
                .filter(|m| m.role == MessageRole::User)
                .flat_map(|m| terms(&m.content))
                .filter(|t| !query_terms.contains(t))
                .collect();
            if !context_terms.is_empty() {
                for (score, class) in scores.iter_mut().zip(&index.classes) {
                    *score += class.score(&context_terms).0 * CONTEXT_WEIGHT;
                }
            }
        }

        let best = best_class(&scores);
        let arguments = best
            .and_then(|idx| scored[idx].1)
            .and_then(|example_idx| schema.examples.get(example_idx))
            .map(|example| extract_arguments(example, query))
            .filter(|args| !args.is_empty());

        Ok(Classification {
            class: best.map(|idx| index.classes[idx].name.clone()),
            arguments,
            scores: index
                .classes
                .iter()
                .zip(&scores)
                .map(|(class, score)| ClassScore {
                    class: class.name.clone(),
                    score: *score,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{ExpectedRoute, RouterClass};
    use chrono::Utc;
    use serde_json::json;

    fn schema(classes: &[(&str, &str)], examples: Vec<RouterExample>) -> RouterSchema {
        RouterSchema {
            key: "orders".into(),
            title: None,
            description: None,
            classes: classes
                .iter()
                .map(|(name, description)| RouterClass {
                    name: name.to_string(),
                    description: description.to_string(),
                })
                .collect(),
            examples,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_activated_version: None,
        }
    }

    fn example(query: &str, class: &str, arguments: Value) -> RouterExample {
        RouterExample {
            query: query.into(),
            expected: ExpectedRoute {
                class: class.into(),
                arguments: arguments.as_object().cloned().unwrap_or_default(),
            },
        }
    }

    fn message(content: &str, role: MessageRole) -> Message {
        Message {
            id: "m".into(),
            conversation_id: "c".into(),
            seq: 1,
            role,
            content: content.into(),
            tokens: 1,
            model: None,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ties_go_to_declaration_order() {
        let backend = KeywordBackend::new();
        let schema = schema(&[("refund", "money back"), ("return", "money back")], vec![]);
        let result = backend.classify(&schema, "I want my money back", &[]).await.unwrap();
        assert_eq!(result.class.as_deref(), Some("refund"));
        assert_eq!(result.scores[0].score, result.scores[1].score);
    }

    #[tokio::test]
    async fn test_no_overlap_is_unclassified() {
        let backend = KeywordBackend::new();
        let schema = schema(&[("refund", "money back")], vec![]);
        let result = backend.classify(&schema, "weather tomorrow", &[]).await.unwrap();
        assert!(result.class.is_none());
    }

    #[tokio::test]
    async fn test_arguments_follow_the_example() {
        let backend = KeywordBackend::new();
        let schema = schema(
            &[("cancel_order", "Cancel an order"), ("track_order", "Where is my order")],
            vec![
                example("cancel order A-12 today", "cancel_order", json!({"order_id": "A-12"})),
                example("ship 3 boxes", "track_order", json!({"count": 3})),
            ],
        );
        let result = backend
            .classify(&schema, "please cancel order B-77 today", &[])
            .await
            .unwrap();
        assert_eq!(result.class.as_deref(), Some("cancel_order"));
        assert_eq!(result.arguments.unwrap()["order_id"], json!("B-77"));

        let result = backend.classify(&schema, "ship 12 boxes", &[]).await.unwrap();
        assert_eq!(result.class.as_deref(), Some("track_order"));
        assert_eq!(result.arguments.unwrap()["count"], json!(12));
    }

    #[tokio::test]
    async fn test_context_only_breaks_ambiguity() {
        let backend = KeywordBackend::new();
        let schema = schema(&[("billing", "invoice payment"), ("outage", "server down")], vec![]);
        let context = vec![
            message("the server went down", MessageRole::User),
            message("invoice attached", MessageRole::Assistant),
        ];

        let result = backend.classify(&schema, "still broken", &context).await.unwrap();
        assert_eq!(result.class.as_deref(), Some("outage"));

        let result = backend.classify(&schema, "my invoice", &context).await.unwrap();
        assert_eq!(result.class.as_deref(), Some("billing"));
    }

    #[tokio::test]
    async fn test_index_is_rebuilt_after_schema_update() {
        let backend = KeywordBackend::new();
        let mut schema = schema(&[("alpha", "first")], vec![]);
        backend.classify(&schema, "first", &[]).await.unwrap();
        schema.classes[0].description = "second".into();
        schema.updated_at = schema.updated_at + chrono::Duration::seconds(1);
        let result = backend.classify(&schema, "second", &[]).await.unwrap();
        assert_eq!(result.class.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_best_class_helpers() {
        assert_eq!(best_class(&[0.0, 0.0]), None);
        assert_eq!(best_class(&[1.0, 2.0, 2.0]), Some(1));
        assert!(is_ambiguous(&[1.0, 1.0]));
        assert!(is_ambiguous(&[0.0]));
        assert!(!is_ambiguous(&[2.0, 1.0]));
    }
}
