//! Model-backed classifier talking to an Ollama server

use crate::error::{MemoryError, MemoryResult};
use crate::memory_db::{Message, RouterSchema};
use crate::router::classifier::{ClassScore, Classification, ClassificationBackend};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_ROUTER_MODEL: &str = "llama3.2:3b";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
    options: Value,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

pub struct OllamaBackend {
    base_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let model = model.into();
        info!("Ollama router backend at {} using {}", base_url, model);
        Self {
            base_url,
            model,
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }
}

pub fn build_system_prompt(schema: &RouterSchema) -> String {
    let mut prompt = String::from(
        "You are an intent router. Choose exactly one class from the list and answer with JSON only. \
         If no class fits, answer with an empty object {}.\n\nClasses:\n",
    );
    for class in &schema.classes {
        prompt.push_str(&format!("- {}: {}\n", class.name, class.description));
    }
    if !schema.examples.is_empty() {
        prompt.push_str("\nExamples:\n");
        for example in &schema.examples {
            let expected = json!({
                "class": example.expected.class,
                "arguments": example.expected.arguments,
            });
            prompt.push_str(&format!("query: \"{}\"\n{}\n\n", example.query, expected));
        }
    }
    prompt.push_str("Return only JSON of the form {\"class\": \"<name>\", \"arguments\": {}}.");
    prompt
}

pub fn build_user_prompt(schema: &RouterSchema, query: &str, context: &[Message]) -> String {
    let names: Vec<&str> = schema.classes.iter().map(|c| c.name.as_str()).collect();
    let mut prompt = format!(
        "There are {} classes: {}.\n",
        names.len(),
        names.join(", ")
    );
    if !context.is_empty() {
        prompt.push_str("\nRecent conversation:\n");
        for message in context {
            prompt.push_str(&format!("{}: {}\n", message.role.as_str(), message.content));
        }
    }
    prompt.push_str(&format!("\nQuestion: {}", query));
    prompt
}

/// Read a model reply: `{"class": .., "arguments": {..}}` or `{"<class>": value}`.
/// Undeclared or unreadable classes yield no class.
pub fn parse_reply(raw: &str, schema: &RouterSchema) -> Classification {
    let parsed = serde_json::from_str::<Value>(raw.trim()).ok().or_else(|| {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str::<Value>(&raw[start..=end]).ok()
    });

    let (class, arguments) = match parsed {
        Some(Value::Object(map)) => {
            if let Some(class) = map.get("class") {
                let arguments = map.get("arguments").and_then(|a| a.as_object()).cloned();
                (class.as_str().map(str::to_string), arguments)
            } else if let Some((class, value)) = map.into_iter().next() {
                let arguments = match value {
                    Value::Object(args) => args,
                    other => {
                        let mut args = Map::new();
                        args.insert("value".into(), other);
                        args
                    }
                };
                (Some(class), Some(arguments))
            } else {
                (None, None)
            }
        }
        _ => (None, None),
    };

    let class = class.filter(|c| schema.classes.iter().any(|declared| &declared.name == c));
    Classification {
        scores: schema
            .classes
            .iter()
            .map(|c| ClassScore {
                class: c.name.clone(),
                score: if class.as_deref() == Some(c.name.as_str()) { 1.0 } else { 0.0 },
            })
            .collect(),
        arguments: class.as_ref().and(arguments),
        class,
    }
}

#[async_trait]
impl ClassificationBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn classify(
        &self,
        schema: &RouterSchema,
        query: &str,
        context: &[Message],
    ) -> MemoryResult<Classification> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: format!(
                "<|system|>\n{}\n\n<|user|>\n{}\n",
                build_system_prompt(schema),
                build_user_prompt(schema, query, context)
            ),
            stream: false,
            format: "json",
            options: json!({ "temperature": 0 }),
        };
        debug!("Routing via {} with model {}", self.generate_url(), self.model);

        let response = self
            .http_client
            .post(self.generate_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MemoryError::Timeout(format!("router backend: {}", e))
                } else {
                    MemoryError::storage(format!("router backend request failed: {}", e))
                }
            })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::storage(format!(
                "router backend returned {}: {}",
                status, body
            )));
        }
        let reply: GenerateResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::storage(format!("failed to parse router backend reply: {}", e)))?;

        let classification = parse_reply(&reply.response, schema);
        if classification.class.is_none() {
            warn!("Router model reply did not name a declared class: {}", reply.response);
        }
        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{ExpectedRoute, RouterClass, RouterExample};
    use chrono::Utc;

    fn schema() -> RouterSchema {
        RouterSchema {
            key: "orders".into(),
            title: None,
            description: None,
            classes: vec![
                RouterClass {
                    name: "cancel".into(),
                    description: "Cancel an order".into(),
                },
                RouterClass {
                    name: "track".into(),
                    description: "Track a shipment".into(),
                },
            ],
            examples: vec![RouterExample {
                query: "cancel order 12".into(),
                expected: ExpectedRoute {
                    class: "cancel".into(),
                    arguments: json!({"order_id": "12"}).as_object().cloned().unwrap_or_default(),
                },
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_activated_version: None,
        }
    }

    #[test]
    fn test_parse_reply_shapes() {
        let schema = schema();
        let explicit = parse_reply(r#"{"class": "cancel", "arguments": {"order_id": "7"}}"#, &schema);
        assert_eq!(explicit.class.as_deref(), Some("cancel"));
        assert_eq!(explicit.arguments.unwrap()["order_id"], json!("7"));

        let keyed = parse_reply(r#"{"track": "ZX-1"}"#, &schema);
        assert_eq!(keyed.class.as_deref(), Some("track"));
        assert_eq!(keyed.arguments.unwrap()["value"], json!("ZX-1"));

        let wrapped = parse_reply("Sure! {\"class\": \"track\"} hope that helps", &schema);
        assert_eq!(wrapped.class.as_deref(), Some("track"));

        assert!(parse_reply("{}", &schema).class.is_none());
        assert!(parse_reply("not json", &schema).class.is_none());
        let unknown = parse_reply(r#"{"class": "refund"}"#, &schema);
        assert!(unknown.class.is_none());
        assert!(unknown.arguments.is_none());
    }

    #[test]
    fn test_prompts_list_classes_and_examples() {
        let schema = schema();
        let system = build_system_prompt(&schema);
        assert!(system.contains("- cancel: Cancel an order"));
        assert!(system.contains("query: \"cancel order 12\""));
        let user = build_user_prompt(&schema, "where is my parcel", &[]);
        assert!(user.contains("There are 2 classes: cancel, track."));
        assert!(user.ends_with("Question: where is my parcel"));
    }

    #[tokio::test]
    async fn test_classify_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(mockito::Matcher::PartialJson(json!({"stream": false})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response": "{\"class\": \"track\", \"arguments\": {\"id\": \"9\"}}", "done": true}"#)
            .create_async()
            .await;

        let backend = OllamaBackend::new(server.url(), DEFAULT_ROUTER_MODEL, Duration::from_secs(5));
        let result = backend.classify(&schema(), "where is parcel 9", &[]).await.unwrap();
        mock.assert_async().await;
        assert_eq!(result.class.as_deref(), Some("track"));
        assert_eq!(result.arguments.unwrap()["id"], json!("9"));
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/generate")
            .with_status(500)
            .with_body("model not loaded")
            .create_async()
            .await;
        let backend = OllamaBackend::new(server.url(), DEFAULT_ROUTER_MODEL, Duration::from_secs(5));
        let err = backend.classify(&schema(), "cancel it", &[]).await.unwrap_err();
        assert!(matches!(err, MemoryError::Storage(_)));
    }
}
