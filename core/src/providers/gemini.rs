//! Adapter for the Gemini `generateContent` API.
//!
//! Turns live in a `contents` array with per-turn `parts`, the assistant
//! role is spelled `model`, the system prompt travels in a separate
//! `systemInstruction` field, and the API key is a URL query parameter.

use serde_json::Value;
use serde_json::json;

use crate::conversation::Message;
use crate::conversation::Role;
use crate::error::MagusErr;
use crate::error::Result;
use crate::models::WriteFileCommand;
use crate::providers::ProviderAdapter;
use crate::providers::parse_plan_text;
use crate::providers::strip_code_fence;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    base_url: String,
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn default_model(&self) -> &'static str {
        "gemini-1.5-pro"
    }

    fn api_key_env_var(&self) -> &'static str {
        "GEMINI_API_KEY"
    }

    fn full_url(&self, api_key: &str, model: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:generateContent?key={api_key}",
            self.base_url.trim_end_matches('/')
        )
    }

    fn build_single_turn_payload(&self, system: &str, user: &str, _model: &str) -> Value {
        json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": [
                { "role": "user", "parts": [{ "text": user }] }
            ],
        })
    }

    fn build_conversation_payload(&self, system: &str, history: &[Message], _model: &str) -> Value {
        let mut system_text = system.to_string();
        let mut contents = Vec::new();
        for message in history {
            match message.role {
                Role::System => {
                    system_text.push_str("\n\n");
                    system_text.push_str(&message.content);
                }
                Role::User => contents.push(json!({
                    "role": "user",
                    "parts": [{ "text": message.content }],
                })),
                Role::Assistant => contents.push(json!({
                    "role": "model",
                    "parts": [{ "text": message.content }],
                })),
            }
        }
        json!({
            "systemInstruction": { "parts": [{ "text": system_text }] },
            "contents": contents,
        })
    }

    fn headers(&self, _api_key: &str) -> Vec<(&'static str, String)> {
        // Authentication is the `key` query parameter in `full_url`.
        Vec::new()
    }

    fn parse_plan(&self, raw_body: &str) -> Result<WriteFileCommand> {
        let text = self.parse_chat(raw_body)?;
        // Gemini likes to wrap JSON answers in a markdown fence.
        parse_plan_text(self.name(), strip_code_fence(&text))
    }

    fn parse_chat(&self, raw_body: &str) -> Result<String> {
        let envelope: Value =
            serde_json::from_str(raw_body).map_err(|e| MagusErr::parse(self.name(), e))?;
        let parts = envelope
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                MagusErr::parse(self.name(), "missing envelope field candidates.0.content.parts")
            })?;
        let text: String = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if text.is_empty() {
            return Err(MagusErr::parse(self.name(), "candidate contained no text parts"));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    #[test]
    fn api_key_rides_in_the_url() {
        let adapter = GeminiAdapter::new();
        assert_eq!(
            adapter.full_url("secret", "gemini-1.5-pro"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:generateContent?key=secret"
        );
        assert!(adapter.headers("secret").is_empty());
    }

    #[test]
    fn assistant_role_is_spelled_model() {
        let adapter = GeminiAdapter::new();
        let history = vec![
            Message {
                role: Role::User,
                content: "q".to_string(),
                timestamp: Utc::now(),
                provider: None,
            },
            Message {
                role: Role::Assistant,
                content: "a".to_string(),
                timestamp: Utc::now(),
                provider: None,
            },
        ];
        let payload = adapter.build_conversation_payload("sys", &history, "m");
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "sys");
    }

    #[test]
    fn chat_parsing_concatenates_text_parts() {
        let adapter = GeminiAdapter::new();
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"one "},{"text":"two"}],"role":"model"}}]}"#;
        assert_eq!(adapter.parse_chat(body).unwrap(), "one two");
    }

    #[test]
    fn plan_parsing_strips_markdown_fence() {
        let adapter = GeminiAdapter::new();
        let fenced = "```json\n{\"command\":\"write\",\"path\":\"src/a.txt\",\"content\":\"hi\"}\n```";
        let body = serde_json::to_string(&json!({
            "candidates": [{ "content": { "parts": [{ "text": fenced }] } }]
        }))
        .unwrap();
        let plan = adapter.parse_plan(&body).unwrap();
        assert_eq!(plan.command, "write");
        assert_eq!(plan.path, "src/a.txt");
    }

    #[test]
    fn missing_candidates_is_a_parse_error() {
        let adapter = GeminiAdapter::new();
        let err = adapter.parse_chat(r#"{"promptFeedback":{}}"#).unwrap_err();
        assert!(err.to_string().contains("gemini"));
    }
}
