//! Adapter for the Anthropic Messages API.
//!
//! The system prompt travels in a dedicated `system` field, message content
//! is an array of typed parts, and authentication uses a custom header pair
//! (`x-api-key` plus `anthropic-version`).

use serde_json::Value;
use serde_json::json;

use crate::conversation::Message;
use crate::conversation::Role;
use crate::error::Result;
use crate::models::WriteFileCommand;
use crate::providers::ProviderAdapter;
use crate::providers::envelope_str;
use crate::providers::parse_plan_text;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    base_url: String,
}

impl AnthropicAdapter {
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

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn default_model(&self) -> &'static str {
        "claude-3-5-sonnet-20241022"
    }

    fn api_key_env_var(&self) -> &'static str {
        "ANTHROPIC_API_KEY"
    }

    fn full_url(&self, _api_key: &str, _model: &str) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn build_single_turn_payload(&self, system: &str, user: &str, model: &str) -> Value {
        json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "system": system,
            "messages": [
                { "role": "user", "content": [{ "type": "text", "text": user }] }
            ],
        })
    }

    fn build_conversation_payload(&self, system: &str, history: &[Message], model: &str) -> Value {
        // The Messages API has no system role inside `messages`; system
        // entries from the history are folded into the `system` field.
        let mut system_text = system.to_string();
        let mut messages = Vec::new();
        for message in history {
            match message.role {
                Role::System => {
                    system_text.push_str("\n\n");
                    system_text.push_str(&message.content);
                }
                Role::User | Role::Assistant => {
                    let role = match message.role {
                        Role::User => "user",
                        _ => "assistant",
                    };
                    messages.push(json!({
                        "role": role,
                        "content": [{ "type": "text", "text": message.content }],
                    }));
                }
            }
        }
        json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "system": system_text,
            "messages": messages,
        })
    }

    fn headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        vec![
            ("x-api-key", api_key.to_string()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ]
    }

    fn parse_plan(&self, raw_body: &str) -> Result<WriteFileCommand> {
        let text = self.parse_chat(raw_body)?;
        parse_plan_text(self.name(), &text)
    }

    fn parse_chat(&self, raw_body: &str) -> Result<String> {
        let envelope: Value = serde_json::from_str(raw_body)
            .map_err(|e| crate::error::MagusErr::parse(self.name(), e))?;
        Ok(envelope_str(self.name(), &envelope, &["content", "0", "text"])?.to_string())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn message(role: Role, content: &str) -> Message {
        Message {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            provider: None,
        }
    }

    #[test]
    fn url_and_headers_use_custom_auth() {
        let adapter = AnthropicAdapter::new();
        assert_eq!(
            adapter.full_url("secret", "claude-3-5-sonnet-20241022"),
            "https://api.anthropic.com/v1/messages"
        );
        let headers = adapter.headers("secret");
        assert!(headers.contains(&("x-api-key", "secret".to_string())));
        assert!(headers.contains(&("anthropic-version", ANTHROPIC_VERSION.to_string())));
    }

    #[test]
    fn single_turn_payload_separates_system_from_messages() {
        let adapter = AnthropicAdapter::new();
        let payload = adapter.build_single_turn_payload("be terse", "hello", "m");
        assert_eq!(payload["system"], "be terse");
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["messages"][0]["content"][0]["type"], "text");
        assert_eq!(payload["messages"][0]["content"][0]["text"], "hello");
    }

    #[test]
    fn conversation_payload_folds_system_history_into_system_field() {
        let adapter = AnthropicAdapter::new();
        let history = vec![
            message(Role::System, "extra context"),
            message(Role::User, "question"),
            message(Role::Assistant, "answer"),
        ];
        let payload = adapter.build_conversation_payload("base", &history, "m");
        let system = payload["system"].as_str().unwrap();
        assert!(system.starts_with("base"));
        assert!(system.contains("extra context"));
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["role"], "assistant");
    }

    #[test]
    fn chat_parsing_unwraps_content_block() {
        let adapter = AnthropicAdapter::new();
        let body = r#"{"content":[{"type":"text","text":"hi there"}],"role":"assistant"}"#;
        assert_eq!(adapter.parse_chat(body).unwrap(), "hi there");
    }

    #[test]
    fn plan_parsing_reads_the_embedded_object() {
        let adapter = AnthropicAdapter::new();
        let body = r#"{"content":[{"type":"text","text":"{\"command\":\"write\",\"path\":\"src/a.txt\",\"content\":\"hi\"}"}]}"#;
        let plan = adapter.parse_plan(body).unwrap();
        assert_eq!(plan.path, "src/a.txt");
        assert_eq!(plan.content, "hi");
    }

    #[test]
    fn missing_envelope_field_is_a_parse_error() {
        let adapter = AnthropicAdapter::new();
        let err = adapter.parse_chat(r#"{"role":"assistant"}"#).unwrap_err();
        assert!(err.to_string().contains("anthropic"));
    }
}
