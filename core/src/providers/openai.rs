//! Adapter for the OpenAI Chat Completions API: a flat `messages` array with
//! the system role first, bearer authentication.

use serde_json::Value;
use serde_json::json;

use crate::conversation::Message;
use crate::conversation::Role;
use crate::error::MagusErr;
use crate::error::Result;
use crate::models::WriteFileCommand;
use crate::providers::ProviderAdapter;
use crate::providers::envelope_str;
use crate::providers::parse_plan_text;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    base_url: String,
}

impl OpenAiAdapter {
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

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn chat_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

pub(crate) fn flat_messages(system: &str, history: &[Message]) -> Vec<Value> {
    let mut messages = vec![json!({ "role": "system", "content": system })];
    for message in history {
        messages.push(json!({
            "role": chat_role(message.role),
            "content": message.content,
        }));
    }
    messages
}

pub(crate) fn parse_flat_chat(provider: &'static str, raw_body: &str) -> Result<String> {
    let envelope: Value =
        serde_json::from_str(raw_body).map_err(|e| MagusErr::parse(provider, e))?;
    Ok(envelope_str(
        provider,
        &envelope,
        &["choices", "0", "message", "content"],
    )?
    .to_string())
}

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn default_model(&self) -> &'static str {
        "gpt-4o"
    }

    fn api_key_env_var(&self) -> &'static str {
        "OPENAI_API_KEY"
    }

    fn full_url(&self, _api_key: &str, _model: &str) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    fn build_single_turn_payload(&self, system: &str, user: &str, model: &str) -> Value {
        json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        })
    }

    fn build_conversation_payload(&self, system: &str, history: &[Message], model: &str) -> Value {
        json!({
            "model": model,
            "messages": flat_messages(system, history),
        })
    }

    fn headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        vec![("authorization", format!("Bearer {api_key}"))]
    }

    fn parse_plan(&self, raw_body: &str) -> Result<WriteFileCommand> {
        let text = self.parse_chat(raw_body)?;
        parse_plan_text(self.name(), &text)
    }

    fn parse_chat(&self, raw_body: &str) -> Result<String> {
        parse_flat_chat(self.name(), raw_body)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    #[test]
    fn url_and_bearer_auth() {
        let adapter = OpenAiAdapter::new();
        assert_eq!(
            adapter.full_url("secret", "gpt-4o"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            adapter.headers("secret"),
            vec![("authorization", "Bearer secret".to_string())]
        );
    }

    #[test]
    fn conversation_payload_puts_system_first() {
        let adapter = OpenAiAdapter::new();
        let history = vec![Message {
            role: Role::User,
            content: "hi".to_string(),
            timestamp: Utc::now(),
            provider: None,
        }];
        let payload = adapter.build_conversation_payload("rules", &history, "gpt-4o");
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "rules");
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn chat_parsing_unwraps_first_choice() {
        let adapter = OpenAiAdapter::new();
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"sure"}}]}"#;
        assert_eq!(adapter.parse_chat(body).unwrap(), "sure");
    }

    #[test]
    fn empty_choices_is_a_parse_error() {
        let adapter = OpenAiAdapter::new();
        let err = adapter.parse_chat(r#"{"choices":[]}"#).unwrap_err();
        assert!(err.to_string().contains("openai"));
    }

    #[test]
    fn plan_parsing_requires_all_fields() {
        let adapter = OpenAiAdapter::new();
        let body = r#"{"choices":[{"message":{"content":"{\"command\":\"write\",\"path\":\"x\"}"}}]}"#;
        assert!(adapter.parse_plan(body).is_err());
    }
}
