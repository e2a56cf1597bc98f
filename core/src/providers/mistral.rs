//! Adapter for the Mistral chat API. The wire shape is identical to the
//! OpenAI chat-completions shape; only the endpoint, the default model and
//! the key variable differ.

use serde_json::Value;
use serde_json::json;

use crate::conversation::Message;
use crate::error::Result;
use crate::models::WriteFileCommand;
use crate::providers::ProviderAdapter;
use crate::providers::openai::flat_messages;
use crate::providers::openai::parse_flat_chat;
use crate::providers::parse_plan_text;

const DEFAULT_BASE_URL: &str = "https://api.mistral.ai";

#[derive(Debug, Clone)]
pub struct MistralAdapter {
    base_url: String,
}

impl MistralAdapter {
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

impl Default for MistralAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for MistralAdapter {
    fn name(&self) -> &'static str {
        "mistral"
    }

    fn default_model(&self) -> &'static str {
        "mistral-large-latest"
    }

    fn api_key_env_var(&self) -> &'static str {
        "MISTRAL_API_KEY"
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
