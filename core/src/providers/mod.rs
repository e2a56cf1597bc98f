//! Registry of model providers.
//!
//! Each vendor differs in wire format, authentication, URL shape and
//! message-role vocabulary; everything vendor-specific lives behind the
//! [`ProviderAdapter`] capability set. Adapters are immutable values with no
//! inheritance tree; one shape per vendor, chosen by name.

mod anthropic;
mod gemini;
mod mistral;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use mistral::MistralAdapter;
pub use openai::OpenAiAdapter;

use std::sync::Arc;

use crate::conversation::Message;
use crate::error::EnvVarError;
use crate::error::MagusErr;
use crate::error::Result;
use crate::models::WriteFileCommand;

/// Capability set implemented once per vendor.
pub trait ProviderAdapter: Send + Sync + std::fmt::Debug {
    /// Internal adapter name ("anthropic", "openai", "gemini", "mistral").
    fn name(&self) -> &'static str;
    fn default_model(&self) -> &'static str;
    fn api_key_env_var(&self) -> &'static str;
    /// Full request URL. Adapter G carries the API key as a query
    /// parameter; the others authenticate through headers.
    fn full_url(&self, api_key: &str, model: &str) -> String;
    fn build_single_turn_payload(&self, system: &str, user: &str, model: &str)
    -> serde_json::Value;
    fn build_conversation_payload(
        &self,
        system: &str,
        history: &[Message],
        model: &str,
    ) -> serde_json::Value;
    fn headers(&self, api_key: &str) -> Vec<(&'static str, String)>;
    /// Unwrap the vendor envelope and parse the plan object inside.
    fn parse_plan(&self, raw_body: &str) -> Result<WriteFileCommand>;
    /// Unwrap the vendor envelope down to the assistant text.
    fn parse_chat(&self, raw_body: &str) -> Result<String>;
}

/// Detection priority when no provider is named explicitly.
pub const DETECTION_ORDER: &[(&str, &str)] = &[
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("gemini", "GEMINI_API_KEY"),
    ("mistral", "MISTRAL_API_KEY"),
];

/// Map a user-facing provider name to the internal adapter name.
pub fn internal_name(friendly: &str) -> Option<&'static str> {
    match friendly {
        "claude" | "anthropic" => Some("anthropic"),
        "chatgpt" | "openai" => Some("openai"),
        "gemini" => Some("gemini"),
        "mistral" => Some("mistral"),
        _ => None,
    }
}

/// Construct the adapter for an internal or friendly name.
pub fn adapter_for(name: &str) -> Result<Arc<dyn ProviderAdapter>> {
    match internal_name(name) {
        Some("anthropic") => Ok(Arc::new(AnthropicAdapter::new())),
        Some("openai") => Ok(Arc::new(OpenAiAdapter::new())),
        Some("gemini") => Ok(Arc::new(GeminiAdapter::new())),
        Some("mistral") => Ok(Arc::new(MistralAdapter::new())),
        _ => Err(MagusErr::Configuration(format!(
            "unknown provider: {name} (expected gemini, chatgpt, claude or mistral)"
        ))),
    }
}

/// Select the first provider whose API key environment variable is set and
/// non-empty, in [`DETECTION_ORDER`].
pub fn detect_provider() -> Result<Arc<dyn ProviderAdapter>> {
    detect_provider_with(|var| std::env::var(var).ok())
}

fn detect_provider_with<F>(lookup: F) -> Result<Arc<dyn ProviderAdapter>>
where
    F: Fn(&str) -> Option<String>,
{
    for (name, var) in DETECTION_ORDER {
        if lookup(var).is_some_and(|value| !value.is_empty()) {
            return adapter_for(name);
        }
    }
    let recognized = DETECTION_ORDER
        .iter()
        .map(|(_, var)| *var)
        .collect::<Vec<_>>()
        .join(", ");
    Err(MagusErr::Configuration(format!(
        "no provider API key found; set one of: {recognized}"
    )))
}

/// Read the adapter's API key from the environment.
pub fn api_key(adapter: &dyn ProviderAdapter) -> Result<String> {
    let var = adapter.api_key_env_var();
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(MagusErr::EnvVar(EnvVarError {
            var: var.to_string(),
            instructions: Some(format!(
                "Export it to use the {} provider.",
                adapter.name()
            )),
        })),
    }
}

/// Parse the plan object out of assistant text. The model is instructed to
/// reply with a bare JSON object `{command, path, content,
/// request_execution?}`.
pub(crate) fn parse_plan_text(provider: &str, text: &str) -> Result<WriteFileCommand> {
    let trimmed = text.trim();
    serde_json::from_str::<WriteFileCommand>(trimmed).map_err(|e| {
        // Carry the raw text so the caller can display what the model
        // actually said instead of executing it.
        MagusErr::parse(provider, format!("plan object did not parse ({e}): {trimmed}"))
    })
}

/// Strip a leading triple-backtick fence (with or without a `json` tag) and
/// the matching trailing fence.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.strip_suffix("```").map(str::trim).unwrap_or(rest)
}

/// Fetch a required string out of a vendor envelope, failing with the field
/// path when absent.
pub(crate) fn envelope_str<'a>(
    provider: &str,
    value: &'a serde_json::Value,
    path: &[&str],
) -> Result<&'a str> {
    let mut cursor = value;
    for key in path {
        cursor = match key.parse::<usize>() {
            Ok(index) => cursor.get(index),
            Err(_) => cursor.get(*key),
        }
        .ok_or_else(|| {
            MagusErr::parse(provider, format!("missing envelope field {}", path.join(".")))
        })?;
    }
    cursor.as_str().ok_or_else(|| {
        MagusErr::parse(provider, format!("envelope field {} is not a string", path.join(".")))
    })
}
