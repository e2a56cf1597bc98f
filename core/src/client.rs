//! Model client: owns an adapter and a model name, synthesizes the
//! policy-aware system instructions, and performs the chat and plan calls.

use std::sync::Arc;
use std::time::Duration;

use crate::conversation::Message;
use crate::error::MagusErr;
use crate::error::Result;
use crate::models::WriteFileCommand;
use crate::policy::COMMAND_TOOL;
use crate::policy::CrudOp;
use crate::policy::FILE_TOOL;
use crate::policy::PolicyDocument;
use crate::providers::ProviderAdapter;
use crate::providers::adapter_for;
use crate::providers::api_key;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// System instructions for the two call modes. Derived from the policy
/// document at construction so the model knows the rules before proposing
/// work.
#[derive(Debug, Clone)]
pub struct SystemInstructions {
    pub chat: String,
    pub plan: String,
}

impl SystemInstructions {
    pub fn from_policy(document: &PolicyDocument) -> Self {
        let mut constraints = String::new();

        let file_create_dirs = document
            .tools
            .get(FILE_TOOL)
            .map(|tool| tool.for_op(CrudOp::Create).allowed_directories.clone())
            .unwrap_or_default();
        if file_create_dirs.iter().any(String::is_empty) {
            constraints.push_str("Files may be created anywhere inside the project.\n");
        } else if file_create_dirs.is_empty() {
            constraints.push_str("File creation is disabled by policy.\n");
        } else {
            constraints.push_str(&format!(
                "Files may only be created under: {}\n",
                file_create_dirs.join(", ")
            ));
        }

        if let Some(command_policy) = document
            .tools
            .get(COMMAND_TOOL)
            .map(|tool| tool.for_op(CrudOp::Create))
        {
            if let Some(allowed) = &command_policy.allowed_commands
                && !allowed.is_empty()
            {
                constraints.push_str(&format!(
                    "Only these base commands may run: {}\n",
                    allowed.join(", ")
                ));
            }
            if let Some(blocked) = &command_policy.blocked_commands
                && !blocked.is_empty()
            {
                constraints.push_str(&format!(
                    "Never suggest commands containing: {}\n",
                    blocked.join(", ")
                ));
            }
        }

        let chat = format!(
            "You are a command execution assistant working inside the user's project.\n\
             {constraints}\
             To manage the work plan, emit these operations inline in your reply:\n\
             add_todo(\"<title>\", \"<description>\") — queue a work item\n\
             list_todos() — show the current plan\n\
             mark_complete(<id>) / delete_todo(<id>) — adjust items\n\
             execute_next() / execute_all() / execute_todo(<id>) — run queued items\n\
             request_user_approval(\"<reason>\") — flag something that needs a human\n\
             For titles or descriptions containing quotes or newlines, use a block:\n\
             <TODO_SEPARATOR>\nTitle: <title>\nDescription: <description>\n<TODO_SEPARATOR>\n\
             Everything else in your reply is shown to the user verbatim."
        );

        let plan = format!(
            "You translate one request into one structured operation.\n\
             {constraints}\
             Reply with a single JSON object and nothing else. For a file write:\n\
             {{\"command\": \"write\", \"path\": \"<relative path>\", \"content\": \"<file content>\", \"request_execution\": false}}\n\
             For a shell command:\n\
             {{\"command\": \"shell\", \"path\": \"\", \"content\": \"<command string>\", \"request_execution\": true}}\n\
             Do not wrap the object in markdown fences."
        );

        Self { chat, plan }
    }
}

pub struct ModelClient {
    adapter: Arc<dyn ProviderAdapter>,
    model: String,
    http: reqwest::Client,
    instructions: SystemInstructions,
}

impl ModelClient {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        model: Option<String>,
        policy: &PolicyDocument,
    ) -> Self {
        let model = model.unwrap_or_else(|| adapter.default_model().to_string());
        Self {
            adapter,
            model,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            instructions: SystemInstructions::from_policy(policy),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.adapter.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn instructions(&self) -> &SystemInstructions {
        &self.instructions
    }

    /// Switch adapters mid-session. The conversation history is owned by
    /// the caller and survives the switch untouched.
    pub fn set_provider(&mut self, name: &str, model: Option<String>) -> Result<()> {
        let adapter = adapter_for(name)?;
        self.model = model.unwrap_or_else(|| adapter.default_model().to_string());
        self.adapter = adapter;
        Ok(())
    }

    /// Ask the model for a structured plan.
    pub async fn plan(&self, user_text: &str) -> Result<WriteFileCommand> {
        let payload =
            self.adapter
                .build_single_turn_payload(&self.instructions.plan, user_text, &self.model);
        let body = self.post(payload).await?;
        self.adapter.parse_plan(&body)
    }

    /// One-shot chat turn without history.
    pub async fn chat(&self, user_text: &str) -> Result<String> {
        let payload =
            self.adapter
                .build_single_turn_payload(&self.instructions.chat, user_text, &self.model);
        let body = self.post(payload).await?;
        self.adapter.parse_chat(&body)
    }

    /// Chat turn carrying the conversation history.
    pub async fn chat_with_history(&self, history: &[Message]) -> Result<String> {
        let payload =
            self.adapter
                .build_conversation_payload(&self.instructions.chat, history, &self.model);
        let body = self.post(payload).await?;
        self.adapter.parse_chat(&body)
    }

    async fn post(&self, payload: serde_json::Value) -> Result<String> {
        let key = api_key(self.adapter.as_ref())?;
        let url = self.adapter.full_url(&key, &self.model);
        let mut request = self.http.post(&url).json(&payload);
        for (name, value) in self.adapter.headers(&key) {
            request = request.header(name, value);
        }
        tracing::debug!("POST {} ({} model {})", url, self.adapter.name(), self.model);

        let response = request
            .send()
            .await
            .map_err(|e| MagusErr::transport(self.adapter.name(), e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MagusErr::transport(self.adapter.name(), e))?;
        if !status.is_success() {
            return Err(MagusErr::transport(
                self.adapter.name(),
                format!("status {status}: {body}"),
            ));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::providers::OpenAiAdapter;
    use pretty_assertions::assert_eq;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn policy() -> PolicyDocument {
        PolicyDocument::default_document()
    }

    #[test]
    fn instructions_enumerate_policy_constraints() {
        let instructions = SystemInstructions::from_policy(&policy());
        assert!(instructions.chat.contains("src/"));
        assert!(instructions.chat.contains("rm -rf /"));
        assert!(instructions.chat.contains("add_todo"));
        assert!(instructions.plan.contains("\"command\": \"write\""));
    }

    #[test]
    fn default_model_comes_from_the_adapter() {
        let client = ModelClient::new(Arc::new(OpenAiAdapter::new()), None, &policy());
        assert_eq!(client.model(), "gpt-4o");
        assert_eq!(client.provider_name(), "openai");
    }

    #[test]
    fn set_provider_accepts_friendly_names() {
        let mut client = ModelClient::new(Arc::new(OpenAiAdapter::new()), None, &policy());
        client.set_provider("claude", None).unwrap();
        assert_eq!(client.provider_name(), "anthropic");
        assert!(client.set_provider("copilot", None).is_err());
    }

    #[tokio::test]
    async fn chat_round_trips_through_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "hello back" } }]
            })))
            .mount(&server)
            .await;

        // Test-process environment; no concurrent writer for this variable.
        unsafe { std::env::set_var("OPENAI_API_KEY", "test-key") };
        let adapter = Arc::new(OpenAiAdapter::with_base_url(server.uri()));
        let client = ModelClient::new(adapter, None, &policy());
        let reply = client.chat("hi").await.unwrap();
        assert_eq!(reply, "hello back");
    }

    #[tokio::test]
    async fn http_failure_is_a_transport_error_naming_the_adapter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        unsafe { std::env::set_var("OPENAI_API_KEY", "test-key") };
        let adapter = Arc::new(OpenAiAdapter::with_base_url(server.uri()));
        let client = ModelClient::new(adapter, None, &policy());
        let err = client.chat("hi").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("openai"));
        assert!(message.contains("500"));
    }
}
