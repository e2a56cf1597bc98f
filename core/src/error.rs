use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MagusErr>;

#[derive(Error, Debug)]
pub enum MagusErr {
    /// Fatal at process start: malformed policy document, unknown provider
    /// name, or a missing environment variable. Surfaced as exit status 2
    /// when the CLI is the caller.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    EnvVar(EnvVarError),

    /// An operation was refused by the policy engine. The coordinator
    /// recovers locally: the current item is failed with the reason and the
    /// batch stops.
    #[error("Policy Denied: {0}")]
    PolicyDenied(String),

    /// The model returned a payload that does not satisfy the plan contract.
    #[error("{provider} returned an unparseable response: {detail}")]
    Parse { provider: String, detail: String },

    /// The model call failed at the HTTP layer. The current user turn is
    /// abandoned.
    #[error("{provider} request failed: {detail}")]
    Transport { provider: String, detail: String },

    /// API contract violation, e.g. an empty todo title. Raised to the
    /// caller; never silently ignored.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl MagusErr {
    pub fn parse(provider: &str, detail: impl std::fmt::Display) -> Self {
        MagusErr::Parse {
            provider: provider.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn transport(provider: &str, detail: impl std::fmt::Display) -> Self {
        MagusErr::Transport {
            provider: provider.to_string(),
            detail: detail.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct EnvVarError {
    /// Name of the environment variable that is missing.
    pub var: String,

    /// Optional instructions to help the user get a valid value for the
    /// variable and set it.
    pub instructions: Option<String>,
}

impl std::fmt::Display for EnvVarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Missing environment variable: `{}`.", self.var)?;
        if let Some(instructions) = &self.instructions {
            write!(f, " {instructions}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_error_includes_instructions() {
        let err = EnvVarError {
            var: "GEMINI_API_KEY".to_string(),
            instructions: Some("Create an API key at https://aistudio.google.com/".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Missing environment variable: `GEMINI_API_KEY`. Create an API key at https://aistudio.google.com/"
        );
    }

    #[test]
    fn policy_denied_message_carries_prefix() {
        let err = MagusErr::PolicyDenied("etc/passwd is outside allowed directories".to_string());
        assert!(err.to_string().starts_with("Policy Denied"));
    }
}
