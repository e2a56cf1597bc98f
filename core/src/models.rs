//! Shared data types exchanged between the model client, the executors and
//! the coordinator.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Structured plan returned by the model in plan mode.
///
/// The wire shape is a bare JSON object: `{"command": "write", "path":
/// "src/a.txt", "content": "hi", "request_execution": false}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WriteFileCommand {
    /// Operation token; currently only `"write"` is recognized.
    pub command: String,
    /// Target path, relative to the session working directory.
    pub path: String,
    /// Full file content to write.
    pub content: String,
    /// Whether the model wants the plan applied without further prompting.
    /// The coordinator still routes it through policy and confirmation.
    #[serde(default)]
    pub request_execution: bool,
}

/// A validated operation ready for routing to an executor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    WriteFile {
        path: String,
        content: String,
        request_execution: bool,
    },
    ShellCommand {
        command: String,
        working_dir: Option<PathBuf>,
        description: String,
        request_execution: bool,
    },
}

impl Operation {
    /// Human-readable one-line summary. This is the only conversion out of
    /// the shell-command variant.
    pub fn summary(&self) -> String {
        match self {
            Operation::WriteFile { path, content, .. } => {
                format!("write {} ({} bytes)", path, content.len())
            }
            Operation::ShellCommand { description, .. } => description.clone(),
        }
    }
}

impl WriteFileCommand {
    /// Lift the wire-level plan into a typed operation. `None` when the
    /// command token is not recognized.
    pub fn to_operation(&self) -> Option<Operation> {
        match self.command.as_str() {
            "write" => Some(Operation::WriteFile {
                path: self.path.clone(),
                content: self.content.clone(),
                request_execution: self.request_execution,
            }),
            "shell" => Some(Operation::ShellCommand {
                command: self.content.clone(),
                working_dir: None,
                description: format!("run: {}", self.content.trim()),
                request_execution: self.request_execution,
            }),
            _ => None,
        }
    }
}

/// Outcome of one shell command invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Working directory observed after the command ran; `cd` in the command
    /// string persists into the next invocation.
    pub cwd_after: PathBuf,
    pub duration: Duration,
}

/// Captured by every executor invocation, file writes included.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub cwd_before: PathBuf,
    pub cwd_after: PathBuf,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn write_file_command_round_trips_all_four_fields() {
        let cmd = WriteFileCommand {
            command: "write".to_string(),
            path: "src/a.txt".to_string(),
            content: "hi".to_string(),
            request_execution: true,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: WriteFileCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn request_execution_defaults_to_false() {
        let cmd: WriteFileCommand =
            serde_json::from_str(r#"{"command":"write","path":"a","content":"b"}"#).unwrap();
        assert!(!cmd.request_execution);
    }

    #[test]
    fn shell_command_summary_is_its_description() {
        let op = Operation::ShellCommand {
            command: "make test".to_string(),
            working_dir: None,
            description: "run the test suite".to_string(),
            request_execution: false,
        };
        assert_eq!(op.summary(), "run the test suite");
    }
}
