//! Protocol between the coordinator and its front-ends.
//!
//! Uses a SQ (Submission Queue) / EQ (Event Queue) pair: front-ends send
//! [`Submission`]s and receive [`Event`]s. Messages are UTF-8 JSON; framing
//! on the local transport is supplied by the transport layer.

use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;

use crate::conversation::Message;
use crate::conversation::SessionSummary;
use crate::todo::TodoItem;

/// Submission Queue Entry - requests from the user.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Submission {
    /// Unique id for this Submission to correlate with Events.
    pub id: String,
    pub op: Op,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Op {
    /// A user turn: chat in chat mode, a structured plan otherwise.
    UserInput { text: String },

    /// Drain (part of) the todo queue through the executors.
    ExecuteTodos { selection: TodoSelection },

    /// Reply to an [`EventMsg::ApprovalRequest`].
    Approval {
        /// The id of the submission being approved.
        id: String,
        decision: ReviewDecision,
    },

    Pause,
    Resume,
    Stop,
    Cancel,

    /// Switch adapters mid-session; history is preserved.
    SetProvider { name: String },

    /// Toggle chat mode.
    SetChatMode { enabled: bool },

    TodoQuery,
    HistoryQuery,
    StatusQuery,
    SessionCommand { command: SessionOp },

    /// Flush state and stop the submission loop.
    Shutdown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOp {
    List,
    New,
    Load { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TodoSelection {
    All,
    Next,
    Until { stop_id: u64 },
    Range { start_id: u64, end_id: u64 },
    Single { id: u64 },
}

/// User's decision in response to a confirmation prompt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Approve this operation once.
    Approved,

    /// Approve and set the always-approve flag for the rest of the session.
    ApprovedAlways,

    #[default]
    Denied,
}

/// The coordinator's control-flow state for batch execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecState {
    #[default]
    Stopped,
    Running,
    Paused,
    Cancelled,
}

impl std::fmt::Display for ExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecState::Stopped => "stopped",
            ExecState::Running => "running",
            ExecState::Paused => "paused",
            ExecState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Event Queue Entry - events from the coordinator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Event {
    /// Submission `id` this event is correlated with.
    pub id: String,
    pub msg: EventMsg,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventMsg {
    SessionConfigured {
        provider: String,
        model: String,
        session_id: String,
    },

    /// Assistant text after interpretation.
    AgentMessage { message: String },

    /// Hint line, e.g. the execution commands available for pending todos.
    Suggestion { message: String },

    /// One final status line per failure path.
    Error { message: String },

    /// The model (or interpreter) asked for a human decision; informational
    /// only, nothing is halted.
    PauseNotice { reason: String },

    /// A confirmation prompt. The front-end answers with [`Op::Approval`]
    /// carrying the same id.
    ApprovalRequest { preview: String },

    ExecCommandBegin {
        command: String,
        cwd: PathBuf,
    },
    ExecCommandEnd {
        stdout: String,
        stderr: String,
        exit_code: i32,
        cwd_after: PathBuf,
        duration_ms: u64,
    },

    FileWriteBegin {
        path: String,
        preview: String,
    },
    FileWriteEnd {
        message: String,
        success: bool,
    },

    ItemStarted { id: u64, title: String },
    ItemCompleted { id: u64, title: String },
    ItemFailed { id: u64, title: String, reason: String },

    TaskStarted,
    TaskComplete,

    ControlState {
        state: ExecState,
        note: String,
    },

    TodoList { items: Vec<TodoItem> },
    History {
        session_id: String,
        messages: Vec<Message>,
    },
    Sessions { sessions: Vec<SessionSummary> },
    SessionSwitched { session_id: String },
    ProviderSwitched { provider: String, model: String },

    StatusReport {
        provider: String,
        model: String,
        session_id: String,
        chat_mode: bool,
        always_approve: bool,
        state: ExecState,
        pending_todos: usize,
    },

    BackgroundEvent { message: String },

    ShutdownComplete,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ops_round_trip_as_tagged_json() {
        let op = Op::ExecuteTodos {
            selection: TodoSelection::Range {
                start_id: 2,
                end_id: 5,
            },
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"execute_todos\""));
        let back: Op = serde_json::from_str(&json).unwrap();
        match back {
            Op::ExecuteTodos {
                selection: TodoSelection::Range { start_id, end_id },
            } => assert_eq!((start_id, end_id), (2, 5)),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn exec_state_displays_lowercase() {
        assert_eq!(ExecState::Paused.to_string(), "paused");
        assert_eq!(ExecState::default(), ExecState::Stopped);
    }

    #[test]
    fn review_decision_defaults_to_denied() {
        assert_eq!(ReviewDecision::default(), ReviewDecision::Denied);
    }
}
