// Poisoned mutex should fail the program.
#![allow(clippy::unwrap_used)]

//! The coordinator binds policy, stores, model client and executors, owns
//! the execution state machine, and implements routing, confirmation and
//! control (pause/resume/stop/cancel).
//!
//! The high-level interface is [`Magus`], a queue pair: send submissions,
//! receive events. One user turn runs at a time; control submissions are
//! observed at well-defined check points (between items and inside the
//! pause wait).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_channel::Receiver;
use async_channel::Sender;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::client::ModelClient;
use crate::config::Config;
use crate::config::ensure_state_dir;
use crate::conversation::ConversationStore;
use crate::conversation::Role;
use crate::error::MagusErr;
use crate::error::Result;
use crate::exec::CommandRunner;
use crate::file_writer::FileWriter;
use crate::interpreter::ControlRequest;
use crate::interpreter::interpret;
use crate::models::Operation;
use crate::models::WriteFileCommand;
use crate::policy::CrudOp;
use crate::policy::FILE_TOOL;
use crate::policy::PolicyEngine;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::ExecState;
use crate::protocol::Op;
use crate::protocol::ReviewDecision;
use crate::protocol::SessionOp;
use crate::protocol::Submission;
use crate::protocol::TodoSelection;
use crate::providers::adapter_for;
use crate::providers::detect_provider;
use crate::todo::TodoItem;
use crate::todo::TodoStatus;
use crate::todo::TodoStore;

/// How long the pause wait sleeps between flag checks.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Token budget applied to the history sent with each chat turn.
const HISTORY_TOKEN_BUDGET: usize = 64_000;

/// The high-level interface to the system. It operates as a queue pair
/// where you send submissions and receive events.
pub struct Magus {
    next_id: AtomicU64,
    tx_sub: Sender<Submission>,
    rx_event: Receiver<Event>,
}

impl Magus {
    /// Spawn the coordinator and emit the initial `SessionConfigured` event.
    pub async fn spawn(config: Config) -> Result<Magus> {
        let (tx_sub, rx_sub) = async_channel::bounded(64);
        let (tx_event, rx_event) = async_channel::bounded(64);

        ensure_state_dir(&config)?;
        let policy = PolicyEngine::load_or_init(&config.policy_path(), config.cwd.clone())?;

        let adapter = match &config.provider {
            Some(name) => adapter_for(name)?,
            None => detect_provider()?,
        };
        let client = ModelClient::new(adapter, config.model.clone(), &policy.document());
        let conversation = ConversationStore::new(config.conversations_dir());

        let coordinator = Arc::new(Coordinator::new(
            tx_event,
            config,
            policy,
            client,
            conversation,
        ));

        coordinator
            .send_event(Event {
                id: "session".to_string(),
                msg: coordinator.session_configured_msg(),
            })
            .await;

        tokio::spawn(submission_loop(coordinator, rx_sub));

        Ok(Magus {
            next_id: AtomicU64::new(0),
            tx_sub,
            rx_event,
        })
    }

    /// Submit `op` wrapped in a [`Submission`] with a unique id.
    pub async fn submit(&self, op: Op) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.tx_sub
            .send(Submission { id: id.clone(), op })
            .await
            .map_err(|_| MagusErr::Configuration("coordinator is gone".to_string()))?;
        Ok(id)
    }

    pub async fn next_event(&self) -> Result<Event> {
        self.rx_event
            .recv()
            .await
            .map_err(|_| MagusErr::Configuration("coordinator is gone".to_string()))
    }
}

/// Control flags shared between the submission loop and a running batch.
/// These are the only shared mutable state touched from both sides.
#[derive(Default)]
struct ControlFlags {
    should_stop: AtomicBool,
    should_pause: AtomicBool,
}

struct Coordinator {
    tx_event: Sender<Event>,
    config: Config,
    policy: PolicyEngine,
    client: tokio::sync::Mutex<ModelClient>,
    todos: Mutex<TodoStore>,
    conversation: Mutex<ConversationStore>,
    file_writer: FileWriter,
    runner: tokio::sync::Mutex<CommandRunner>,
    flags: ControlFlags,
    state: Mutex<ExecState>,
    chat_mode: AtomicBool,
    always_approve: AtomicBool,
    pending_approvals: Mutex<HashMap<String, oneshot::Sender<ReviewDecision>>>,
}

impl Coordinator {
    fn new(
        tx_event: Sender<Event>,
        config: Config,
        policy: PolicyEngine,
        client: ModelClient,
        conversation: ConversationStore,
    ) -> Self {
        let chat_mode = config.chat_mode;
        Self {
            tx_event,
            file_writer: FileWriter::new(config.cwd.clone()),
            runner: tokio::sync::Mutex::new(CommandRunner::new(config.cwd.clone())),
            config,
            policy,
            client: tokio::sync::Mutex::new(client),
            todos: Mutex::new(TodoStore::new()),
            conversation: Mutex::new(conversation),
            flags: ControlFlags::default(),
            state: Mutex::new(ExecState::Stopped),
            chat_mode: AtomicBool::new(chat_mode),
            always_approve: AtomicBool::new(false),
            pending_approvals: Mutex::new(HashMap::new()),
        }
    }

    async fn send_event(&self, event: Event) {
        if let Err(e) = self.tx_event.send(event).await {
            error!("failed to send event: {e}");
        }
    }

    async fn emit(&self, sub_id: &str, msg: EventMsg) {
        self.send_event(Event {
            id: sub_id.to_string(),
            msg,
        })
        .await;
    }

    fn session_configured_msg(&self) -> EventMsg {
        let (provider, model) = {
            let client = self.client.try_lock();
            match client {
                Ok(client) => (client.provider_name().to_string(), client.model().to_string()),
                Err(_) => ("unknown".to_string(), "unknown".to_string()),
            }
        };
        EventMsg::SessionConfigured {
            provider,
            model,
            session_id: self.conversation.lock().unwrap().session_id().to_string(),
        }
    }

    fn state(&self) -> ExecState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ExecState) {
        *self.state.lock().unwrap() = state;
    }

    // ------------------------------------------------------------------
    // Control state machine
    // ------------------------------------------------------------------

    /// Apply a control event to the execution state machine. Returns the
    /// resulting state and a note for the display layer.
    fn apply_control(&self, op: &Op) -> (ExecState, String) {
        let mut state = self.state.lock().unwrap();
        let (next, note) = next_control_state(*state, op);
        match op {
            Op::Pause if next == ExecState::Paused => {
                self.flags.should_pause.store(true, Ordering::SeqCst);
            }
            Op::Resume if *state == ExecState::Paused && next == ExecState::Running => {
                self.flags.should_pause.store(false, Ordering::SeqCst);
            }
            Op::Stop | Op::Cancel if next != *state => {
                self.flags.should_stop.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
        *state = next;
        (next, note)
    }

    // ------------------------------------------------------------------
    // User turns
    // ------------------------------------------------------------------

    async fn run_user_input(&self, sub_id: &str, text: &str) {
        self.emit(sub_id, EventMsg::TaskStarted).await;
        if self.chat_mode.load(Ordering::SeqCst) {
            self.run_chat_turn(sub_id, text).await;
        } else {
            let _ = self.run_plan_turn(sub_id, text, true).await;
        }
        self.emit(sub_id, EventMsg::TaskComplete).await;
    }

    async fn run_chat_turn(&self, sub_id: &str, text: &str) {
        {
            let mut conversation = self.conversation.lock().unwrap();
            conversation.append(Role::User, text, None);
        }

        let (reply, provider) = {
            let client = self.client.lock().await;
            let history = self
                .conversation
                .lock()
                .unwrap()
                .budgeted_history(HISTORY_TOKEN_BUDGET);
            match client.chat_with_history(&history).await {
                Ok(reply) => (reply, client.provider_name()),
                Err(e) => {
                    // The current user turn is abandoned.
                    self.emit(sub_id, EventMsg::Error { message: format!("Error: {e}") })
                        .await;
                    return;
                }
            }
        };

        let outcome = {
            let mut todos = self.todos.lock().unwrap();
            interpret(&reply, &mut todos)
        };

        {
            let mut conversation = self.conversation.lock().unwrap();
            conversation.append(Role::Assistant, &outcome.text, Some(provider));
        }
        self.emit(
            sub_id,
            EventMsg::AgentMessage {
                message: outcome.text.clone(),
            },
        )
        .await;

        let mut executed = false;
        for control in &outcome.controls {
            match control {
                ControlRequest::ExecuteNext => {
                    executed = true;
                    self.run_execution(sub_id, TodoSelection::Next).await;
                }
                ControlRequest::ExecuteAll => {
                    executed = true;
                    self.run_execution(sub_id, TodoSelection::All).await;
                }
                ControlRequest::ExecuteTodo(id) => {
                    executed = true;
                    self.run_execution(sub_id, TodoSelection::Single { id: *id })
                        .await;
                }
                ControlRequest::ApprovalRequested(reason) => {
                    self.emit(
                        sub_id,
                        EventMsg::PauseNotice {
                            reason: reason.clone(),
                        },
                    )
                    .await;
                }
            }
        }

        let pending = self.todos.lock().unwrap().pending_count();
        if outcome.mutated && !executed && pending > 0 {
            self.emit(
                sub_id,
                EventMsg::Suggestion {
                    message: format!(
                        "{pending} todo(s) pending — run /do next, /do all, /do until <id>, /do <start>-<end> or /do <id>"
                    ),
                },
            )
            .await;
        }
    }

    /// Plan mode: one structured operation, previewed and confirmed.
    /// Returns whether the operation was applied.
    async fn run_plan_turn(&self, sub_id: &str, text: &str, confirm: bool) -> bool {
        let plan = {
            let client = self.client.lock().await;
            match client.plan(text).await {
                Ok(plan) => plan,
                // Parse failures carry the raw text; nothing gets executed.
                Err(e) => {
                    self.emit(sub_id, EventMsg::Error { message: format!("Error: {e}") })
                        .await;
                    return false;
                }
            }
        };
        self.apply_plan(sub_id, &plan, confirm).await
    }

    async fn apply_plan(&self, sub_id: &str, plan: &WriteFileCommand, confirm: bool) -> bool {
        match plan.to_operation() {
            Some(Operation::WriteFile { path, content, .. }) => {
                self.apply_write_operation(sub_id, &path, &content, confirm)
                    .await
            }
            Some(op @ Operation::ShellCommand { .. }) => {
                let summary = op.summary();
                let Operation::ShellCommand { command, .. } = op else {
                    return false;
                };
                self.apply_shell_operation(sub_id, &command, &summary, confirm)
                    .await
            }
            None => {
                self.emit(
                    sub_id,
                    EventMsg::Error {
                        message: format!(
                            "Dry run failed: unrecognized command token {:?}",
                            plan.command
                        ),
                    },
                )
                .await;
                false
            }
        }
    }

    async fn apply_write_operation(
        &self,
        sub_id: &str,
        path: &str,
        content: &str,
        confirm: bool,
    ) -> bool {
        if path.trim().is_empty() {
            self.emit(
                sub_id,
                EventMsg::Error {
                    message: "Dry run failed: plan has an empty path".to_string(),
                },
            )
            .await;
            return false;
        }

        let preview = self.file_writer.dry_run(path, content);
        let op = if preview.creates {
            CrudOp::Create
        } else {
            CrudOp::Update
        };

        if !self.policy.allowed(FILE_TOOL, op, path) {
            self.emit(
                sub_id,
                EventMsg::Error {
                    message: format!(
                        "Policy Denied: {path} is not allowed for file {}",
                        op.as_str()
                    ),
                },
            )
            .await;
            return false;
        }
        if !self.policy.file_size_allowed(content.len() as u64) {
            self.emit(
                sub_id,
                EventMsg::Error {
                    message: format!(
                        "Policy Denied: {path} exceeds the configured file size limit"
                    ),
                },
            )
            .await;
            return false;
        }

        self.emit(
            sub_id,
            EventMsg::FileWriteBegin {
                path: path.to_string(),
                preview: preview.description.clone(),
            },
        )
        .await;

        if confirm
            && !self.always_approve.load(Ordering::SeqCst)
            && self.policy.confirmation_required(FILE_TOOL, op)
            && !self.await_approval(sub_id, &preview.description).await
        {
            self.emit(
                sub_id,
                EventMsg::Error {
                    message: "Operation cancelled".to_string(),
                },
            )
            .await;
            return false;
        }

        let auto_backup = self.policy.document().global.auto_backup;
        let report = self.file_writer.apply(path, content, auto_backup);
        self.emit(
            sub_id,
            EventMsg::FileWriteEnd {
                message: report.message.clone(),
                success: report.success,
            },
        )
        .await;
        if !report.success {
            self.emit(
                sub_id,
                EventMsg::Error {
                    message: format!("Error: {}", report.context.stderr),
                },
            )
            .await;
        }
        report.success
    }

    async fn apply_shell_operation(
        &self,
        sub_id: &str,
        command: &str,
        summary: &str,
        confirm: bool,
    ) -> bool {
        let command = command.trim();
        if command.is_empty() {
            self.emit(
                sub_id,
                EventMsg::Error {
                    message: "Dry run failed: plan has an empty command".to_string(),
                },
            )
            .await;
            return false;
        }

        let (allowed, reason) = self.policy.command_allowed(command);
        if !allowed {
            self.emit(
                sub_id,
                EventMsg::Error {
                    message: format!("Policy Denied: {reason}"),
                },
            )
            .await;
            return false;
        }

        if confirm
            && !self.always_approve.load(Ordering::SeqCst)
            && !self.await_approval(sub_id, summary).await
        {
            self.emit(
                sub_id,
                EventMsg::Error {
                    message: "Operation cancelled".to_string(),
                },
            )
            .await;
            return false;
        }

        self.run_command(sub_id, command).await
    }

    /// Run one shell command, emitting begin/end events. Returns success.
    async fn run_command(&self, sub_id: &str, command: &str) -> bool {
        let mut runner = self.runner.lock().await;
        self.emit(
            sub_id,
            EventMsg::ExecCommandBegin {
                command: command.to_string(),
                cwd: runner.cwd().to_path_buf(),
            },
        )
        .await;
        match runner
            .execute(command, None, Some(self.config.command_timeout_ms))
            .await
        {
            Ok(result) => {
                let success = result.exit_code == 0;
                self.emit(
                    sub_id,
                    EventMsg::ExecCommandEnd {
                        stdout: result.stdout,
                        stderr: result.stderr,
                        exit_code: result.exit_code,
                        cwd_after: result.cwd_after,
                        duration_ms: result.duration.as_millis() as u64,
                    },
                )
                .await;
                success
            }
            Err(e) => {
                self.emit(sub_id, EventMsg::Error { message: format!("{e}") })
                    .await;
                false
            }
        }
    }

    /// Block until the front-end answers the approval prompt. `true` means
    /// the operation may proceed. There is no timeout; the prompt blocks
    /// indefinitely.
    async fn await_approval(&self, sub_id: &str, preview: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        self.pending_approvals
            .lock()
            .unwrap()
            .insert(sub_id.to_string(), tx);
        self.emit(
            sub_id,
            EventMsg::ApprovalRequest {
                preview: preview.to_string(),
            },
        )
        .await;
        match rx.await {
            Ok(ReviewDecision::Approved) => true,
            Ok(ReviewDecision::ApprovedAlways) => {
                self.always_approve.store(true, Ordering::SeqCst);
                true
            }
            Ok(ReviewDecision::Denied) => false,
            Err(_) => {
                warn!("approval channel dropped; treating as denied");
                false
            }
        }
    }

    fn resolve_approval(&self, id: &str, decision: ReviewDecision) {
        let sender = self.pending_approvals.lock().unwrap().remove(id);
        match sender {
            Some(tx) => {
                let _ = tx.send(decision);
            }
            None => debug!("approval {id} has no pending prompt"),
        }
    }

    // ------------------------------------------------------------------
    // Todo batch execution
    // ------------------------------------------------------------------

    async fn run_execution(&self, sub_id: &str, selection: TodoSelection) {
        let selected: std::result::Result<Vec<TodoItem>, String> = {
            let todos = self.todos.lock().unwrap();
            match selection {
                TodoSelection::All => Ok(todos.execution_queue()),
                TodoSelection::Next => Ok(todos.next_pending().into_iter().collect()),
                TodoSelection::Until { stop_id } => Ok(todos.until(stop_id)),
                TodoSelection::Range { start_id, end_id } => Ok(todos.range(start_id, end_id)),
                TodoSelection::Single { id } => match todos.get(id) {
                    Some(item) if item.status == TodoStatus::Pending => Ok(vec![item]),
                    Some(item) => Err(format!(
                        "Error: todo #{id} is {:?}, not pending",
                        item.status
                    )),
                    None => Err(format!("Error: todo #{id} not found")),
                },
            }
        };
        let items = match selected {
            Ok(items) => items,
            Err(message) => {
                self.emit(sub_id, EventMsg::Error { message }).await;
                return;
            }
        };

        if items.is_empty() {
            self.emit(
                sub_id,
                EventMsg::BackgroundEvent {
                    message: "nothing to execute".to_string(),
                },
            )
            .await;
            return;
        }

        self.flags.should_stop.store(false, Ordering::SeqCst);
        self.flags.should_pause.store(false, Ordering::SeqCst);
        self.set_state(ExecState::Running);
        self.emit(
            sub_id,
            EventMsg::ControlState {
                state: ExecState::Running,
                note: format!("executing {} item(s)", items.len()),
            },
        )
        .await;

        let mut halted = false;
        for item in items {
            if self.flags.should_stop.load(Ordering::SeqCst) {
                halted = true;
                break;
            }
            // Pause wait: bounded sleeps, re-evaluated until resumed or
            // stopped.
            while self.flags.should_pause.load(Ordering::SeqCst)
                && !self.flags.should_stop.load(Ordering::SeqCst)
            {
                tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
            }
            if self.flags.should_stop.load(Ordering::SeqCst) {
                halted = true;
                break;
            }

            {
                let mut todos = self.todos.lock().unwrap();
                todos.set_status(item.id, TodoStatus::InProgress);
            }
            self.emit(
                sub_id,
                EventMsg::ItemStarted {
                    id: item.id,
                    title: item.title.clone(),
                },
            )
            .await;

            match self.execute_item(sub_id, &item).await {
                Ok(()) => {
                    {
                        let mut todos = self.todos.lock().unwrap();
                        todos.set_status(item.id, TodoStatus::Completed);
                    }
                    self.emit(
                        sub_id,
                        EventMsg::ItemCompleted {
                            id: item.id,
                            title: item.title.clone(),
                        },
                    )
                    .await;
                }
                Err(reason) => {
                    // The item stays in-progress so the failure is visible;
                    // the rest of the batch keeps its pending status.
                    self.emit(
                        sub_id,
                        EventMsg::ItemFailed {
                            id: item.id,
                            title: item.title.clone(),
                            reason: reason.clone(),
                        },
                    )
                    .await;
                    self.emit(sub_id, EventMsg::Error { message: reason }).await;
                    halted = true;
                    break;
                }
            }
        }

        let final_state = self.state();
        let note = match final_state {
            ExecState::Cancelled => "batch cancelled".to_string(),
            _ if halted && self.flags.should_stop.load(Ordering::SeqCst) => {
                "batch stopped".to_string()
            }
            _ if halted => "batch halted on failure".to_string(),
            _ => "batch complete".to_string(),
        };
        if final_state != ExecState::Cancelled {
            self.set_state(ExecState::Stopped);
        }
        self.emit(
            sub_id,
            EventMsg::ControlState {
                state: self.state(),
                note,
            },
        )
        .await;
    }

    /// Route one todo item to the matching executor. `Err` carries the
    /// human-readable failure reason.
    async fn execute_item(&self, sub_id: &str, item: &TodoItem) -> std::result::Result<(), String> {
        let text = item_text(item);
        if is_command_item(&text) {
            let Some(command) = extract_command(&text) else {
                return Err(format!(
                    "Error: could not extract a command from todo #{}",
                    item.id
                ));
            };
            let (allowed, reason) = self.policy.command_allowed(&command);
            if !allowed {
                return Err(format!("Policy Denied: {reason}"));
            }
            let mut runner = self.runner.lock().await;
            self.emit(
                sub_id,
                EventMsg::ExecCommandBegin {
                    command: command.clone(),
                    cwd: runner.cwd().to_path_buf(),
                },
            )
            .await;
            match runner
                .execute(&command, None, Some(self.config.command_timeout_ms))
                .await
            {
                Ok(result) => {
                    let success = result.exit_code == 0;
                    let exit_code = result.exit_code;
                    self.emit(
                        sub_id,
                        EventMsg::ExecCommandEnd {
                            stdout: result.stdout,
                            stderr: result.stderr,
                            exit_code: result.exit_code,
                            cwd_after: result.cwd_after,
                            duration_ms: result.duration.as_millis() as u64,
                        },
                    )
                    .await;
                    if success {
                        Ok(())
                    } else {
                        Err(format!("Error: command exited with status {exit_code}"))
                    }
                }
                Err(e) => Err(e.to_string()),
            }
        } else {
            // File operation: plan it through the model with chat mode
            // temporarily cleared, then apply without prompting (the batch
            // was the confirmation).
            let was_chat = self.chat_mode.swap(false, Ordering::SeqCst);
            let applied = self.run_plan_turn(sub_id, &text, false).await;
            self.chat_mode.store(was_chat, Ordering::SeqCst);
            if applied {
                Ok(())
            } else {
                Err(format!("Error: todo #{} failed during file operation", item.id))
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries and session plumbing
    // ------------------------------------------------------------------

    async fn report_status(&self, sub_id: &str) {
        let (provider, model) = {
            let client = self.client.lock().await;
            (client.provider_name().to_string(), client.model().to_string())
        };
        let msg = EventMsg::StatusReport {
            provider,
            model,
            session_id: self.conversation.lock().unwrap().session_id().to_string(),
            chat_mode: self.chat_mode.load(Ordering::SeqCst),
            always_approve: self.always_approve.load(Ordering::SeqCst),
            state: self.state(),
            pending_todos: self.todos.lock().unwrap().pending_count(),
        };
        self.emit(sub_id, msg).await;
    }

    async fn handle_session_command(&self, sub_id: &str, command: SessionOp) {
        match command {
            SessionOp::List => {
                let sessions = self.conversation.lock().unwrap().list_sessions();
                self.emit(sub_id, EventMsg::Sessions { sessions }).await;
            }
            SessionOp::New => {
                let result = self.conversation.lock().unwrap().start_session();
                match result {
                    Ok(session_id) => {
                        self.emit(sub_id, EventMsg::SessionSwitched { session_id })
                            .await;
                    }
                    Err(e) => {
                        self.emit(sub_id, EventMsg::Error { message: format!("Error: {e}") })
                            .await;
                    }
                }
            }
            SessionOp::Load { id } => {
                let result = self.conversation.lock().unwrap().load_session(&id);
                match result {
                    Ok(()) => {
                        self.emit(sub_id, EventMsg::SessionSwitched { session_id: id })
                            .await;
                    }
                    Err(e) => {
                        self.emit(sub_id, EventMsg::Error { message: format!("Error: {e}") })
                            .await;
                    }
                }
            }
        }
    }

    async fn set_provider(&self, sub_id: &str, name: &str) {
        let mut client = self.client.lock().await;
        match client.set_provider(name, None) {
            Ok(()) => {
                let msg = EventMsg::ProviderSwitched {
                    provider: client.provider_name().to_string(),
                    model: client.model().to_string(),
                };
                drop(client);
                self.emit(sub_id, msg).await;
            }
            Err(e) => {
                drop(client);
                self.emit(sub_id, EventMsg::Error { message: format!("Error: {e}") })
                    .await;
            }
        }
    }
}

async fn submission_loop(coordinator: Arc<Coordinator>, rx_sub: Receiver<Submission>) {
    while let Ok(Submission { id, op }) = rx_sub.recv().await {
        debug!("submission {id}: {op:?}");
        match op {
            Op::UserInput { text } => {
                let coordinator = Arc::clone(&coordinator);
                let sub_id = id.clone();
                tokio::spawn(async move {
                    coordinator.run_user_input(&sub_id, &text).await;
                });
            }
            Op::ExecuteTodos { selection } => {
                let coordinator = Arc::clone(&coordinator);
                let sub_id = id.clone();
                tokio::spawn(async move {
                    coordinator.emit(&sub_id, EventMsg::TaskStarted).await;
                    coordinator.run_execution(&sub_id, selection).await;
                    coordinator.emit(&sub_id, EventMsg::TaskComplete).await;
                });
            }
            Op::Approval { id: approval_id, decision } => {
                coordinator.resolve_approval(&approval_id, decision);
            }
            op @ (Op::Pause | Op::Resume | Op::Stop | Op::Cancel) => {
                let (state, note) = coordinator.apply_control(&op);
                coordinator
                    .emit(&id, EventMsg::ControlState { state, note })
                    .await;
            }
            Op::SetProvider { name } => coordinator.set_provider(&id, &name).await,
            Op::SetChatMode { enabled } => {
                coordinator.chat_mode.store(enabled, Ordering::SeqCst);
                coordinator
                    .emit(
                        &id,
                        EventMsg::BackgroundEvent {
                            message: format!(
                                "chat mode {}",
                                if enabled { "enabled" } else { "disabled" }
                            ),
                        },
                    )
                    .await;
            }
            Op::TodoQuery => {
                let items = coordinator.todos.lock().unwrap().list(true);
                coordinator.emit(&id, EventMsg::TodoList { items }).await;
            }
            Op::HistoryQuery => {
                let (session_id, messages) = {
                    let conversation = coordinator.conversation.lock().unwrap();
                    (conversation.session_id().to_string(), conversation.history())
                };
                coordinator
                    .emit(
                        &id,
                        EventMsg::History {
                            session_id,
                            messages,
                        },
                    )
                    .await;
            }
            Op::StatusQuery => coordinator.report_status(&id).await,
            Op::SessionCommand { command } => {
                coordinator.handle_session_command(&id, command).await;
            }
            Op::Shutdown => {
                let result = coordinator.conversation.lock().unwrap().save();
                if let Err(e) = result {
                    warn!("failed to flush session on shutdown: {e}");
                }
                coordinator.emit(&id, EventMsg::ShutdownComplete).await;
                break;
            }
        }
    }
}

/// Transition table for pause/resume/stop/cancel. States with no legal
/// transition report a diagnostic and stay put.
fn next_control_state(state: ExecState, op: &Op) -> (ExecState, String) {
    match (state, op) {
        (ExecState::Running, Op::Pause) => (ExecState::Paused, "paused".to_string()),
        (ExecState::Paused, Op::Resume) => (ExecState::Running, "resumed".to_string()),
        (ExecState::Running | ExecState::Paused, Op::Stop) => (
            ExecState::Stopped,
            "stopping after the current item".to_string(),
        ),
        (ExecState::Running | ExecState::Paused, Op::Cancel) => (
            ExecState::Cancelled,
            "cancelling after the current item".to_string(),
        ),
        (ExecState::Paused, Op::Pause) => (state, "already paused".to_string()),
        (ExecState::Running, Op::Resume) => (state, "not paused".to_string()),
        _ => (state, format!("no batch is running (state: {state})")),
    }
}

fn item_text(item: &TodoItem) -> String {
    if item.description.is_empty() {
        item.title.clone()
    } else {
        format!("{} {}", item.title, item.description)
    }
}

/// Imperative tokens that classify a todo item as a shell command.
const COMMAND_TOKENS: &[&str] = &[
    "run", "execute", "build", "compile", "make", "install", "test", "cd", "ls", "pwd", "git",
    "docker", "npm", "cargo", "python", "python3", "pip", "mkdir", "touch",
];

/// Base commands that make free text "already look like a command".
const KNOWN_COMMANDS: &[&str] = &[
    "ls", "pwd", "echo", "cat", "git", "make", "cargo", "python3", "python", "pip", "mkdir",
    "touch", "docker", "npm", "grep", "find", "head", "tail", "wc", "cd",
];

pub(crate) fn is_command_item(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| COMMAND_TOKENS.contains(&word))
}

/// Extract an executable command string from free text.
pub(crate) fn extract_command(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let lowered = trimmed.to_lowercase();

    // `python3 script.py` style invocations pass through verbatim.
    if let Some(pos) = lowered.find("python3 ") {
        let rest = &trimmed[pos..];
        let mut tokens = rest.split_whitespace();
        let interpreter = tokens.next()?;
        if let Some(script) = tokens.next()
            && script.ends_with(".py")
        {
            return Some(format!("{interpreter} {script}"));
        }
    }

    // Text following "run " or "execute " is taken as the command.
    for prefix in ["run ", "execute "] {
        if let Some(pos) = lowered.find(prefix) {
            let command = trimmed[pos + prefix.len()..].trim();
            if !command.is_empty() {
                return Some(command.to_string());
            }
        }
    }

    // Already looks like a command: first token is a known base command.
    if let Some(first) = shlex::split(trimmed).and_then(|tokens| tokens.first().cloned())
        && KNOWN_COMMANDS.contains(&first.as_str())
    {
        return Some(trimmed.to_string());
    }

    // Bare build/test intents map to make.
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if words.contains(&"test") {
        return Some("make test".to_string());
    }
    if words.contains(&"build") || words.contains(&"compile") {
        return Some("make".to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyDocument;
    use crate::providers::OpenAiAdapter;
    use pretty_assertions::assert_eq;

    struct Harness {
        _dir: tempfile::TempDir,
        coordinator: Arc<Coordinator>,
        rx_event: Receiver<Event>,
    }

    fn harness() -> Harness {
        harness_with_adapter(OpenAiAdapter::new())
    }

    fn harness_with_adapter(adapter: OpenAiAdapter) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().canonicalize().unwrap();
        let (tx_event, rx_event) = async_channel::unbounded();
        let document = PolicyDocument::default_document();
        let policy = PolicyEngine::new(document.clone(), cwd.clone());
        let client = ModelClient::new(Arc::new(adapter), None, &document);
        let conversation = ConversationStore::new(cwd.join(".magus/conversations"));
        let config = Config::new(cwd);
        let coordinator = Arc::new(Coordinator::new(
            tx_event,
            config,
            policy,
            client,
            conversation,
        ));
        Harness {
            _dir: dir,
            coordinator,
            rx_event,
        }
    }

    fn drain(rx: &Receiver<Event>) -> Vec<EventMsg> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.msg);
        }
        events
    }

    async fn wait_for_approval_request(rx: &Receiver<Event>) {
        loop {
            let event = rx.recv().await.unwrap();
            if matches!(event.msg, EventMsg::ApprovalRequest { .. }) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn write_confirmation_yes_applies_the_file() {
        let h = harness();
        let coordinator = Arc::clone(&h.coordinator);
        let task = tokio::spawn(async move {
            coordinator
                .apply_write_operation("1", "src/a.txt", "hi", true)
                .await
        });
        wait_for_approval_request(&h.rx_event).await;
        h.coordinator.resolve_approval("1", ReviewDecision::Approved);
        assert!(task.await.unwrap());

        let written =
            std::fs::read(h.coordinator.config.cwd.join("src/a.txt")).unwrap();
        assert_eq!(written, b"hi");

        let events = drain(&h.rx_event);
        assert!(events.iter().any(|msg| matches!(
            msg,
            EventMsg::FileWriteEnd { success: true, .. }
        )));
    }

    #[tokio::test]
    async fn write_confirmation_no_leaves_no_file() {
        let h = harness();
        let coordinator = Arc::clone(&h.coordinator);
        let task = tokio::spawn(async move {
            coordinator
                .apply_write_operation("1", "src/a.txt", "hi", true)
                .await
        });
        wait_for_approval_request(&h.rx_event).await;
        h.coordinator.resolve_approval("1", ReviewDecision::Denied);
        assert!(!task.await.unwrap());
        assert!(!h.coordinator.config.cwd.join("src/a.txt").exists());

        let events = drain(&h.rx_event);
        assert!(events.iter().any(|msg| matches!(
            msg,
            EventMsg::Error { message } if message == "Operation cancelled"
        )));
    }

    #[tokio::test]
    async fn approve_always_skips_the_second_prompt() {
        let h = harness();
        let coordinator = Arc::clone(&h.coordinator);
        let task = tokio::spawn(async move {
            coordinator
                .apply_write_operation("1", "src/a.txt", "hi", true)
                .await
        });
        wait_for_approval_request(&h.rx_event).await;
        h.coordinator
            .resolve_approval("1", ReviewDecision::ApprovedAlways);
        assert!(task.await.unwrap());

        // Second write goes straight through.
        assert!(
            h.coordinator
                .apply_write_operation("2", "src/b.txt", "again", true)
                .await
        );
        assert!(h.coordinator.config.cwd.join("src/b.txt").exists());
        let events = drain(&h.rx_event);
        let prompts = events
            .iter()
            .filter(|msg| matches!(msg, EventMsg::ApprovalRequest { .. }))
            .count();
        assert_eq!(prompts, 0);
    }

    #[tokio::test]
    async fn policy_denial_reports_and_leaves_filesystem_unchanged() {
        let h = harness();
        let applied = h
            .coordinator
            .apply_write_operation("1", "etc/passwd", "x", false)
            .await;
        assert!(!applied);
        assert!(!h.coordinator.config.cwd.join("etc/passwd").exists());

        let events = drain(&h.rx_event);
        assert!(events.iter().any(|msg| matches!(
            msg,
            EventMsg::Error { message } if message.starts_with("Policy Denied")
        )));
    }

    #[tokio::test]
    async fn command_batch_runs_in_creation_order() {
        let h = harness();
        {
            let mut todos = h.coordinator.todos.lock().unwrap();
            todos.add("run echo one", "").unwrap();
            todos.add("run echo two", "").unwrap();
        }
        h.coordinator
            .run_execution("batch", TodoSelection::All)
            .await;

        {
            let todos = h.coordinator.todos.lock().unwrap();
            assert_eq!(todos.get(1).unwrap().status, TodoStatus::Completed);
            assert_eq!(todos.get(2).unwrap().status, TodoStatus::Completed);
        }
        let events = drain(&h.rx_event);
        let outputs: Vec<&String> = events
            .iter()
            .filter_map(|msg| match msg {
                EventMsg::ExecCommandEnd { stdout, .. } => Some(stdout),
                _ => None,
            })
            .collect();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].trim(), "one");
        assert_eq!(outputs[1].trim(), "two");
    }

    #[tokio::test]
    async fn failing_item_stays_in_progress_and_batch_halts() {
        let h = harness();
        {
            let mut todos = h.coordinator.todos.lock().unwrap();
            todos.add("run cat /definitely/not/present", "").unwrap();
            todos.add("run echo never", "").unwrap();
        }
        h.coordinator
            .run_execution("batch", TodoSelection::All)
            .await;

        let todos = h.coordinator.todos.lock().unwrap();
        assert_eq!(todos.get(1).unwrap().status, TodoStatus::InProgress);
        assert_eq!(todos.get(2).unwrap().status, TodoStatus::Pending);
    }

    #[tokio::test]
    async fn denied_command_item_fails_with_the_policy_reason() {
        let h = harness();
        {
            let mut todos = h.coordinator.todos.lock().unwrap();
            todos.add("run curl http://example.com", "").unwrap();
        }
        h.coordinator
            .run_execution("batch", TodoSelection::All)
            .await;

        let events = drain(&h.rx_event);
        assert!(events.iter().any(|msg| matches!(
            msg,
            EventMsg::ItemFailed { reason, .. } if reason.starts_with("Policy Denied")
        )));
        let todos = h.coordinator.todos.lock().unwrap();
        assert_eq!(todos.get(1).unwrap().status, TodoStatus::InProgress);
    }

    #[tokio::test]
    async fn destructive_command_item_is_refused_before_execution() {
        let h = harness();
        {
            let mut todos = h.coordinator.todos.lock().unwrap();
            todos.add("run rm -rf /", "").unwrap();
        }
        let cwd_before = h.coordinator.runner.lock().await.cwd().to_path_buf();
        h.coordinator
            .run_execution("batch", TodoSelection::All)
            .await;

        let events = drain(&h.rx_event);
        assert!(events.iter().any(|msg| matches!(
            msg,
            EventMsg::ItemFailed { reason, .. }
                if reason.contains("Command contains blocked operation")
        )));
        // Nothing ran, so the persistent working directory is untouched.
        assert_eq!(h.coordinator.runner.lock().await.cwd(), cwd_before);
    }

    #[tokio::test]
    async fn single_selection_rejects_non_pending_items() {
        let h = harness();
        {
            let mut todos = h.coordinator.todos.lock().unwrap();
            todos.add("run echo once", "").unwrap();
            todos.set_status(1, TodoStatus::Completed);
        }
        h.coordinator
            .run_execution("batch", TodoSelection::Single { id: 1 })
            .await;
        let events = drain(&h.rx_event);
        assert!(events.iter().any(|msg| matches!(
            msg,
            EventMsg::Error { message } if message.contains("not pending")
        )));
    }

    #[tokio::test]
    async fn chat_turn_records_history_interprets_and_tags_the_provider() {
        use wiremock::Mock;
        use wiremock::MockServer;
        use wiremock::ResponseTemplate;
        use wiremock::matchers::method;
        use wiremock::matchers::path;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": {
                    "role": "assistant",
                    "content": "On it. add_todo(\"Write docs\", \"cover the API\")"
                } }]
            })))
            .mount(&server)
            .await;

        // Test-process environment; no concurrent writer for this variable.
        unsafe { std::env::set_var("OPENAI_API_KEY", "test-key") };
        let h = harness_with_adapter(OpenAiAdapter::with_base_url(server.uri()));
        h.coordinator.run_user_input("turn", "please plan docs").await;

        {
            let conversation = h.coordinator.conversation.lock().unwrap();
            let history = conversation.history();
            assert_eq!(history.len(), 2);
            assert_eq!(history[0].role, Role::User);
            assert_eq!(history[1].role, Role::Assistant);
            assert_eq!(history[1].provider.as_deref(), Some("openai"));
            assert!(history[1].content.contains("**Added:** Write docs"));
        }
        {
            let todos = h.coordinator.todos.lock().unwrap();
            assert_eq!(todos.get(1).unwrap().title, "Write docs");
        }

        let events = drain(&h.rx_event);
        assert!(events.iter().any(|msg| matches!(
            msg,
            EventMsg::AgentMessage { message } if message.contains("**Added:** Write docs")
        )));
        assert!(events.iter().any(|msg| matches!(
            msg,
            EventMsg::Suggestion { message } if message.contains("/do")
        )));
    }

    #[tokio::test]
    async fn provider_switch_keeps_the_conversation() {
        let h = harness();
        {
            let mut conversation = h.coordinator.conversation.lock().unwrap();
            conversation.append(Role::User, "first", None);
            conversation.append(Role::Assistant, "reply", Some("openai"));
        }
        h.coordinator.set_provider("switch", "mistral").await;

        let events = drain(&h.rx_event);
        assert!(events.iter().any(|msg| matches!(
            msg,
            EventMsg::ProviderSwitched { provider, .. } if provider == "mistral"
        )));
        let conversation = h.coordinator.conversation.lock().unwrap();
        assert_eq!(conversation.history().len(), 2);
        assert_eq!(conversation.history()[1].provider.as_deref(), Some("openai"));
    }

    #[test]
    fn control_transitions_cover_every_state() {
        // Running -> pause -> Paused
        assert_eq!(
            next_control_state(ExecState::Running, &Op::Pause).0,
            ExecState::Paused
        );
        // Paused -> resume -> Running
        assert_eq!(
            next_control_state(ExecState::Paused, &Op::Resume).0,
            ExecState::Running
        );
        // Running or Paused -> stop -> Stopped
        assert_eq!(
            next_control_state(ExecState::Running, &Op::Stop).0,
            ExecState::Stopped
        );
        assert_eq!(
            next_control_state(ExecState::Paused, &Op::Stop).0,
            ExecState::Stopped
        );
        // Running or Paused -> cancel -> Cancelled
        assert_eq!(
            next_control_state(ExecState::Paused, &Op::Cancel).0,
            ExecState::Cancelled
        );
        // Stopped or Cancelled -> any control -> unchanged
        for op in [Op::Pause, Op::Resume, Op::Stop, Op::Cancel] {
            assert_eq!(
                next_control_state(ExecState::Stopped, &op).0,
                ExecState::Stopped
            );
            assert_eq!(
                next_control_state(ExecState::Cancelled, &op).0,
                ExecState::Cancelled
            );
        }
    }

    #[test]
    fn classification_spots_imperative_tokens() {
        assert!(is_command_item("run the linter"));
        assert!(is_command_item("Build the project"));
        assert!(is_command_item("git status please"));
        assert!(!is_command_item("write a README for the project"));
        assert!(!is_command_item("draft the architecture notes"));
    }

    #[test]
    fn extraction_recognizes_python_scripts_verbatim() {
        assert_eq!(
            extract_command("run python3 tools/gen.py"),
            Some("python3 tools/gen.py".to_string())
        );
        assert_eq!(
            extract_command("python3 main.py"),
            Some("python3 main.py".to_string())
        );
    }

    #[test]
    fn extraction_takes_text_after_run_or_execute() {
        assert_eq!(
            extract_command("run cargo fmt --check"),
            Some("cargo fmt --check".to_string())
        );
        assert_eq!(
            extract_command("please execute ls -la"),
            Some("ls -la".to_string())
        );
    }

    #[test]
    fn extraction_maps_build_and_test_to_make() {
        assert_eq!(extract_command("build the project"), Some("make".to_string()));
        assert_eq!(
            extract_command("test everything"),
            Some("make test".to_string())
        );
    }

    #[test]
    fn extraction_passes_through_command_looking_text() {
        assert_eq!(
            extract_command("git log --oneline"),
            Some("git log --oneline".to_string())
        );
        assert_eq!(extract_command("deploy the site"), None);
    }
}
