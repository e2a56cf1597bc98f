//! Interactive shell: a line-editor loop feeding the coordinator's
//! submission queue, with events rendered as they arrive.
//!
//! Input runs on a dedicated thread (the line editor blocks); the async side
//! selects between incoming lines and coordinator events, so control
//! commands like `/pause` land while a batch is running.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use magus_core::Magus;
use magus_core::protocol::EventMsg;
use magus_core::protocol::Op;
use magus_core::protocol::ReviewDecision;
use magus_core::protocol::SessionOp;
use magus_core::protocol::TodoSelection;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tracing::warn;

use crate::event_display::EventRenderer;

const PROMPT: &str = "magus> ";

pub(crate) const HELP: &str = "\
commands:
  /help /h              show this help
  /status               provider, model, mode and execution state
  /debug                toggle verbose logging
  /todo                 list todos (completed included)
  /do [all|next|until <id>|<start>-<end>|<id>]
                        execute queued todos
  /chat [on|off]        toggle chat mode (off = structured plan mode)
  /pause /resume        pause or resume the running batch
  /stop /cancel         stop or cancel the running batch
  /history              show the session transcript
  /session [list|new|load <id>]
                        manage conversation sessions
  /gemini /claude /chatgpt /mistral
                        switch the model provider
  /exit /quit /q        leave the shell
anything else is sent to the model.";

/// Parsed slash command. `None` from the parser means the line is ordinary
/// user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ShellCommand {
    Help,
    Status,
    Debug,
    Todo,
    Do(TodoSelection),
    Chat(bool),
    Pause,
    Resume,
    Stop,
    Cancel,
    History,
    Session(SessionAction),
    Provider(String),
    Exit,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionAction {
    List,
    New,
    Load(String),
}

pub(crate) fn parse_slash_command(line: &str) -> Option<ShellCommand> {
    let trimmed = line.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut words = trimmed.split_whitespace();
    let head = words.next().unwrap_or(trimmed);
    let rest: Vec<&str> = words.collect();

    let command = match head {
        "/help" | "/h" => ShellCommand::Help,
        "/status" => ShellCommand::Status,
        "/debug" => ShellCommand::Debug,
        "/todo" => ShellCommand::Todo,
        "/do" => match parse_do_selection(&rest) {
            Some(selection) => ShellCommand::Do(selection),
            None => ShellCommand::Unknown(trimmed.to_string()),
        },
        "/chat" => match rest.as_slice() {
            ["on"] => ShellCommand::Chat(true),
            ["off"] => ShellCommand::Chat(false),
            _ => ShellCommand::Unknown(trimmed.to_string()),
        },
        "/pause" => ShellCommand::Pause,
        "/resume" => ShellCommand::Resume,
        "/stop" => ShellCommand::Stop,
        "/cancel" => ShellCommand::Cancel,
        "/history" => ShellCommand::History,
        "/session" => match rest.as_slice() {
            [] | ["list"] => ShellCommand::Session(SessionAction::List),
            ["new"] => ShellCommand::Session(SessionAction::New),
            ["load", id] => ShellCommand::Session(SessionAction::Load((*id).to_string())),
            _ => ShellCommand::Unknown(trimmed.to_string()),
        },
        "/gemini" | "/claude" | "/chatgpt" | "/mistral" => {
            ShellCommand::Provider(head.trim_start_matches('/').to_string())
        }
        "/exit" | "/quit" | "/q" => ShellCommand::Exit,
        _ => ShellCommand::Unknown(trimmed.to_string()),
    };
    Some(command)
}

fn parse_do_selection(rest: &[&str]) -> Option<TodoSelection> {
    match rest {
        [] | ["all"] => Some(TodoSelection::All),
        ["next"] => Some(TodoSelection::Next),
        ["until", id] => id.parse().ok().map(|stop_id| TodoSelection::Until { stop_id }),
        [token] => {
            if let Some((start, end)) = token.split_once('-') {
                let start_id = start.parse().ok()?;
                let end_id = end.parse().ok()?;
                Some(TodoSelection::Range { start_id, end_id })
            } else {
                token.parse().ok().map(|id| TodoSelection::Single { id })
            }
        }
        _ => None,
    }
}

/// Map the user's answer to a confirmation prompt. `a`/`A` sets the
/// always-approve flag and implicitly confirms; `y`/`Y` confirms once;
/// anything else cancels.
pub(crate) fn parse_approval(line: &str) -> ReviewDecision {
    match line.trim() {
        "y" | "Y" => ReviewDecision::Approved,
        "a" | "A" => ReviewDecision::ApprovedAlways,
        _ => ReviewDecision::Denied,
    }
}

pub(crate) struct Shell {
    magus: Arc<Magus>,
    renderer: EventRenderer,
    history_path: PathBuf,
    debug_log_path: PathBuf,
    toggle_debug: Box<dyn Fn(bool) + Send>,
    debug_enabled: bool,
    /// Submission id of an approval prompt awaiting an answer.
    pending_approval: Option<String>,
}

impl Shell {
    pub(crate) fn new(
        magus: Arc<Magus>,
        renderer: EventRenderer,
        history_path: PathBuf,
        debug_log_path: PathBuf,
        toggle_debug: Box<dyn Fn(bool) + Send>,
    ) -> Self {
        Self {
            magus,
            renderer,
            history_path,
            debug_log_path,
            toggle_debug,
            debug_enabled: false,
            pending_approval: None,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let (tx_line, mut rx_line) = mpsc::channel::<String>(8);
        let history_path = self.history_path.clone();
        let input_thread = std::thread::spawn(move || read_lines(tx_line, &history_path));

        loop {
            let magus = Arc::clone(&self.magus);
            tokio::select! {
                line = rx_line.recv() => {
                    match line {
                        Some(line) => {
                            if !self.handle_line(&line).await? {
                                break;
                            }
                        }
                        None => break, // EOF on the editor side.
                    }
                }
                event = async move { magus.next_event().await } => {
                    let event = event.context("coordinator stopped")?;
                    if let EventMsg::ApprovalRequest { .. } = event.msg {
                        self.pending_approval = Some(event.id.clone());
                    }
                    self.renderer.render(&event.msg);
                }
            }
        }

        // Flush the session before leaving.
        let id = self.magus.submit(Op::Shutdown).await?;
        loop {
            let event = self.magus.next_event().await?;
            let done = matches!(event.msg, EventMsg::ShutdownComplete) && event.id == id;
            self.renderer.render(&event.msg);
            if done {
                break;
            }
        }
        if let Err(e) = input_thread.join() {
            warn!("input thread panicked: {e:?}");
        }
        Ok(())
    }

    /// Returns false when the shell should exit.
    async fn handle_line(&mut self, line: &str) -> Result<bool> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }

        // An outstanding confirmation prompt consumes the next line.
        if let Some(id) = self.pending_approval.take() {
            let decision = parse_approval(trimmed);
            self.magus.submit(Op::Approval { id, decision }).await?;
            return Ok(true);
        }

        let Some(command) = parse_slash_command(trimmed) else {
            self.magus
                .submit(Op::UserInput {
                    text: trimmed.to_string(),
                })
                .await?;
            return Ok(true);
        };

        match command {
            ShellCommand::Help => println!("{HELP}"),
            ShellCommand::Status => {
                self.magus.submit(Op::StatusQuery).await?;
            }
            ShellCommand::Debug => {
                self.debug_enabled = !self.debug_enabled;
                (self.toggle_debug)(self.debug_enabled);
                println!(
                    "debug logging {} (trace at {})",
                    if self.debug_enabled { "on" } else { "off" },
                    self.debug_log_path.display()
                );
            }
            ShellCommand::Todo => {
                self.magus.submit(Op::TodoQuery).await?;
            }
            ShellCommand::Do(selection) => {
                self.magus.submit(Op::ExecuteTodos { selection }).await?;
            }
            ShellCommand::Chat(enabled) => {
                self.magus.submit(Op::SetChatMode { enabled }).await?;
            }
            ShellCommand::Pause => {
                self.magus.submit(Op::Pause).await?;
            }
            ShellCommand::Resume => {
                self.magus.submit(Op::Resume).await?;
            }
            ShellCommand::Stop => {
                self.magus.submit(Op::Stop).await?;
            }
            ShellCommand::Cancel => {
                self.magus.submit(Op::Cancel).await?;
            }
            ShellCommand::History => {
                self.magus.submit(Op::HistoryQuery).await?;
            }
            ShellCommand::Session(action) => {
                let command = match action {
                    SessionAction::List => SessionOp::List,
                    SessionAction::New => SessionOp::New,
                    SessionAction::Load(id) => SessionOp::Load { id },
                };
                self.magus.submit(Op::SessionCommand { command }).await?;
            }
            ShellCommand::Provider(name) => {
                self.magus.submit(Op::SetProvider { name }).await?;
            }
            ShellCommand::Exit => return Ok(false),
            ShellCommand::Unknown(input) => {
                eprintln!("unknown command: {input} (try /help)");
            }
        }
        Ok(true)
    }
}

/// Blocking line-editor loop on its own thread. Lines flow to the async
/// side through a channel; the channel closing means EOF or `/exit` typed
/// at the editor level.
fn read_lines(tx_line: mpsc::Sender<String>, history_path: &PathBuf) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("failed to start line editor: {e}");
            return;
        }
    };
    if let Err(e) = editor.load_history(history_path) {
        tracing::debug!("no usable history at {}: {e}", history_path.display());
    }

    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = editor.add_history_entry(line.as_str());
                }
                if tx_line.blocking_send(line.clone()).is_err() {
                    break;
                }
                if matches!(parse_slash_command(&line), Some(ShellCommand::Exit)) {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl-C clears the current line without leaving the shell.
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("read error: {e}");
                break;
            }
        }
    }

    if let Err(e) = editor.save_history(history_path) {
        warn!("failed to save history: {e}");
    }
}
