//! Renders coordinator events for the terminal.

use chrono::Utc;
use magus_core::protocol::EventMsg;
use magus_core::render_list;
use owo_colors::OwoColorize;
use owo_colors::Style;

pub(crate) struct EventRenderer {
    bold: Style,
    dimmed: Style,
    magenta: Style,
    red: Style,
    green: Style,
}

macro_rules! ts_println {
    ($($arg:tt)*) => {{
        let now = Utc::now();
        print!("[{}] ", now.format("%H:%M:%S"));
        println!($($arg)*);
    }};
}

impl EventRenderer {
    pub(crate) fn create_with_ansi(with_ansi: bool) -> Self {
        if with_ansi {
            Self {
                bold: Style::new().bold(),
                dimmed: Style::new().dimmed(),
                magenta: Style::new().magenta(),
                red: Style::new().red(),
                green: Style::new().green(),
            }
        } else {
            Self {
                bold: Style::new(),
                dimmed: Style::new(),
                magenta: Style::new(),
                red: Style::new(),
                green: Style::new(),
            }
        }
    }

    /// Print one event. Errors go to stderr so one-shot callers can
    /// redirect them; everything else goes to stdout.
    pub(crate) fn render(&self, msg: &EventMsg) {
        match msg {
            EventMsg::SessionConfigured {
                provider,
                model,
                session_id,
            } => {
                ts_println!(
                    "session {} ready {}",
                    session_id.style(self.bold),
                    format!("(provider {provider}, model {model})").style(self.dimmed)
                );
            }
            EventMsg::AgentMessage { message } => {
                println!("{message}");
            }
            EventMsg::Suggestion { message } => {
                println!("{}", message.style(self.dimmed));
            }
            EventMsg::Error { message } => {
                eprintln!("{}", message.style(self.red));
            }
            EventMsg::PauseNotice { reason } => {
                ts_println!("{} {reason}", "needs your attention:".style(self.magenta));
            }
            EventMsg::ApprovalRequest { preview } => {
                println!("{}", preview.style(self.bold));
                println!("{}", "apply? [y]es / [n]o / [a]lways: ".style(self.bold));
            }
            EventMsg::ExecCommandBegin { command, cwd } => {
                ts_println!(
                    "{} {command} {}",
                    "exec$".style(self.magenta),
                    format!("(in {})", cwd.display()).style(self.dimmed)
                );
            }
            EventMsg::ExecCommandEnd {
                stdout,
                stderr,
                exit_code,
                duration_ms,
                ..
            } => {
                if !stdout.is_empty() {
                    print!("{stdout}");
                    if !stdout.ends_with('\n') {
                        println!();
                    }
                }
                if !stderr.is_empty() {
                    eprint!("{}", stderr.style(self.red));
                    if !stderr.ends_with('\n') {
                        eprintln!();
                    }
                }
                let summary = format!("exited {exit_code} in {duration_ms} ms");
                if *exit_code == 0 {
                    ts_println!("{}", summary.style(self.dimmed));
                } else {
                    ts_println!("{}", summary.style(self.red));
                }
            }
            EventMsg::FileWriteBegin { preview, .. } => {
                ts_println!("{} {preview}", "dry run:".style(self.magenta));
            }
            EventMsg::FileWriteEnd { message, success } => {
                if *success {
                    ts_println!("{}", message.style(self.green));
                } else {
                    ts_println!("{}", message.style(self.red));
                }
            }
            EventMsg::ItemStarted { id, title } => {
                ts_println!("{} #{id} {title}", "item started:".style(self.bold));
            }
            EventMsg::ItemCompleted { id, title } => {
                ts_println!("{} #{id} {title}", "item completed:".style(self.green));
            }
            EventMsg::ItemFailed { id, title, reason } => {
                ts_println!(
                    "{} #{id} {title}: {reason}",
                    "item failed:".style(self.red)
                );
            }
            EventMsg::TaskStarted => {}
            EventMsg::TaskComplete => {
                ts_println!("{}", "turn complete".style(self.dimmed));
            }
            EventMsg::ControlState { state, note } => {
                ts_println!("state: {} {}", state.style(self.bold), format!("({note})").style(self.dimmed));
            }
            EventMsg::TodoList { items } => {
                print!("{}", render_list(items));
            }
            EventMsg::History {
                session_id,
                messages,
            } => {
                println!("history for session {}:", session_id.style(self.bold));
                for message in messages {
                    let role = format!("{:?}", message.role).to_lowercase();
                    let provider = message
                        .provider
                        .as_deref()
                        .map(|p| format!(" via {p}"))
                        .unwrap_or_default();
                    println!(
                        "  [{}] {role}{provider}: {}",
                        message.timestamp.format("%H:%M:%S"),
                        message.content
                    );
                }
            }
            EventMsg::Sessions { sessions } => {
                if sessions.is_empty() {
                    println!("no stored sessions");
                }
                for session in sessions {
                    println!(
                        "  {} {}",
                        session.session_id.style(self.bold),
                        format!(
                            "({} messages, last active {})",
                            session.message_count,
                            session.last_activity.format("%Y-%m-%d %H:%M:%S")
                        )
                        .style(self.dimmed)
                    );
                }
            }
            EventMsg::SessionSwitched { session_id } => {
                ts_println!("switched to session {}", session_id.style(self.bold));
            }
            EventMsg::ProviderSwitched { provider, model } => {
                ts_println!(
                    "provider switched to {} {}",
                    provider.style(self.bold),
                    format!("(model {model})").style(self.dimmed)
                );
            }
            EventMsg::StatusReport {
                provider,
                model,
                session_id,
                chat_mode,
                always_approve,
                state,
                pending_todos,
            } => {
                println!("provider:       {provider}");
                println!("model:          {model}");
                println!("session:        {session_id}");
                println!("chat mode:      {}", if *chat_mode { "on" } else { "off" });
                println!("always approve: {}", if *always_approve { "on" } else { "off" });
                println!("state:          {state}");
                println!("pending todos:  {pending_todos}");
            }
            EventMsg::BackgroundEvent { message } => {
                ts_println!("{}", message.style(self.dimmed));
            }
            EventMsg::ShutdownComplete => {}
            _ => {
                ts_println!("{}", format!("{msg:?}").style(self.dimmed));
            }
        }
    }
}
