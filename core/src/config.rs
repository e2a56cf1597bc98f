//! Application configuration as an explicit value.
//!
//! `Config` is constructed once at process start and passed by value to the
//! coordinator. State lives in a hidden per-project directory (`.magus/`
//! under the working directory) rather than a per-user home directory so
//! policy and conversations travel with the project.

use std::path::Path;
use std::path::PathBuf;

/// Name of the hidden per-project state directory.
pub const STATE_DIR_NAME: &str = ".magus";

/// File name of the policy document inside the state directory.
pub const POLICY_FILENAME: &str = "policy.json";

/// Line-delimited command history consumed by the line editor.
pub const HISTORY_FILENAME: &str = "history";

/// Append-only operator trace.
pub const DEBUG_LOG_FILENAME: &str = "debug.log";

/// Folder that holds one JSON document per conversation session.
pub const CONVERSATIONS_SUBDIR: &str = "conversations";

#[derive(Debug, Clone)]
pub struct Config {
    /// Working directory the session treats as its root. All relative paths
    /// supplied by the model are resolved against this directory.
    pub cwd: PathBuf,

    /// Provider override from the command line; when `None` the provider is
    /// auto-detected from the environment.
    pub provider: Option<String>,

    /// Model override; when `None` the adapter's default model is used.
    pub model: Option<String>,

    /// Whether the coordinator starts in chat mode. Defaults to on.
    pub chat_mode: bool,

    /// Timeout applied to each shell command, in milliseconds.
    pub command_timeout_ms: u64,
}

impl Config {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            provider: None,
            model: None,
            chat_mode: true,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.cwd.join(STATE_DIR_NAME)
    }

    pub fn policy_path(&self) -> PathBuf {
        self.state_dir().join(POLICY_FILENAME)
    }

    pub fn history_path(&self) -> PathBuf {
        self.state_dir().join(HISTORY_FILENAME)
    }

    pub fn debug_log_path(&self) -> PathBuf {
        self.state_dir().join(DEBUG_LOG_FILENAME)
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.state_dir().join(CONVERSATIONS_SUBDIR)
    }
}

pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Ensure the state directory (and conversations subdirectory) exist.
pub fn ensure_state_dir(config: &Config) -> std::io::Result<()> {
    std::fs::create_dir_all(config.conversations_dir())
}

/// Whether ANSI colour escapes should be emitted. `TERM` is consulted; a
/// missing or `dumb` terminal disables colour, as does a non-tty stdout.
pub fn color_enabled() -> bool {
    match std::env::var("TERM") {
        Ok(term) if term != "dumb" && !term.is_empty() => std::io::IsTerminal::is_terminal(&std::io::stdout()),
        _ => false,
    }
}

/// Resolve `path` against `cwd` unless it is already absolute.
pub fn resolve_path(cwd: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() { p } else { cwd.join(p) }
}
