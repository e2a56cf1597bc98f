//! Declarative operation policy: which tool may touch which path, and which
//! commands may run.
//!
//! The policy document is a versioned JSON file at `.magus/policy.json`. It
//! is immutable once loaded; [`PolicyEngine::replace`] swaps the whole
//! document atomically so queries observe either the old or the new
//! document, never a blend.

// Poisoned document mutex should fail the program.
#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::error::MagusErr;
use crate::error::Result;

/// Tool name used for file create/read/update/delete operations.
pub const FILE_TOOL: &str = "file-tool";
/// Tool name used for todo-list mutations.
pub const TODO_TOOL: &str = "todo-tool";
/// Tool name used for shell command execution.
pub const COMMAND_TOOL: &str = "command-tool";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudOp {
    Create,
    Read,
    Update,
    Delete,
}

impl CrudOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CrudOp::Create => "create",
            CrudOp::Read => "read",
            CrudOp::Update => "update",
            CrudOp::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PolicyDocument {
    pub version: String,
    pub global: GlobalPolicy,
    pub tools: BTreeMap<String, ToolPolicy>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GlobalPolicy {
    /// File extensions that may never be written, each beginning with ".".
    pub blocked_extensions: Vec<String>,
    /// Maximum file size accepted by the file writer, in megabytes (1..=1000).
    pub max_file_size_mb: u64,
    pub auto_backup: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub create: CrudPolicy,
    #[serde(default)]
    pub read: CrudPolicy,
    #[serde(default)]
    pub update: CrudPolicy,
    #[serde(default)]
    pub delete: CrudPolicy,
}

impl ToolPolicy {
    pub fn for_op(&self, op: CrudOp) -> &CrudPolicy {
        match op {
            CrudOp::Create => &self.create,
            CrudOp::Read => &self.read,
            CrudOp::Update => &self.update,
            CrudOp::Delete => &self.delete,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CrudPolicy {
    /// Directory prefixes the operation may touch. An empty string matches
    /// any path; an empty *list* disables the operation outright.
    #[serde(default)]
    pub allowed_directories: Vec<String>,
    #[serde(default)]
    pub confirmation_required: bool,
    /// Base commands permitted to run. Only meaningful on the command
    /// tool's create sub-policy. An empty or absent list allows any base
    /// command that survives the blocked list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_commands: Option<Vec<String>>,
    /// Substrings that reject a command wherever they appear.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_commands: Option<Vec<String>>,
}

impl PolicyDocument {
    /// Reject the document if any schema invariant is violated. There is no
    /// implicit repair; the caller treats a failure as fatal.
    pub fn validate(&self) -> Result<()> {
        for ext in &self.global.blocked_extensions {
            if !ext.starts_with('.') {
                return Err(MagusErr::Configuration(format!(
                    "blocked extension {ext:?} must begin with \".\""
                )));
            }
        }
        if !(1..=1000).contains(&self.global.max_file_size_mb) {
            return Err(MagusErr::Configuration(format!(
                "max_file_size_mb must be within 1..=1000, got {}",
                self.global.max_file_size_mb
            )));
        }
        for (tool, policy) in &self.tools {
            for op in [CrudOp::Create, CrudOp::Read, CrudOp::Update, CrudOp::Delete] {
                for dir in &policy.for_op(op).allowed_directories {
                    if dir.is_empty() {
                        continue;
                    }
                    if !dir.ends_with('/') {
                        return Err(MagusErr::Configuration(format!(
                            "{tool}.{}.allowed_directories entry {dir:?} must end with \"/\"",
                            op.as_str()
                        )));
                    }
                    if dir.split('/').any(|segment| segment == "..") {
                        return Err(MagusErr::Configuration(format!(
                            "{tool}.{}.allowed_directories entry {dir:?} must not contain \"..\"",
                            op.as_str()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Built-in document written on first use when no policy file exists.
    pub fn default_document() -> Self {
        let project_dirs = vec![
            "src/".to_string(),
            "tests/".to_string(),
            "docs/".to_string(),
            "demos/".to_string(),
        ];
        let any_path = vec![String::new()];

        let file_tool = ToolPolicy {
            create: CrudPolicy {
                allowed_directories: project_dirs.clone(),
                confirmation_required: true,
                ..Default::default()
            },
            read: CrudPolicy {
                allowed_directories: any_path.clone(),
                confirmation_required: false,
                ..Default::default()
            },
            update: CrudPolicy {
                allowed_directories: project_dirs,
                confirmation_required: true,
                ..Default::default()
            },
            delete: CrudPolicy {
                // No directories: deletes are disabled until the user opts in.
                allowed_directories: Vec::new(),
                confirmation_required: true,
                ..Default::default()
            },
        };

        let todo_tool = ToolPolicy {
            create: open_crud(),
            read: open_crud(),
            update: open_crud(),
            delete: open_crud(),
        };

        let command_tool = ToolPolicy {
            create: CrudPolicy {
                allowed_directories: any_path,
                confirmation_required: true,
                allowed_commands: Some(
                    [
                        "ls", "pwd", "echo", "cat", "head", "tail", "grep", "find", "wc",
                        "mkdir", "touch", "git", "make", "cargo", "python3", "pip",
                    ]
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                ),
                blocked_commands: Some(
                    ["rm -rf /", "sudo ", "shutdown", "reboot", "mkfs", ":(){"]
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                ),
            },
            ..Default::default()
        };

        Self {
            version: "1.0".to_string(),
            global: GlobalPolicy {
                blocked_extensions: [".exe", ".dll", ".so", ".dylib"]
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                max_file_size_mb: 10,
                auto_backup: false,
            },
            tools: BTreeMap::from([
                (FILE_TOOL.to_string(), file_tool),
                (TODO_TOOL.to_string(), todo_tool),
                (COMMAND_TOOL.to_string(), command_tool),
            ]),
        }
    }
}

fn open_crud() -> CrudPolicy {
    CrudPolicy {
        allowed_directories: vec![String::new()],
        confirmation_required: false,
        ..Default::default()
    }
}

/// Evaluates operations against the loaded [`PolicyDocument`].
#[derive(Debug)]
pub struct PolicyEngine {
    document: Mutex<Arc<PolicyDocument>>,
    cwd: PathBuf,
}

impl PolicyEngine {
    pub fn new(document: PolicyDocument, cwd: PathBuf) -> Self {
        Self {
            document: Mutex::new(Arc::new(document)),
            cwd,
        }
    }

    /// Load the document at `path`, writing the default document first if
    /// none exists. Parse or validation failure is fatal to the caller.
    pub fn load_or_init(path: &Path, cwd: PathBuf) -> Result<Self> {
        let document = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                MagusErr::Configuration(format!("cannot read {}: {e}", path.display()))
            })?;
            let document: PolicyDocument = serde_json::from_str(&raw).map_err(|e| {
                MagusErr::Configuration(format!("malformed policy at {}: {e}", path.display()))
            })?;
            document.validate()?;
            document
        } else {
            let document = PolicyDocument::default_document();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let pretty = serde_json::to_string_pretty(&document)?;
            std::fs::write(path, pretty)?;
            tracing::info!("wrote default policy to {}", path.display());
            document
        };
        Ok(Self::new(document, cwd))
    }

    /// Snapshot of the current document. Queries in flight that cloned the
    /// previous snapshot keep observing it unchanged.
    pub fn document(&self) -> Arc<PolicyDocument> {
        self.document.lock().unwrap().clone()
    }

    /// Atomically replace the document after validating the successor.
    pub fn replace(&self, document: PolicyDocument) -> Result<()> {
        document.validate()?;
        let mut guard = self.document.lock().unwrap();
        *guard = Arc::new(document);
        Ok(())
    }

    /// A path is allowed iff its lexically normalized form lies under the
    /// session working directory, its extension is not blocked, and at least
    /// one allowed-directory prefix for (tool, op) matches.
    pub fn allowed(&self, tool: &str, op: CrudOp, path: &str) -> bool {
        if path.split('/').any(|segment| segment == "..") {
            return false;
        }
        let Some(relative) = self.relative_to_cwd(path) else {
            return false;
        };
        if self.extension_blocked(path) {
            return false;
        }
        let document = self.document();
        let Some(tool_policy) = document.tools.get(tool) else {
            return false;
        };
        let prefixes = &tool_policy.for_op(op).allowed_directories;
        prefixes
            .iter()
            .any(|prefix| prefix.is_empty() || relative.starts_with(prefix.as_str()))
    }

    /// Evaluate a full command string against the command tool's create
    /// sub-policy. Returns the decision and a human-readable reason.
    pub fn command_allowed(&self, command: &str) -> (bool, String) {
        let document = self.document();
        let policy = document
            .tools
            .get(COMMAND_TOOL)
            .map(|tool| tool.for_op(CrudOp::Create).clone())
            .unwrap_or_default();

        if let Some(blocked) = &policy.blocked_commands {
            for needle in blocked {
                if !needle.is_empty() && command.contains(needle.as_str()) {
                    return (
                        false,
                        format!("Command contains blocked operation ({needle:?})"),
                    );
                }
            }
        }

        let base = command.split_whitespace().next().unwrap_or_default();
        if base.is_empty() {
            return (false, "empty command".to_string());
        }
        match &policy.allowed_commands {
            Some(allowed) if !allowed.is_empty() => {
                if allowed.iter().any(|entry| entry == base) {
                    (true, format!("base command {base:?} is allowed"))
                } else {
                    (false, format!("base command {base:?} is not in the allowed list"))
                }
            }
            _ => (true, "no allowed-command restriction".to_string()),
        }
    }

    pub fn extension_blocked(&self, path: &str) -> bool {
        let document = self.document();
        document
            .global
            .blocked_extensions
            .iter()
            .any(|ext| path.ends_with(ext.as_str()))
    }

    pub fn file_size_allowed(&self, bytes: u64) -> bool {
        bytes <= self.document().global.max_file_size_mb * 1024 * 1024
    }

    pub fn allowed_directories(&self, tool: &str, op: CrudOp) -> Vec<String> {
        self.document()
            .tools
            .get(tool)
            .map(|policy| policy.for_op(op).allowed_directories.clone())
            .unwrap_or_default()
    }

    pub fn confirmation_required(&self, tool: &str, op: CrudOp) -> bool {
        self.document()
            .tools
            .get(tool)
            .map(|policy| policy.for_op(op).confirmation_required)
            .unwrap_or(true)
    }

    /// Normalize `path` without touching the filesystem and express it
    /// relative to the working directory. Returns `None` when the result
    /// escapes the working directory.
    fn relative_to_cwd(&self, path: &str) -> Option<String> {
        let joined = crate::config::resolve_path(&self.cwd, path);
        let normalized = normalize(&joined);
        let cwd = normalize(&self.cwd);
        let relative = normalized.strip_prefix(&cwd).ok()?;
        Some(relative.to_string_lossy().replace('\\', "/"))
    }
}

/// Remove `.` components and resolve `..` lexically, so policy checks work
/// for paths that do not exist yet.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
