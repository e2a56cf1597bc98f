//! Shell command executor with a persistent working directory.
//!
//! The post-execution working directory is recovered by appending a
//! sentinel-prefixed `pwd` echo to the user command and extracting the value
//! from the captured output, so a plan containing `cd build` followed by
//! `make` observes the expected state. The sentinel carries a per-process
//! random token so it cannot collide with command output, and the sentinel
//! line is stripped before stdout reaches the caller.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use tokio::process::Command;

use crate::error::MagusErr;
use crate::error::Result;
use crate::is_dangerous_command::dangerous_command_reason;
use crate::models::CommandResult;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Exit code reported when the timeout elapses, matching the coreutils
/// `timeout(1)` convention.
const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug)]
pub struct CommandRunner {
    cwd: PathBuf,
    sentinel: String,
}

impl CommandRunner {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            sentinel: format!("__MAGUS_PWD_{:016x}__", rand::random::<u64>()),
        }
    }

    /// Working directory the next command will start in.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Execute `command` through the platform shell. `cwd` overrides the
    /// persistent working directory for this invocation (and, like any
    /// `cd` inside the command, persists into the next one).
    pub async fn execute(
        &mut self,
        command: &str,
        cwd: Option<&Path>,
        timeout_ms: Option<u64>,
    ) -> Result<CommandResult> {
        if let Some(reason) = dangerous_command_reason(command) {
            return Err(MagusErr::PolicyDenied(reason.to_string()));
        }

        let start_dir = cwd.unwrap_or(&self.cwd).to_path_buf();
        // The sentinel echo must not mask the command's exit status.
        let wrapped = format!(
            "{command}\n__magus_rc=$?; echo {}$(pwd); exit $__magus_rc",
            self.sentinel
        );
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let started = Instant::now();

        let child = Command::new("sh")
            .arg("-c")
            .arg(&wrapped)
            .current_dir(&start_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                // Dropping the future killed the child (kill_on_drop); the
                // working directory is left untouched.
                return Ok(CommandResult {
                    stdout: String::new(),
                    stderr: format!("command timed out after {} ms", timeout.as_millis()),
                    exit_code: TIMEOUT_EXIT_CODE,
                    cwd_after: self.cwd.clone(),
                    duration: started.elapsed(),
                });
            }
        };

        let raw_stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let (stdout, observed_cwd) = self.split_sentinel(&raw_stdout);

        if let Some(observed) = observed_cwd {
            self.cwd = observed;
        } else if cwd.is_some() {
            self.cwd = start_dir;
        }

        Ok(CommandResult {
            stdout,
            stderr,
            exit_code: output.status.code().unwrap_or(-1),
            cwd_after: self.cwd.clone(),
            duration: started.elapsed(),
        })
    }

    /// Remove the sentinel (through the end of its line) from stdout and
    /// return the directory it carried, if present. The sentinel may share a
    /// line with command output that lacked a trailing newline.
    fn split_sentinel(&self, raw: &str) -> (String, Option<PathBuf>) {
        let Some(pos) = raw.find(&self.sentinel) else {
            return (raw.to_string(), None);
        };
        let after = &raw[pos + self.sentinel.len()..];
        let (dir, rest) = match after.find('\n') {
            Some(newline) => (&after[..newline], &after[newline + 1..]),
            None => (after, ""),
        };
        let mut kept = String::with_capacity(raw.len());
        kept.push_str(&raw[..pos]);
        kept.push_str(rest);
        (kept, Some(PathBuf::from(dir)))
    }
}
