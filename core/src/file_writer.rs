//! File write executor: a dry-run that previews the change without touching
//! storage, and an apply step that creates parent directories and writes the
//! content.

use std::path::PathBuf;

use chrono::Utc;

use crate::config::resolve_path;
use crate::models::ExecutionContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRun {
    pub description: String,
    /// True when the target does not exist yet.
    pub creates: bool,
}

#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub success: bool,
    pub message: String,
    pub context: ExecutionContext,
}

/// Stateless executor; the working directory only anchors relative paths.
#[derive(Debug, Clone)]
pub struct FileWriter {
    cwd: PathBuf,
}

impl FileWriter {
    pub fn new(cwd: PathBuf) -> Self {
        Self { cwd }
    }

    /// Compute the preview without modifying the filesystem.
    pub fn dry_run(&self, path: &str, content: &str) -> DryRun {
        let target = resolve_path(&self.cwd, path);
        let creates = !target.exists();
        let description = if creates {
            format!("will create new file '{path}' with {} bytes", content.len())
        } else {
            format!(
                "will overwrite existing file '{path}' with {} bytes",
                content.len()
            )
        };
        DryRun {
            description,
            creates,
        }
    }

    /// Write `content` to `path`, creating parent directories as needed.
    /// With `auto_backup`, an existing target is copied to `<path>.bak`
    /// before being overwritten. Failures are reported in the execution
    /// context rather than raised.
    pub fn apply(&self, path: &str, content: &str, auto_backup: bool) -> ApplyReport {
        let target = resolve_path(&self.cwd, path);
        let existed = target.exists();

        let result = target
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| {
                if auto_backup && existed {
                    let mut backup = target.clone().into_os_string();
                    backup.push(".bak");
                    std::fs::copy(&target, backup)?;
                }
                Ok(())
            })
            .and_then(|_| std::fs::write(&target, content));

        let (success, message, stderr) = match result {
            Ok(()) => {
                let verb = if existed { "Overwrote" } else { "Created" };
                (
                    true,
                    format!("{verb} '{path}' ({} bytes)", content.len()),
                    String::new(),
                )
            }
            Err(e) => (false, format!("write failed: {e}"), e.to_string()),
        };

        ApplyReport {
            success,
            message: message.clone(),
            context: ExecutionContext {
                cwd_before: self.cwd.clone(),
                cwd_after: self.cwd.clone(),
                stdout: message,
                stderr,
                exit_code: if success { 0 } else { 1 },
                timestamp: Utc::now(),
            },
        }
    }
}
