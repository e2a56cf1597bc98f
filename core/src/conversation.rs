//! Per-session conversation log with JSON persistence.
//!
//! Each session is a single document at
//! `.magus/conversations/<session-id>.json`. Sessions are flushed atomically
//! (temp file + rename) on explicit save, on session switch and on graceful
//! teardown. An empty session is never persisted.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Local;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::error::MagusErr;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Internal adapter name that produced an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// On-disk session shape. `message_count` is derived on save and ignored on
/// load beyond a consistency warning.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct SessionDocument {
    session_id: String,
    created: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_provider: Option<String>,
    message_count: usize,
    messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub message_count: usize,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ConversationStore {
    dir: PathBuf,
    session_id: String,
    created: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_provider: Option<String>,
    messages: Vec<Message>,
}

impl ConversationStore {
    /// Open a store rooted at `dir` and begin a fresh session.
    pub fn new(dir: PathBuf) -> Self {
        let now = Utc::now();
        let session_id = fresh_session_id(&dir);
        Self {
            dir,
            session_id,
            created: now,
            last_activity: now,
            last_provider: None,
            messages: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn last_provider(&self) -> Option<&str> {
        self.last_provider.as_deref()
    }

    /// Append a message. Timestamps are forced non-decreasing within the
    /// session even when the wall clock steps backwards.
    pub fn append(&mut self, role: Role, content: &str, provider: Option<&str>) {
        let mut timestamp = Utc::now();
        if let Some(last) = self.messages.last() {
            timestamp = timestamp.max(last.timestamp);
        }
        if let Some(provider) = provider {
            self.last_provider = Some(provider.to_string());
        }
        self.last_activity = timestamp;
        self.messages.push(Message {
            role,
            content: content.to_string(),
            timestamp,
            provider: provider.map(str::to_string),
        });
    }

    /// Full history, copied out.
    pub fn history(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Messages strictly after `since`.
    pub fn tail_since(&self, since: DateTime<Utc>) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|message| message.timestamp > since)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Keep only the last `n` messages.
    pub fn trim_to_last(&mut self, n: usize) {
        let len = self.messages.len();
        if len > n {
            self.messages.drain(..len - n);
        }
    }

    /// Trim to an approximate token budget, keeping the most recent
    /// messages. Tokens are estimated as `content.len() / 4`.
    pub fn trim_to_token_budget(&mut self, max_tokens: usize) {
        let keep = budget_suffix(&self.messages, max_tokens);
        let len = self.messages.len();
        if keep < len {
            self.messages.drain(..len - keep);
        }
    }

    /// Budget-limited view of the history without mutating the session.
    pub fn budgeted_history(&self, max_tokens: usize) -> Vec<Message> {
        let keep = budget_suffix(&self.messages, max_tokens);
        self.messages[self.messages.len() - keep..].to_vec()
    }

    /// Persist the current session. A session with no messages is skipped.
    pub fn save(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let document = SessionDocument {
            session_id: self.session_id.clone(),
            created: self.created,
            last_activity: self.last_activity,
            last_provider: self.last_provider.clone(),
            message_count: self.messages.len(),
            messages: self.messages.clone(),
        };
        let json = serde_json::to_string_pretty(&document)?;

        // Write-then-rename so readers never observe a torn document.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(self.session_path(&self.session_id))
            .map_err(|e| MagusErr::Io(e.error))?;
        Ok(())
    }

    /// Flush the current session (when non-empty) and start a new one.
    /// Returns the new session id.
    pub fn start_session(&mut self) -> Result<String> {
        self.save()?;
        let now = Utc::now();
        self.session_id = fresh_session_id(&self.dir);
        self.created = now;
        self.last_activity = now;
        self.last_provider = None;
        self.messages.clear();
        Ok(self.session_id.clone())
    }

    /// Stored sessions, newest first by last modification.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut sessions: Vec<(std::time::SystemTime, SessionSummary)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!("skipping unreadable session {}: {e}", path.display());
                    continue;
                }
            };
            let document: SessionDocument = match serde_json::from_str(&raw) {
                Ok(document) => document,
                Err(e) => {
                    tracing::warn!("skipping malformed session {}: {e}", path.display());
                    continue;
                }
            };
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            sessions.push((
                modified,
                SessionSummary {
                    session_id: document.session_id,
                    message_count: document.messages.len(),
                    last_activity: document.last_activity,
                },
            ));
        }
        sessions.sort_by(|a, b| b.0.cmp(&a.0));
        sessions.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Switch to a stored session, flushing the current one first.
    pub fn load_session(&mut self, session_id: &str) -> Result<()> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Err(MagusErr::InvalidArgument(format!(
                "unknown session: {session_id}"
            )));
        }
        let raw = fs::read_to_string(&path)?;
        let document: SessionDocument = serde_json::from_str(&raw)?;
        if document.message_count != document.messages.len() {
            tracing::warn!(
                "session {session_id} message_count ({}) disagrees with messages ({})",
                document.message_count,
                document.messages.len()
            );
        }
        self.save()?;
        self.session_id = document.session_id;
        self.created = document.created;
        self.last_activity = document.last_activity;
        self.last_provider = document.last_provider;
        self.messages = document.messages;
        Ok(())
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }
}

/// Number of trailing messages that fit in `max_tokens`. At least one
/// message is kept so a turn always carries context.
fn budget_suffix(messages: &[Message], max_tokens: usize) -> usize {
    let mut used = 0usize;
    let mut keep = 0usize;
    for message in messages.iter().rev() {
        let estimate = message.content.len() / 4;
        if keep > 0 && used + estimate > max_tokens {
            break;
        }
        used += estimate;
        keep += 1;
    }
    keep.min(messages.len())
}

/// Session ids are generated from local wall-clock time. A numeric suffix
/// disambiguates restarts within the same second.
fn fresh_session_id(dir: &Path) -> String {
    let base = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let mut candidate = base.clone();
    let mut counter = 1;
    while dir.join(format!("{candidate}.json")).exists() {
        counter += 1;
        candidate = format!("{base}-{counter}");
    }
    candidate
}
