// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session – persistence layer for agent conversations.
//!
//! Sessions are stored as append-only JSONL files, one JSON object per
//! line.  The first line is the session header; every other line is a typed
//! entry linked to its predecessor through `parent_id`:
//!
//! ```text
//! {"type":"header","version":1,"id":"...","timestamp":"...","cwd":"..."}
//! {"type":"message","id":"a1b2c3d4","parent_id":null,"timestamp":"...","message":{...}}
//! {"type":"message","id":"e5f6a7b8","parent_id":"a1b2c3d4","timestamp":"...","message":{...}}
//! ```
//!
//! Writing is deferred until the log holds at least one assistant message,
//! so user-only sessions from aborted prompts leave no file behind.  The
//! log is never rewritten after that first flush: compaction and settings
//! changes are new entries, not edits.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use runa_config::CONFIG_DIR_NAME;
use runa_model::{Message, StopReason, Usage};

use crate::compact::COMPACTION_QUESTION;

pub const CURRENT_VERSION: u32 = 1;

/// First line of every session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "header")]
pub struct SessionHeader {
    pub version: u32,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub cwd: String,
}

/// Fields shared by every entry kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One line of the session log, discriminated by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    Message {
        #[serde(flatten)]
        meta: EntryMeta,
        message: Message,
    },
    ThinkingLevelChange {
        #[serde(flatten)]
        meta: EntryMeta,
        thinking_level: String,
    },
    ModelChange {
        #[serde(flatten)]
        meta: EntryMeta,
        provider: String,
        model_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,
    },
    Compaction {
        #[serde(flatten)]
        meta: EntryMeta,
        summary: String,
        first_kept_entry_id: String,
        tokens_before: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Map<String, Value>>,
    },
    CustomMessage {
        #[serde(flatten)]
        meta: EntryMeta,
        custom_type: String,
        content: String,
        display: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Map<String, Value>>,
    },
    SessionInfo {
        #[serde(flatten)]
        meta: EntryMeta,
        #[serde(default)]
        name: Option<String>,
    },
}

impl SessionEntry {
    pub fn meta(&self) -> &EntryMeta {
        match self {
            SessionEntry::Message { meta, .. }
            | SessionEntry::ThinkingLevelChange { meta, .. }
            | SessionEntry::ModelChange { meta, .. }
            | SessionEntry::Compaction { meta, .. }
            | SessionEntry::CustomMessage { meta, .. }
            | SessionEntry::SessionInfo { meta, .. } => meta,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta().id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.meta().parent_id.as_deref()
    }
}

/// Digest of a stored session, produced by a light scan for listing.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub path: PathBuf,
    pub cwd: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub message_count: usize,
    pub first_message: String,
}

/// Append-only, single-writer conversation log with in-memory indexing.
#[derive(Debug)]
pub struct Session {
    id: String,
    cwd: String,
    session_file: Option<PathBuf>,
    persist: bool,
    header: Option<SessionHeader>,
    entries: Vec<SessionEntry>,
    by_id: HashMap<String, usize>,
    leaf_id: Option<String>,
    // Fallbacks reported until the first matching change entry exists.
    initial_provider: Option<String>,
    initial_model_id: Option<String>,
    initial_thinking_level: String,
    flushed: bool,
    has_assistant: bool,
}

impl Session {
    // ── Construction ──────────────────────────────────────────────────────────

    /// Directory holding this working directory's session files.
    pub fn sessions_dir(cwd: &str) -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(CONFIG_DIR_NAME)
            .join("sessions")
            .join(sanitize_cwd(cwd))
    }

    fn new(id: String, cwd: String, session_file: Option<PathBuf>, persist: bool) -> Self {
        Self {
            id,
            cwd,
            session_file,
            persist,
            header: None,
            entries: Vec::new(),
            by_id: HashMap::new(),
            leaf_id: None,
            initial_provider: None,
            initial_model_id: None,
            initial_thinking_level: "medium".into(),
            flushed: false,
            has_assistant: false,
        }
    }

    /// Create a new session whose file will live in the default sessions
    /// directory for `cwd`.  Nothing is written until the first assistant
    /// message is appended.
    pub fn create(cwd: &str) -> Self {
        Self::create_in(cwd, &Self::sessions_dir(cwd))
    }

    /// Like [`create`](Self::create) but with an explicit sessions directory.
    pub fn create_in(cwd: &str, sessions_dir: &Path) -> Self {
        let id = Uuid::new_v4().to_string();
        let timestamp = Utc::now();
        let file_name = format!("{}_{}.jsonl", timestamp.format("%Y-%m-%dT%H-%M-%S"), id);
        let mut session = Self::new(
            id.clone(),
            cwd.to_string(),
            Some(sessions_dir.join(file_name)),
            true,
        );
        session.header = Some(SessionHeader {
            version: CURRENT_VERSION,
            id,
            timestamp,
            cwd: cwd.to_string(),
        });
        session
    }

    /// Create a session that never touches the filesystem.
    pub fn in_memory(cwd: &str) -> Self {
        let id = Uuid::new_v4().to_string();
        let mut session = Self::new(id.clone(), cwd.to_string(), None, false);
        session.header = Some(SessionHeader {
            version: CURRENT_VERSION,
            id,
            timestamp: Utc::now(),
            cwd: cwd.to_string(),
        });
        session
    }

    /// Set the provider/model reported until a model-change entry exists.
    pub fn with_initial_model(mut self, provider: &str, model_id: &str) -> Self {
        self.initial_provider = Some(provider.to_string());
        self.initial_model_id = Some(model_id.to_string());
        self
    }

    /// Set the thinking level reported until a change entry exists.
    pub fn with_initial_thinking_level(mut self, level: &str) -> Self {
        self.initial_thinking_level = level.to_string();
        self
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn session_file(&self) -> Option<&Path> {
        self.session_file.as_deref()
    }

    pub fn leaf_id(&self) -> Option<&str> {
        self.leaf_id.as_deref()
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn get_entry(&self, entry_id: &str) -> Option<&SessionEntry> {
        self.by_id.get(entry_id).map(|&idx| &self.entries[idx])
    }

    // ── Appending ─────────────────────────────────────────────────────────────

    fn generate_entry_id(&self) -> String {
        for _ in 0..100 {
            let id = Uuid::new_v4().simple().to_string()[..8].to_string();
            if !self.by_id.contains_key(&id) {
                return id;
            }
        }
        Uuid::new_v4().simple().to_string()
    }

    fn next_meta(&self) -> EntryMeta {
        EntryMeta {
            id: self.generate_entry_id(),
            parent_id: self.leaf_id.clone(),
            timestamp: Utc::now(),
        }
    }

    fn append_entry(&mut self, entry: SessionEntry) -> anyhow::Result<String> {
        let id = entry.id().to_string();
        if let SessionEntry::Message { message, .. } = &entry {
            if message.is_assistant() {
                self.has_assistant = true;
            }
        }
        self.by_id.insert(id.clone(), self.entries.len());
        self.leaf_id = Some(id.clone());
        self.entries.push(entry);
        self.persist_last()?;
        Ok(id)
    }

    pub fn append_message(&mut self, message: Message) -> anyhow::Result<String> {
        let entry = SessionEntry::Message { meta: self.next_meta(), message };
        self.append_entry(entry)
    }

    pub fn append_thinking_level_change(&mut self, thinking_level: &str) -> anyhow::Result<String> {
        let entry = SessionEntry::ThinkingLevelChange {
            meta: self.next_meta(),
            thinking_level: thinking_level.to_string(),
        };
        self.append_entry(entry)
    }

    pub fn append_model_change(
        &mut self,
        provider: &str,
        model_id: &str,
        base_url: Option<&str>,
    ) -> anyhow::Result<String> {
        let entry = SessionEntry::ModelChange {
            meta: self.next_meta(),
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            base_url: base_url.map(str::to_string),
        };
        self.append_entry(entry)
    }

    pub fn append_compaction(
        &mut self,
        summary: &str,
        first_kept_entry_id: &str,
        tokens_before: u64,
        details: Option<serde_json::Map<String, Value>>,
    ) -> anyhow::Result<String> {
        let entry = SessionEntry::Compaction {
            meta: self.next_meta(),
            summary: summary.to_string(),
            first_kept_entry_id: first_kept_entry_id.to_string(),
            tokens_before,
            details,
        };
        self.append_entry(entry)
    }

    pub fn append_custom_message(
        &mut self,
        custom_type: &str,
        content: &str,
        display: bool,
        details: Option<serde_json::Map<String, Value>>,
    ) -> anyhow::Result<String> {
        let entry = SessionEntry::CustomMessage {
            meta: self.next_meta(),
            custom_type: custom_type.to_string(),
            content: content.to_string(),
            display,
            details,
        };
        self.append_entry(entry)
    }

    pub fn append_session_info(&mut self, name: &str) -> anyhow::Result<String> {
        let entry = SessionEntry::SessionInfo {
            meta: self.next_meta(),
            name: Some(name.to_string()),
        };
        self.append_entry(entry)
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    fn persist_last(&mut self) -> anyhow::Result<()> {
        if !self.persist {
            return Ok(());
        }
        let Some(path) = self.session_file.clone() else {
            return Ok(());
        };
        // Deferred first flush: no file until an assistant message exists.
        if !self.has_assistant {
            return Ok(());
        }

        if !self.flushed {
            self.write_all(&path)?;
            self.flushed = true;
        } else if let Some(entry) = self.entries.last() {
            let line = serde_json::to_string(entry)?;
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .with_context(|| format!("appending to {}", path.display()))?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    fn write_all(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut out = String::new();
        if let Some(header) = &self.header {
            out.push_str(&serde_json::to_string(header)?);
            out.push('\n');
        }
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        fs::write(path, out).with_context(|| format!("writing {}", path.display()))
    }

    // ── Views ─────────────────────────────────────────────────────────────────

    /// Messages for the next provider request.  When the log contains a
    /// compaction entry, the view opens with a synthetic exchange carrying
    /// the most recent summary, followed by every message after that
    /// compaction.
    pub fn messages(&self) -> Vec<Message> {
        let last_compaction = self.entries.iter().rev().find_map(|e| match e {
            SessionEntry::Compaction { meta, summary, .. } => {
                Some((meta.id.clone(), summary.clone()))
            }
            _ => None,
        });

        let Some((compaction_id, summary)) = last_compaction else {
            return self.all_messages();
        };

        let mut result = vec![
            Message::user(COMPACTION_QUESTION),
            Message::assistant_text(summary),
        ];
        let mut past_compaction = false;
        for entry in &self.entries {
            match entry {
                SessionEntry::Compaction { meta, .. } if meta.id == compaction_id => {
                    past_compaction = true;
                }
                SessionEntry::Message { message, .. } if past_compaction => {
                    result.push(message.clone());
                }
                _ => {}
            }
        }
        result
    }

    /// All messages regardless of compaction (for UI rendering and summary
    /// generation).
    pub fn all_messages(&self) -> Vec<Message> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                SessionEntry::Message { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Latest assistant text, ignoring thinking and tool-call parts.
    /// Empty interrupted messages are skipped entirely.
    pub fn get_last_assistant_text(&self) -> Option<String> {
        for message in self.messages().iter().rev() {
            if let Message::Assistant { content, stop_reason, .. } = message {
                if *stop_reason == Some(StopReason::Interrupted) && content.is_empty() {
                    continue;
                }
                let text = message
                    .assistant_text_content()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                return if text.is_empty() { None } else { Some(text) };
            }
        }
        None
    }

    /// Usage of the most recent assistant message, for the overflow check.
    pub fn last_assistant_usage(&self) -> Option<Usage> {
        self.entries
            .iter()
            .rev()
            .find_map(|e| match e {
                SessionEntry::Message { message: Message::Assistant { usage, .. }, .. } => {
                    Some(*usage)
                }
                _ => None,
            })
            .flatten()
    }

    // ── Derived properties ────────────────────────────────────────────────────

    pub fn name(&self) -> Option<String> {
        self.entries.iter().rev().find_map(|e| match e {
            SessionEntry::SessionInfo { name: Some(name), .. } => Some(name.clone()),
            _ => None,
        })
    }

    pub fn thinking_level(&self) -> String {
        self.entries
            .iter()
            .rev()
            .find_map(|e| match e {
                SessionEntry::ThinkingLevelChange { thinking_level, .. } => {
                    Some(thinking_level.clone())
                }
                _ => None,
            })
            .unwrap_or_else(|| self.initial_thinking_level.clone())
    }

    pub fn model(&self) -> Option<(String, String, Option<String>)> {
        let from_entries = self.entries.iter().rev().find_map(|e| match e {
            SessionEntry::ModelChange { provider, model_id, base_url, .. } => {
                Some((provider.clone(), model_id.clone(), base_url.clone()))
            }
            _ => None,
        });
        from_entries.or_else(|| {
            match (&self.initial_provider, &self.initial_model_id) {
                (Some(p), Some(m)) => Some((p.clone(), m.clone(), None)),
                _ => None,
            }
        })
    }

    /// Record a model change; no-op when the current model already matches.
    pub fn set_model(
        &mut self,
        provider: &str,
        model_id: &str,
        base_url: Option<&str>,
    ) -> anyhow::Result<()> {
        if let Some((p, m, b)) = self.model() {
            if p == provider && m == model_id && b.as_deref() == base_url {
                return Ok(());
            }
        }
        self.append_model_change(provider, model_id, base_url)?;
        Ok(())
    }

    /// Record a thinking-level change; no-op when unchanged.
    pub fn set_thinking_level(&mut self, thinking_level: &str) -> anyhow::Result<()> {
        if self.thinking_level() == thinking_level {
            return Ok(());
        }
        self.append_thinking_level_change(thinking_level)?;
        Ok(())
    }

    // ── Loading & listing ─────────────────────────────────────────────────────

    /// Read a session back from disk.  Blank lines and lines that fail to
    /// parse are skipped; a missing header is a hard failure.
    pub fn load(path: &Path) -> anyhow::Result<Session> {
        let file = fs::File::open(path)
            .with_context(|| format!("Session file not found: {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut header: Option<SessionHeader> = None;
        let mut entries: Vec<SessionEntry> = Vec::new();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            match value.get("type").and_then(Value::as_str) {
                Some("header") => {
                    if let Ok(h) = serde_json::from_value::<SessionHeader>(value.clone()) {
                        header = Some(h);
                    }
                }
                Some(_) => {
                    if let Ok(entry) = serde_json::from_value::<SessionEntry>(value.clone()) {
                        entries.push(entry);
                    }
                }
                None => {}
            }
        }

        let Some(header) = header else {
            bail!("Invalid session file (no header): {}", path.display());
        };

        let mut session = Self::new(
            header.id.clone(),
            header.cwd.clone(),
            Some(path.to_path_buf()),
            true,
        );
        session.by_id = entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.id().to_string(), idx))
            .collect();
        session.leaf_id = entries.last().map(|e| e.id().to_string());
        session.has_assistant = entries.iter().any(|e| {
            matches!(e, SessionEntry::Message { message, .. } if message.is_assistant())
        });
        session.entries = entries;
        session.header = Some(header);
        session.flushed = true;
        Ok(session)
    }

    /// Resume the most recently modified session for `cwd`, or create a new
    /// one when none exist.
    pub fn continue_recent(cwd: &str) -> anyhow::Result<Session> {
        Self::continue_recent_in(cwd, &Self::sessions_dir(cwd))
    }

    pub fn continue_recent_in(cwd: &str, sessions_dir: &Path) -> anyhow::Result<Session> {
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        if let Ok(read) = fs::read_dir(sessions_dir) {
            for entry in read.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                    continue;
                };
                if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                    newest = Some((modified, path));
                }
            }
        }
        match newest {
            Some((_, path)) => Self::load(&path),
            None => Ok(Self::create_in(cwd, sessions_dir)),
        }
    }

    /// Resume by exact session id or unique prefix (case-insensitive).
    pub fn continue_by_id(cwd: &str, session_id: &str) -> anyhow::Result<Session> {
        Self::continue_by_id_in_dir(&Self::sessions_dir(cwd), session_id)
    }

    pub fn continue_by_id_in_dir(sessions_dir: &Path, session_id: &str) -> anyhow::Result<Session> {
        let normalized = session_id.trim().to_lowercase();
        if normalized.is_empty() {
            bail!("Session ID cannot be empty");
        }

        let sessions = Self::list_in_dir(sessions_dir);

        let exact: Vec<&SessionInfo> = sessions
            .iter()
            .filter(|s| s.id.to_lowercase() == normalized)
            .collect();
        if exact.len() == 1 {
            return Self::load(&exact[0].path);
        }

        let prefixed: Vec<&SessionInfo> = sessions
            .iter()
            .filter(|s| s.id.to_lowercase().starts_with(&normalized))
            .collect();
        match prefixed.len() {
            1 => Self::load(&prefixed[0].path),
            0 => bail!("Session not found: {session_id}"),
            _ => bail!("Session ID prefix is ambiguous: {session_id}"),
        }
    }

    /// List stored sessions for `cwd`, most recently modified first.
    pub fn list(cwd: &str) -> Vec<SessionInfo> {
        Self::list_in_dir(&Self::sessions_dir(cwd))
    }

    pub fn list_in_dir(sessions_dir: &Path) -> Vec<SessionInfo> {
        let Ok(read) = fs::read_dir(sessions_dir) else {
            return Vec::new();
        };
        let mut sessions: Vec<SessionInfo> = Vec::new();
        for entry in read.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Ok(Some(info)) = Self::build_session_info(&path) {
                sessions.push(info);
            }
        }
        sessions.sort_by(|a, b| b.modified.cmp(&a.modified));
        sessions
    }

    /// Light scan: header plus message count and first user message, without
    /// deserializing full entries.
    pub fn build_session_info(path: &Path) -> anyhow::Result<Option<SessionInfo>> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);

        let mut header: Option<SessionHeader> = None;
        let mut message_count = 0usize;
        let mut first_message = String::new();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            match value.get("type").and_then(Value::as_str) {
                Some("header") => {
                    if let Ok(h) = serde_json::from_value::<SessionHeader>(value.clone()) {
                        header = Some(h);
                    }
                }
                Some("message") => {
                    message_count += 1;
                    if first_message.is_empty() {
                        let message = &value["message"];
                        if message["role"] == "user" {
                            first_message = first_user_text(&message["content"]);
                        }
                    }
                }
                _ => {}
            }
        }

        let Some(header) = header else {
            return Ok(None);
        };

        let modified: DateTime<Utc> = fs::metadata(path)?.modified()?.into();
        Ok(Some(SessionInfo {
            id: header.id,
            path: path.to_path_buf(),
            cwd: header.cwd,
            created: header.timestamp,
            modified,
            message_count,
            first_message: if first_message.is_empty() {
                "(no messages)".into()
            } else {
                first_message
            },
        }))
    }
}

/// Path separators become dashes so the cwd can serve as a directory name.
fn sanitize_cwd(cwd: &str) -> String {
    cwd.replace(['/', '\\'], "-")
        .trim_matches('-')
        .to_string()
}

/// First 100 characters of a user message's text, for listing digests.
fn first_user_text(content: &Value) -> String {
    let text = match content {
        Value::String(s) => s.as_str(),
        Value::Array(parts) => parts
            .first()
            .filter(|p| p["type"] == "text")
            .and_then(|p| p["text"].as_str())
            .unwrap_or(""),
        _ => "",
    };
    text.chars().take(100).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_model::{AssistantPart, ContentPart, Message, StopReason, Usage};
    use serde_json::json;

    fn user_message() -> Message {
        Message::user("Hello, how are you?")
    }

    fn assistant_message() -> Message {
        Message::Assistant {
            content: vec![AssistantPart::Text { text: "I'm doing well, thanks!".into() }],
            usage: Some(Usage { input_tokens: 10, output_tokens: 5, ..Default::default() }),
            stop_reason: Some(StopReason::Stop),
        }
    }

    fn session_in(dir: &tempfile::TempDir) -> Session {
        Session::create_in("/test/project", dir.path())
    }

    #[test]
    fn round_trip_basic_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);

        let id1 = session.append_message(user_message()).unwrap();
        let id2 = session.append_message(assistant_message()).unwrap();
        assert_ne!(id1, id2);
        assert_eq!(session.leaf_id(), Some(id2.as_str()));

        let path = session.session_file().unwrap();
        assert!(path.exists());

        let loaded = Session::load(path).unwrap();
        assert_eq!(loaded.id(), session.id());
        assert_eq!(loaded.cwd(), "/test/project");
        assert_eq!(loaded.entries(), session.entries());
        assert_eq!(loaded.leaf_id(), session.leaf_id());

        let messages = loaded.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], assistant_message());
    }

    #[test]
    fn round_trip_all_entry_types() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);

        let msg_id = session.append_message(user_message()).unwrap();
        session.append_thinking_level_change("high").unwrap();
        session.append_model_change("openai", "gpt-4", None).unwrap();
        let mut details = serde_json::Map::new();
        details.insert("removed".into(), json!(5));
        session
            .append_compaction("Compacted session", &msg_id, 1000, Some(details))
            .unwrap();
        session
            .append_custom_message("error", "Something went wrong", true, None)
            .unwrap();
        let info_id = session.append_session_info("My Test Session").unwrap();
        session.append_message(assistant_message()).unwrap();

        assert_eq!(session.entries().len(), 7);
        assert_ne!(session.leaf_id(), Some(info_id.as_str()));

        let loaded = Session::load(session.session_file().unwrap()).unwrap();
        assert_eq!(loaded.entries().len(), 7);

        let entries = loaded.entries();
        assert!(matches!(&entries[0], SessionEntry::Message { .. }));
        assert!(matches!(
            &entries[1],
            SessionEntry::ThinkingLevelChange { thinking_level, .. } if thinking_level == "high"
        ));
        assert!(matches!(
            &entries[2],
            SessionEntry::ModelChange { provider, model_id, .. }
                if provider == "openai" && model_id == "gpt-4"
        ));
        match &entries[3] {
            SessionEntry::Compaction { summary, tokens_before, details, .. } => {
                assert_eq!(summary, "Compacted session");
                assert_eq!(*tokens_before, 1000);
                assert_eq!(details.as_ref().unwrap()["removed"], json!(5));
            }
            other => panic!("expected compaction, got {other:?}"),
        }
        assert!(matches!(
            &entries[4],
            SessionEntry::CustomMessage { custom_type, content, .. }
                if custom_type == "error" && content == "Something went wrong"
        ));
        assert!(matches!(
            &entries[5],
            SessionEntry::SessionInfo { name: Some(name), .. } if name == "My Test Session"
        ));
        assert!(matches!(
            &entries[6],
            SessionEntry::Message { message, .. } if message.is_assistant()
        ));
    }

    #[test]
    fn parent_ids_form_a_single_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);

        let id1 = session.append_message(user_message()).unwrap();
        let id2 = session.append_message(assistant_message()).unwrap();
        session.append_message(Message::user("Third")).unwrap();

        let entries = session.entries();
        assert_eq!(entries[0].parent_id(), None);
        assert_eq!(entries[1].parent_id(), Some(id1.as_str()));
        assert_eq!(entries[2].parent_id(), Some(id2.as_str()));

        let loaded = Session::load(session.session_file().unwrap()).unwrap();
        let entries = loaded.entries();
        assert_eq!(entries[0].parent_id(), None);
        assert_eq!(entries[1].parent_id(), Some(id1.as_str()));
        assert_eq!(entries[2].parent_id(), Some(id2.as_str()));
    }

    #[test]
    fn session_properties_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::create_in("/test/project", dir.path())
            .with_initial_model("anthropic", "claude-3-opus")
            .with_initial_thinking_level("high");

        assert_eq!(
            session.model(),
            Some(("anthropic".into(), "claude-3-opus".into(), None))
        );
        assert_eq!(session.thinking_level(), "high");
        assert_eq!(session.name(), None);

        session.set_model("openai", "gpt-4", None).unwrap();
        session.set_thinking_level("low").unwrap();
        session.append_session_info("Test Session").unwrap();
        session.append_message(user_message()).unwrap();
        session.append_message(assistant_message()).unwrap();

        let loaded = Session::load(session.session_file().unwrap()).unwrap();
        assert_eq!(loaded.model(), Some(("openai".into(), "gpt-4".into(), None)));
        assert_eq!(loaded.thinking_level(), "low");
        assert_eq!(loaded.name(), Some("Test Session".into()));
    }

    #[test]
    fn set_model_is_noop_when_unchanged() {
        let mut session = Session::in_memory("/p").with_initial_model("openai", "gpt-4");
        session.set_model("openai", "gpt-4", None).unwrap();
        assert!(session.entries().is_empty());

        session.set_model("openai", "gpt-4", Some("http://localhost:8080/v1")).unwrap();
        assert_eq!(session.entries().len(), 1);
        assert_eq!(
            session.model(),
            Some(("openai".into(), "gpt-4".into(), Some("http://localhost:8080/v1".into())))
        );
    }

    #[test]
    fn set_thinking_level_is_noop_when_unchanged() {
        let mut session = Session::in_memory("/p");
        session.set_thinking_level("medium").unwrap();
        assert!(session.entries().is_empty());
        session.set_thinking_level("high").unwrap();
        assert_eq!(session.entries().len(), 1);
    }

    #[test]
    fn get_entry_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        let id1 = session.append_message(Message::user("First")).unwrap();
        session.append_message(Message::user("Second")).unwrap();
        session.append_message(assistant_message()).unwrap();

        let loaded = Session::load(session.session_file().unwrap()).unwrap();
        match loaded.get_entry(&id1) {
            Some(SessionEntry::Message { message, .. }) => {
                assert_eq!(message, &Message::user("First"));
            }
            other => panic!("expected message entry, got {other:?}"),
        }
        assert!(loaded.get_entry("ffffffff").is_none());
    }

    #[test]
    fn in_memory_mode_never_writes() {
        let mut session = Session::in_memory("/test/project");
        session.append_message(user_message()).unwrap();
        session.append_message(assistant_message()).unwrap();
        assert!(session.session_file().is_none());
        assert_eq!(session.messages().len(), 2);
    }

    #[test]
    fn persistence_deferred_until_assistant_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        let path = session.session_file().unwrap().to_path_buf();

        assert!(!path.exists());
        session.append_message(user_message()).unwrap();
        assert!(!path.exists(), "user-only session must leave no trace");

        session.append_message(assistant_message()).unwrap();
        assert!(path.exists());

        let loaded = Session::load(&path).unwrap();
        assert_eq!(loaded.messages().len(), 2);
    }

    #[test]
    fn file_format_is_header_plus_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        session.append_message(user_message()).unwrap();
        session.append_thinking_level_change("high").unwrap();
        session.append_message(assistant_message()).unwrap();

        let text = fs::read_to_string(session.session_file().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);

        let header: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["type"], "header");
        assert_eq!(header["version"], 1);
        assert!(header["id"].is_string());
        assert!(header["timestamp"].is_string());

        for line in &lines[1..] {
            let v: Value = serde_json::from_str(line).unwrap();
            assert!(v["type"].is_string());
            assert!(v["id"].is_string());
            assert!(v["timestamp"].is_string());
        }
    }

    #[test]
    fn appends_after_first_flush_add_single_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        session.append_message(user_message()).unwrap();
        session.append_message(assistant_message()).unwrap();
        let lines_before = fs::read_to_string(session.session_file().unwrap())
            .unwrap()
            .lines()
            .count();

        session.append_message(Message::user("again")).unwrap();
        let lines_after = fs::read_to_string(session.session_file().unwrap())
            .unwrap()
            .lines()
            .count();
        assert_eq!(lines_after, lines_before + 1);
    }

    #[test]
    fn malformed_lines_are_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        session.append_message(user_message()).unwrap();
        session.append_message(assistant_message()).unwrap();

        let path = session.session_file().unwrap().to_path_buf();
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str("not json at all\n\n{\"type\":\"wibble\",\"id\":\"x\"}\n");
        fs::write(&path, text).unwrap();

        let loaded = Session::load(&path).unwrap();
        assert_eq!(loaded.entries().len(), 2);
    }

    #[test]
    fn load_without_header_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jsonl");
        fs::write(&path, "{\"type\":\"message\"}\n").unwrap();
        let err = Session::load(&path).unwrap_err();
        assert!(err.to_string().contains("no header"));
    }

    #[test]
    fn entry_ids_are_unique_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(session.append_message(Message::user(format!("Message {i}"))).unwrap());
        }
        session.append_message(assistant_message()).unwrap();

        let unique: std::collections::HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), 10);

        let loaded = Session::load(session.session_file().unwrap()).unwrap();
        let loaded_ids: Vec<&str> = loaded.entries().iter().map(|e| e.id()).collect();
        assert_eq!(loaded_ids.len(), 11);
        assert_eq!(&loaded_ids[..10], &ids.iter().map(String::as_str).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn round_trip_tool_calls_and_mixed_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);

        session.append_message(Message::user("Simple text")).unwrap();
        let msg = Message::Assistant {
            content: vec![
                AssistantPart::Thinking { thinking: "I need to read the file".into(), signature: None },
                AssistantPart::Text { text: "I'll read the file for you.".into() },
                AssistantPart::ToolCall {
                    id: "tool-1".into(),
                    name: "read".into(),
                    arguments: json!({ "path": "file.txt" }),
                },
            ],
            usage: Some(Usage { input_tokens: 5, output_tokens: 15, ..Default::default() }),
            stop_reason: Some(StopReason::ToolUse),
        };
        session.append_message(msg.clone()).unwrap();
        session
            .append_message(Message::tool_result(
                "tool-1",
                "read",
                vec![ContentPart::text("contents")],
                None,
                false,
            ))
            .unwrap();

        let loaded = Session::load(session.session_file().unwrap()).unwrap();
        let messages = loaded.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Message::user("Simple text"));
        assert_eq!(messages[1], msg);
        match &messages[2] {
            Message::ToolResult { tool_call_id, is_error, .. } => {
                assert_eq!(tool_call_id, "tool-1");
                assert!(!is_error);
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn last_assistant_text_ignores_thinking_and_tools() {
        let mut session = Session::in_memory("/test/project");
        session.append_message(Message::user("Hello")).unwrap();
        session
            .append_message(Message::Assistant {
                content: vec![
                    AssistantPart::Thinking { thinking: "Reasoning...".into(), signature: None },
                    AssistantPart::Text { text: "Final answer".into() },
                    AssistantPart::ToolCall {
                        id: "tool-1".into(),
                        name: "bash".into(),
                        arguments: json!({ "command": "pwd" }),
                    },
                ],
                usage: None,
                stop_reason: None,
            })
            .unwrap();

        assert_eq!(session.get_last_assistant_text().as_deref(), Some("Final answer"));
    }

    #[test]
    fn last_assistant_text_none_when_latest_has_no_text() {
        let mut session = Session::in_memory("/test/project");
        session
            .append_message(Message::Assistant {
                content: vec![AssistantPart::Thinking {
                    thinking: "Only thinking".into(),
                    signature: None,
                }],
                usage: None,
                stop_reason: None,
            })
            .unwrap();
        assert_eq!(session.get_last_assistant_text(), None);
    }

    #[test]
    fn last_assistant_text_skips_empty_interrupted_message() {
        let mut session = Session::in_memory("/test/project");
        session.append_message(Message::assistant_text("earlier answer")).unwrap();
        session
            .append_message(Message::Assistant {
                content: vec![],
                usage: None,
                stop_reason: Some(StopReason::Interrupted),
            })
            .unwrap();
        assert_eq!(session.get_last_assistant_text().as_deref(), Some("earlier answer"));
    }

    #[test]
    fn compacted_view_splices_summary_exchange() {
        let mut session = Session::in_memory("/test/project");
        session.append_message(Message::user("old question")).unwrap();
        session.append_message(Message::assistant_text("old answer")).unwrap();
        let leaf = session.leaf_id().unwrap().to_string();
        session.append_compaction("we fixed the parser", &leaf, 1234, None).unwrap();
        session.append_message(Message::user("new question")).unwrap();

        let view = session.messages();
        assert_eq!(view.len(), 3);
        assert_eq!(view[0], Message::user(COMPACTION_QUESTION));
        assert_eq!(view[1], Message::assistant_text("we fixed the parser"));
        assert_eq!(view[2], Message::user("new question"));

        // The stored history is untouched.
        assert_eq!(session.all_messages().len(), 3);
        assert_eq!(session.entries().len(), 4);
    }

    #[test]
    fn latest_of_multiple_compactions_wins() {
        let mut session = Session::in_memory("/p");
        session.append_message(Message::user("q1")).unwrap();
        session.append_compaction("first summary", "x", 10, None).unwrap();
        session.append_message(Message::user("q2")).unwrap();
        session.append_compaction("second summary", "y", 20, None).unwrap();
        session.append_message(Message::user("q3")).unwrap();

        let view = session.messages();
        assert_eq!(view[1], Message::assistant_text("second summary"));
        assert_eq!(view[2], Message::user("q3"));
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn list_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        session
            .append_message(Message::user("x".repeat(150)))
            .unwrap();
        session.append_message(assistant_message()).unwrap();

        let sessions = Session::list_in_dir(dir.path());
        assert_eq!(sessions.len(), 1);
        let info = &sessions[0];
        assert_eq!(info.id, session.id());
        assert_eq!(info.cwd, "/test/project");
        assert_eq!(info.message_count, 2);
        assert_eq!(info.first_message.chars().count(), 100);
    }

    #[test]
    fn continue_by_id_exact_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        session.append_message(assistant_message()).unwrap();

        let resumed = Session::continue_by_id_in_dir(dir.path(), session.id()).unwrap();
        assert_eq!(resumed.id(), session.id());

        let prefix = &session.id()[..8];
        let resumed = Session::continue_by_id_in_dir(dir.path(), prefix).unwrap();
        assert_eq!(resumed.id(), session.id());
    }

    #[test]
    fn continue_by_id_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(&dir);
        session.append_message(assistant_message()).unwrap();

        let err = Session::continue_by_id_in_dir(dir.path(), "does-not-exist").unwrap_err();
        assert!(err.to_string().contains("Session not found"));
    }

    fn write_fake_session(dir: &Path, id: &str) {
        let line = format!(
            "{{\"type\":\"header\",\"version\":1,\"id\":\"{id}\",\
             \"timestamp\":\"2024-01-01T00:00:00Z\",\"cwd\":\"/p\"}}\n"
        );
        fs::write(dir.join(format!("2024-01-01T00-00-00_{id}.jsonl")), line).unwrap();
    }

    #[test]
    fn continue_by_id_ambiguous_prefix_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_fake_session(dir.path(), "aa11aa11-0000-0000-0000-000000000000");
        write_fake_session(dir.path(), "aa22aa22-0000-0000-0000-000000000000");

        let err = Session::continue_by_id_in_dir(dir.path(), "aa").unwrap_err();
        assert!(err.to_string().contains("ambiguous"));

        // A longer, unique prefix still resolves.
        let resumed = Session::continue_by_id_in_dir(dir.path(), "AA11").unwrap();
        assert_eq!(resumed.id(), "aa11aa11-0000-0000-0000-000000000000");
    }

    #[test]
    fn continue_recent_prefers_latest_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = session_in(&dir);
        first.append_message(assistant_message()).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut second = session_in(&dir);
        second.append_message(assistant_message()).unwrap();
        // Bump mtime explicitly; coarse filesystem timestamps otherwise tie.
        let now = std::time::SystemTime::now();
        let f = fs::OpenOptions::new()
            .append(true)
            .open(second.session_file().unwrap())
            .unwrap();
        f.set_modified(now + std::time::Duration::from_secs(5)).unwrap();

        let resumed = Session::continue_recent_in("/test/project", dir.path()).unwrap();
        assert_eq!(resumed.id(), second.id());
    }

    #[test]
    fn continue_recent_creates_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::continue_recent_in("/test/project", dir.path()).unwrap();
        assert!(session.entries().is_empty());
        assert_eq!(session.cwd(), "/test/project");
    }

    #[test]
    fn sanitize_cwd_replaces_separators() {
        assert_eq!(sanitize_cwd("/home/user/project"), "home-user-project");
        assert_eq!(sanitize_cwd("C:\\work\\repo"), "C:-work-repo");
    }

    #[test]
    fn entry_wire_format_flattens_meta() {
        let entry = SessionEntry::ThinkingLevelChange {
            meta: EntryMeta {
                id: "abcd1234".into(),
                parent_id: None,
                timestamp: Utc::now(),
            },
            thinking_level: "high".into(),
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["type"], "thinking_level_change");
        assert_eq!(v["id"], "abcd1234");
        assert_eq!(v["parent_id"], Value::Null);
        assert_eq!(v["thinking_level"], "high");
    }

    #[test]
    fn last_assistant_usage_reads_latest() {
        let mut session = Session::in_memory("/p");
        session.append_message(Message::user("q")).unwrap();
        assert_eq!(session.last_assistant_usage(), None);
        session
            .append_message(Message::Assistant {
                content: vec![AssistantPart::Text { text: "a".into() }],
                usage: Some(Usage { input_tokens: 42, ..Default::default() }),
                stop_reason: Some(StopReason::Stop),
            })
            .unwrap();
        assert_eq!(session.last_assistant_usage().unwrap().input_tokens, 42);
    }
}
