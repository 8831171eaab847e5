//! Chat-log importers.
//!
//! Each importer turns one coding tool's on-disk history into
//! [`Session`] + [`Message`] records:
//!
//! | Source | Layout | Module |
//! |--------|--------|--------|
//! | `claude-code` | `<root>/<project-hash>/<session>.jsonl` | [`claude_code`] |
//! | `codex` | `<root>/{sessions,archived_sessions}/**/*.jsonl` | [`codex`] |
//! | `generic-json` | `<root>/*.json`, one `{title, messages}` per file | [`generic`] |
//!
//! Importers are synchronous and filesystem-bound. The
//! [`ImportSyncManager`](crate::sync::ImportSyncManager) runs them on the
//! blocking pool and owns fingerprint bookkeeping, attribution and
//! persistence.

pub mod claude_code;
pub mod codex;
pub mod generic;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use coding_memory_core::models::{
    first_line, Message, RecordMeta, Role, Session, DEFAULT_PROJECT_ID,
};
use coding_memory_core::scope::derive_project_id;
use coding_memory_core::sync::{external_fingerprint, file_fingerprint};

/// Source names accepted in `[sync.sources.<name>]`.
pub const KNOWN_SOURCES: &[&str] = &["claude-code", "codex", "generic-json"];

/// Titles are cut to this many characters.
const TITLE_CHARS: usize = 90;

/// A file that may hold one session.
#[derive(Debug, Clone)]
pub struct SessionCandidate {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    /// Skip key: SHA-256 of path and mtime, or the log's own session id
    /// and mtime when the format carries one.
    pub fingerprint: String,
}

impl SessionCandidate {
    /// Stat `path` and fingerprint it.
    pub fn from_path(path: &Path) -> Result<Self> {
        let modified: DateTime<Utc> = std::fs::metadata(path)?
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::SystemTime::UNIX_EPOCH));
        Ok(Self {
            fingerprint: file_fingerprint(&path.to_string_lossy(), modified),
            path: path.to_path_buf(),
            modified,
        })
    }

    /// Key the candidate on the session id stored inside the log instead
    /// of its path.
    pub fn with_external_id(mut self, source: &str, external_id: &str) -> Self {
        self.fingerprint = external_fingerprint(source, external_id, self.modified);
        self
    }

    /// File stem, used as the session token when the log carries no id.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// One parsed session, ready to persist.
#[derive(Debug, Clone)]
pub struct ImportedSession {
    pub session: Session,
    pub messages: Vec<Message>,
}

/// Reader for one tool's chat-log format.
pub trait Importer: Send + Sync {
    /// Source name, one of [`KNOWN_SOURCES`].
    fn source(&self) -> &'static str;

    /// List candidate files under `root`, sorted by path.
    fn discover(&self, root: &Path) -> Result<Vec<SessionCandidate>>;

    /// Parse a candidate. `Ok(None)` means the file holds no messages.
    fn parse(&self, candidate: &SessionCandidate) -> Result<Option<ImportedSession>>;
}

/// Importer registered under `name`.
pub fn importer_for(name: &str) -> Option<Arc<dyn Importer>> {
    match name {
        "claude-code" => Some(Arc::new(claude_code::ClaudeCodeImporter)),
        "codex" => Some(Arc::new(codex::CodexImporter)),
        "generic-json" => Some(Arc::new(generic::GenericJsonImporter)),
        _ => None,
    }
}

/// A message as read from a log, before ids and ordinals are assigned.
#[derive(Debug, Clone)]
pub(crate) struct DraftMessage {
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Session fields an importer extracts from its format.
#[derive(Debug, Clone)]
pub(crate) struct DraftSession {
    pub source: &'static str,
    pub token: String,
    pub title_fallback: String,
    pub title: Option<String>,
    pub directory: String,
    pub started_at: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
}

/// Assemble records from drafts.
///
/// Ids are deterministic (`session::<source>::<token>` and
/// `msg::<source>::<token>::<ordinal>`), so re-importing a file rewrites
/// the same records. The project is derived from the working directory.
pub(crate) fn build_session(
    draft: DraftSession,
    drafts: Vec<DraftMessage>,
) -> Option<ImportedSession> {
    if drafts.is_empty() {
        return None;
    }
    let session_id = format!("session::{}::{}", draft.source, draft.token);
    let directory = draft.directory.trim().to_string();
    let project_id = derive_project_id(
        DEFAULT_PROJECT_ID,
        (!directory.is_empty()).then_some(directory.as_str()),
    );

    let started_at = draft
        .started_at
        .or_else(|| drafts.iter().find_map(|m| m.timestamp))
        .unwrap_or(draft.modified);
    let ended_at = drafts.iter().rev().find_map(|m| m.timestamp);

    let title = draft
        .title
        .filter(|t| !t.trim().is_empty())
        .or_else(|| {
            drafts
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| first_line(&m.content, TITLE_CHARS))
                .filter(|t| !t.is_empty())
        })
        .unwrap_or(draft.title_fallback);

    let mut tools: BTreeSet<String> = BTreeSet::new();
    let mut messages = Vec::with_capacity(drafts.len());
    for (ordinal, m) in drafts.into_iter().enumerate() {
        let ordinal = ordinal as i64;
        tools.extend(m.tool_calls.iter().cloned());
        messages.push(Message {
            meta: RecordMeta::new(Message::id_for(&session_id, ordinal), &project_id)
                .with_created_at(m.timestamp.unwrap_or(started_at)),
            session_id: session_id.clone(),
            role: m.role,
            content: m.content,
            ordinal,
            tool_calls: m.tool_calls,
        });
    }

    let session = Session {
        meta: RecordMeta::new(session_id, &project_id).with_created_at(started_at),
        source: draft.source.to_string(),
        title,
        directory,
        tags: Vec::new(),
        summary: String::new(),
        tools_used: tools.into_iter().collect(),
        files_modified: Vec::new(),
        message_count: messages.len(),
        started_at,
        ended_at,
    };
    Some(ImportedSession { session, messages })
}

/// Parse an RFC 3339 timestamp field.
pub(crate) fn parse_timestamp(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Read a JSONL file, skipping blank and malformed lines.
pub(crate) fn read_jsonl(path: &Path) -> Result<Vec<serde_json::Value>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
