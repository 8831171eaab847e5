//! Record models stored in the knowledge store.
//!
//! Seven record kinds share a common header ([`RecordMeta`]) by
//! composition. The closed [`Record`] enum is what flows through the
//! store, the search engine, and the context assembler; code that needs a
//! specific kind matches on the variant.
//!
//! # Id conventions
//!
//! | Kind | Id |
//! |------|----|
//! | Session | `session::<source>::<token>` (imports) or `session::<uuid>` |
//! | Message | `msg::<session-token>::<ordinal:08>` |
//! | Summary | `summary::<session-token>` |
//! | Decision / Bug / Thought / Pattern | `<kind>::<uuid>` |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MemoryError;

/// Reserved project identifier used when nothing better is known.
pub const DEFAULT_PROJECT_ID: &str = "default";

/// Record collection discriminator.
///
/// Variant order is the relevance priority used when merging and
/// trimming: decisions answer an implementation question most directly,
/// summaries least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Decision,
    Bug,
    Pattern,
    Thought,
    Session,
    Message,
    Summary,
}

impl RecordType {
    /// Every record type, in priority order.
    pub const ALL: [RecordType; 7] = [
        RecordType::Decision,
        RecordType::Bug,
        RecordType::Pattern,
        RecordType::Thought,
        RecordType::Session,
        RecordType::Message,
        RecordType::Summary,
    ];

    /// Relevance rank: lower is more important. Sessions and messages
    /// share a slot.
    pub fn priority(self) -> u8 {
        match self {
            RecordType::Decision => 0,
            RecordType::Bug => 1,
            RecordType::Pattern => 2,
            RecordType::Thought => 3,
            RecordType::Session | RecordType::Message => 4,
            RecordType::Summary => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Decision => "decision",
            RecordType::Bug => "bug",
            RecordType::Pattern => "pattern",
            RecordType::Thought => "thought",
            RecordType::Session => "session",
            RecordType::Message => "message",
            RecordType::Summary => "summary",
        }
    }

    /// Collection name used by persistent backends.
    pub fn collection(self) -> &'static str {
        match self {
            RecordType::Decision => "decisions",
            RecordType::Bug => "bugs",
            RecordType::Pattern => "patterns",
            RecordType::Thought => "thoughts",
            RecordType::Session => "sessions",
            RecordType::Message => "messages",
            RecordType::Summary => "summaries",
        }
    }

    fn id_prefix(self) -> &'static str {
        match self {
            RecordType::Decision => "decision::",
            RecordType::Bug => "bug::",
            RecordType::Pattern => "pattern::",
            RecordType::Thought => "thought::",
            RecordType::Session => "session::",
            RecordType::Message => "msg::",
            RecordType::Summary => "summary::",
        }
    }

    /// Generate a fresh id for a captured record of this type.
    pub fn new_id(self) -> String {
        format!("{}{}", self.id_prefix(), Uuid::new_v4())
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = MemoryError;

    /// Accepts both the singular and the collection name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        RecordType::ALL
            .into_iter()
            .find(|t| t.as_str() == lower || t.collection() == lower)
            .ok_or_else(|| MemoryError::InvalidInput(format!("unknown record type '{}'", s)))
    }
}

/// Fields every record carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Embedding vector, absent when the provider was unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Provider tag of `embedding`. Vectors from different providers are
    /// never compared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_provider: Option<String>,
}

impl RecordMeta {
    /// Header stamped with the current time. An empty project id falls
    /// back to [`DEFAULT_PROJECT_ID`].
    pub fn new(id: impl Into<String>, project_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: non_empty_project(project_id),
            created_at: now,
            updated_at: now,
            embedding: None,
            embedding_provider: None,
        }
    }

    pub fn with_created_at(mut self, ts: DateTime<Utc>) -> Self {
        self.created_at = ts;
        self.updated_at = ts;
        self
    }
}

fn non_empty_project(project_id: &str) -> String {
    let trimmed = project_id.trim();
    if trimmed.is_empty() {
        DEFAULT_PROJECT_ID.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Speaker of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    /// Lenient parse used by importers. Unknown roles yield `None`.
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Some(Role::User),
            "assistant" | "agent" | "model" => Some(Role::Assistant),
            "system" | "developer" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// Bug severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl FromStr for Severity {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(MemoryError::InvalidInput(format!(
                "unknown severity '{}'",
                other
            ))),
        }
    }
}

/// One coding conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(flatten)]
    pub meta: RecordMeta,
    /// Tool origin (`claude-code`, `codex`, `generic-json`, `manual`).
    pub source: String,
    pub title: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub message_count: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// One turn within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    /// Position within the session, strictly increasing.
    pub ordinal: i64,
    /// Names of tools invoked by this turn.
    #[serde(default)]
    pub tool_calls: Vec<String>,
}

impl Message {
    /// Deterministic message id: re-importing a session overwrites the
    /// same ids instead of minting new ones.
    pub fn id_for(session_id: &str, ordinal: i64) -> String {
        format!("msg::{}::{:08}", session_token(session_id), ordinal)
    }
}

/// Derived digest of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub session_id: String,
    pub text: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
}

impl Summary {
    pub fn id_for(session_id: &str) -> String {
        format!("summary::{}", session_token(session_id))
    }
}

/// An architectural or coding decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub consequences: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_session_id: Option<String>,
}

/// A fault and its fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bug {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub fix_description: String,
    #[serde(default)]
    pub files_affected: Vec<String>,
    #[serde(default)]
    pub error_messages: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_session_id: Option<String>,
}

/// A free-form developer note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub content: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub related_files: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_session_id: Option<String>,
}

/// A reusable code pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub code_example: String,
    #[serde(default)]
    pub use_cases: Vec<String>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_session_id: Option<String>,
}

/// Any stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Decision(Decision),
    Bug(Bug),
    Pattern(Pattern),
    Thought(Thought),
    Session(Session),
    Message(Message),
    Summary(Summary),
}

impl Record {
    pub fn meta(&self) -> &RecordMeta {
        match self {
            Record::Decision(r) => &r.meta,
            Record::Bug(r) => &r.meta,
            Record::Pattern(r) => &r.meta,
            Record::Thought(r) => &r.meta,
            Record::Session(r) => &r.meta,
            Record::Message(r) => &r.meta,
            Record::Summary(r) => &r.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut RecordMeta {
        match self {
            Record::Decision(r) => &mut r.meta,
            Record::Bug(r) => &mut r.meta,
            Record::Pattern(r) => &mut r.meta,
            Record::Thought(r) => &mut r.meta,
            Record::Session(r) => &mut r.meta,
            Record::Message(r) => &mut r.meta,
            Record::Summary(r) => &mut r.meta,
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Decision(_) => RecordType::Decision,
            Record::Bug(_) => RecordType::Bug,
            Record::Pattern(_) => RecordType::Pattern,
            Record::Thought(_) => RecordType::Thought,
            Record::Session(_) => RecordType::Session,
            Record::Message(_) => RecordType::Message,
            Record::Summary(_) => RecordType::Summary,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta().id
    }

    pub fn project_id(&self) -> &str {
        &self.meta().project_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.meta().created_at
    }

    /// Short human label: a title where the record has one, otherwise the
    /// first line of its body.
    pub fn title(&self) -> String {
        match self {
            Record::Decision(r) => r.title.clone(),
            Record::Bug(r) => r.title.clone(),
            Record::Pattern(r) => r.title.clone(),
            Record::Session(r) => r.title.clone(),
            Record::Thought(r) => first_line(&r.content, 90),
            Record::Message(r) => format!("[{}] {}", r.role.as_str(), first_line(&r.content, 80)),
            Record::Summary(r) => first_line(&r.text, 90),
        }
    }

    /// Text that gets embedded for vector search.
    pub fn embedding_text(&self) -> String {
        match self {
            Record::Decision(r) => join_nonempty(&[&r.title, &r.description, &r.context]),
            Record::Bug(r) => {
                let mut text =
                    join_nonempty(&[&r.title, &r.description, &r.root_cause, &r.fix_description]);
                for msg in &r.error_messages {
                    text.push('\n');
                    text.push_str(msg);
                }
                text
            }
            Record::Pattern(r) => join_nonempty(&[&r.title, &r.description, &r.code_example]),
            Record::Thought(r) => r.content.clone(),
            Record::Session(r) => join_nonempty(&[&r.title, &r.summary]),
            Record::Message(r) => r.content.clone(),
            Record::Summary(r) => r.text.clone(),
        }
    }

    /// Text indexed for keyword search: the embedded text plus tags and
    /// secondary fields.
    pub fn search_text(&self) -> String {
        let mut text = self.embedding_text();
        let extras: Vec<&String> = match self {
            Record::Decision(r) => r
                .tags
                .iter()
                .chain(r.alternatives.iter())
                .chain(std::iter::once(&r.category))
                .collect(),
            Record::Bug(r) => r.tags.iter().chain(r.files_affected.iter()).collect(),
            Record::Pattern(r) => r
                .tags
                .iter()
                .chain(r.use_cases.iter())
                .chain(std::iter::once(&r.language))
                .collect(),
            Record::Thought(r) => r
                .tags
                .iter()
                .chain(r.related_files.iter())
                .chain(std::iter::once(&r.category))
                .collect(),
            Record::Session(r) => r.tags.iter().chain(r.tools_used.iter()).collect(),
            Record::Message(r) => r.tool_calls.iter().collect(),
            Record::Summary(r) => r.key_topics.iter().collect(),
        };
        for extra in extras {
            if !extra.is_empty() {
                text.push('\n');
                text.push_str(extra);
            }
        }
        text
    }

    /// Parent session for messages and summaries.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Record::Message(m) => Some(&m.session_id),
            Record::Summary(s) => Some(&s.session_id),
            Record::Session(s) => Some(&s.meta.id),
            _ => None,
        }
    }

    /// Copy of the record with its embedding removed, for responses.
    pub fn without_embedding(&self) -> Record {
        let mut copy = self.clone();
        let meta = copy.meta_mut();
        meta.embedding = None;
        meta.embedding_provider = None;
        copy
    }
}

/// Strip the `session::` prefix from a session id.
pub fn session_token(session_id: &str) -> &str {
    session_id.strip_prefix("session::").unwrap_or(session_id)
}

fn join_nonempty(parts: &[&String]) -> String {
    parts
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// First non-empty line of `text`, cut to `max_chars` characters.
pub fn first_line(text: &str, max_chars: usize) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .chars()
        .take(max_chars)
        .collect()
}

/// Prefix of message lines that record a tool invocation.
pub const TOOL_CALL_PREFIX: &str = "Tool call: ";

/// Label for a tool invocation: the tool name, qualified with the
/// sub-agent type or skill name when the arguments carry one.
pub fn tool_call_label(name: &str, arguments: Option<&serde_json::Value>) -> String {
    let qualifier = arguments.and_then(|args| {
        if is_skill_tool(name) {
            ["name", "skill", "skill_name", "path"]
                .iter()
                .find_map(|k| args.get(*k).and_then(serde_json::Value::as_str))
        } else {
            args.get("subagent_type").and_then(serde_json::Value::as_str)
        }
    });
    match qualifier.map(str::trim).filter(|q| !q.is_empty()) {
        Some(q) => format!("{} ({})", name, q),
        None => name.to_string(),
    }
}

pub fn is_skill_tool(name: &str) -> bool {
    name.eq_ignore_ascii_case("skill")
}

/// Split a `Tool call: name (qualifier)` line into name and qualifier.
pub fn parse_tool_call_line(line: &str) -> Option<(&str, Option<&str>)> {
    let label = line.trim().strip_prefix(TOOL_CALL_PREFIX)?.trim();
    if label.is_empty() {
        return None;
    }
    match label.split_once(" (") {
        Some((name, rest)) => {
            let qualifier = rest.strip_suffix(')').map(str::trim).filter(|q| !q.is_empty());
            Some((name.trim(), qualifier))
        }
        None => Some((label, None)),
    }
}
