//! Storage abstraction for Coding Memory.
//!
//! The [`KnowledgeStore`] trait is the only way the core touches
//! persistence. It exposes typed operations over the seven record
//! collections plus the sync-state collection; callers never issue raw
//! query syntax, so backends are substitutable (SQLite in the app crate,
//! [`memory::InMemoryStore`] here).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Message, Record, RecordType};
use crate::sync::SyncState;

/// A record returned by keyword or vector search with its raw backend
/// score (higher is better).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub record: Record,
    pub raw_score: f64,
}

/// Ordering for [`KnowledgeStore::list`]. Always newest / largest first.
///
/// `StartedAt` and `MessageCount` only apply to sessions; other types
/// fall back to `CreatedAt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListSort {
    #[default]
    CreatedAt,
    StartedAt,
    MessageCount,
}

impl std::str::FromStr for ListSort {
    type Err = crate::error::MemoryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(ListSort::CreatedAt),
            "started_at" => Ok(ListSort::StartedAt),
            "message_count" => Ok(ListSort::MessageCount),
            other => Err(crate::error::MemoryError::InvalidInput(format!(
                "unknown sort '{}'",
                other
            ))),
        }
    }
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](KnowledgeStore::upsert) | Insert or replace a record by id |
/// | [`get`](KnowledgeStore::get) | Fetch one record |
/// | [`keyword_search`](KnowledgeStore::keyword_search) | Full-text candidates |
/// | [`vector_search`](KnowledgeStore::vector_search) | Cosine candidates for one provider |
/// | [`replace_messages`](KnowledgeStore::replace_messages) | Swap a session's message set |
/// | [`list_messages`](KnowledgeStore::list_messages) | Messages of a session by ordinal |
/// | [`list`](KnowledgeStore::list) / [`count`](KnowledgeStore::count) | Browsing |
/// | [`get_sync_state`](KnowledgeStore::get_sync_state) / [`save_sync_state`](KnowledgeStore::save_sync_state) | Import cursor |
///
/// `project_filter = None` means unfiltered; `Some(ids)` restricts to
/// records whose project id is in `ids`.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Insert or replace a record, keyed by its id.
    async fn upsert(&self, record: &Record) -> Result<()>;

    async fn get(&self, record_type: RecordType, id: &str) -> Result<Option<Record>>;

    /// Keyword candidates, best first. Empty when `text` has no terms.
    async fn keyword_search(
        &self,
        record_type: RecordType,
        text: &str,
        project_filter: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    /// Vector candidates by cosine similarity, best first. Only records
    /// embedded by `provider` with matching dimensionality are compared.
    async fn vector_search(
        &self,
        record_type: RecordType,
        vector: &[f32],
        provider: &str,
        project_filter: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    /// Delete every message of `session_id`, then insert `messages`.
    async fn replace_messages(&self, session_id: &str, messages: &[Message]) -> Result<()>;

    /// Append one message to its session.
    async fn append_message(&self, message: &Message) -> Result<()> {
        self.upsert(&Record::Message(message.clone())).await
    }

    /// Up to `limit` messages ordered by ordinal ascending. With
    /// `newest`, the window is the last `limit` messages.
    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        newest: bool,
    ) -> Result<Vec<Message>>;

    /// Browse records, newest first.
    async fn list(
        &self,
        record_type: RecordType,
        project_filter: Option<&[String]>,
        sort: ListSort,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>>;

    async fn count(&self, record_type: RecordType, project_filter: Option<&[String]>)
        -> Result<usize>;

    async fn get_sync_state(&self, source: &str, project_id: &str) -> Result<Option<SyncState>>;

    async fn save_sync_state(&self, state: &SyncState) -> Result<()>;

    async fn list_sync_states(&self) -> Result<Vec<SyncState>>;
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "in", "is", "it",
    "of", "on", "or", "that", "the", "this", "to", "was", "we", "what", "when", "with",
];

/// Split free text into lowercase search terms.
///
/// Terms are alphanumeric runs (plus `_`) of at least two characters,
/// stopwords removed, de-duplicated in first-occurrence order. Backends
/// build their own query syntax from these terms.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if raw.chars().count() < 2 {
            continue;
        }
        let term = raw.to_lowercase();
        if STOPWORDS.contains(&term.as_str()) || terms.contains(&term) {
            continue;
        }
        terms.push(term);
    }
    terms
}
