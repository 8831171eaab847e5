//! Timeout decorators for the store and the embedder.
//!
//! Every external call on the retrieval path carries a deadline. A store
//! call that misses it fails with [`MemoryError::StoreUnavailable`]; an
//! embedder call that misses it yields `None`, which degrades the query to
//! keyword-only ranking.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use coding_memory_core::embedding::Embedder;
use coding_memory_core::error::{MemoryError, Result};
use coding_memory_core::models::{Message, Record, RecordType};
use coding_memory_core::store::{Candidate, KnowledgeStore, ListSort};
use coding_memory_core::sync::SyncState;

/// [`KnowledgeStore`] wrapper that bounds every call.
pub struct TimeoutStore {
    inner: Arc<dyn KnowledgeStore>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn KnowledgeStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn guarded<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MemoryError::StoreUnavailable(format!(
                "{} timed out after {:?}",
                op, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl KnowledgeStore for TimeoutStore {
    async fn upsert(&self, record: &Record) -> Result<()> {
        self.guarded("upsert", self.inner.upsert(record)).await
    }

    async fn get(&self, record_type: RecordType, id: &str) -> Result<Option<Record>> {
        self.guarded("get", self.inner.get(record_type, id)).await
    }

    async fn keyword_search(
        &self,
        record_type: RecordType,
        text: &str,
        project_filter: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        self.guarded(
            "keyword_search",
            self.inner
                .keyword_search(record_type, text, project_filter, limit),
        )
        .await
    }

    async fn vector_search(
        &self,
        record_type: RecordType,
        vector: &[f32],
        provider: &str,
        project_filter: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        self.guarded(
            "vector_search",
            self.inner
                .vector_search(record_type, vector, provider, project_filter, limit),
        )
        .await
    }

    async fn replace_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        self.guarded(
            "replace_messages",
            self.inner.replace_messages(session_id, messages),
        )
        .await
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        self.guarded("append_message", self.inner.append_message(message))
            .await
    }

    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        newest: bool,
    ) -> Result<Vec<Message>> {
        self.guarded(
            "list_messages",
            self.inner.list_messages(session_id, limit, newest),
        )
        .await
    }

    async fn list(
        &self,
        record_type: RecordType,
        project_filter: Option<&[String]>,
        sort: ListSort,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>> {
        self.guarded(
            "list",
            self.inner
                .list(record_type, project_filter, sort, limit, offset),
        )
        .await
    }

    async fn count(
        &self,
        record_type: RecordType,
        project_filter: Option<&[String]>,
    ) -> Result<usize> {
        self.guarded("count", self.inner.count(record_type, project_filter))
            .await
    }

    async fn get_sync_state(&self, source: &str, project_id: &str) -> Result<Option<SyncState>> {
        self.guarded(
            "get_sync_state",
            self.inner.get_sync_state(source, project_id),
        )
        .await
    }

    async fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        self.guarded("save_sync_state", self.inner.save_sync_state(state))
            .await
    }

    async fn list_sync_states(&self) -> Result<Vec<SyncState>> {
        self.guarded("list_sync_states", self.inner.list_sync_states())
            .await
    }
}

/// [`Embedder`] wrapper that turns a slow call into "unavailable".
pub struct TimeoutEmbedder {
    inner: Arc<dyn Embedder>,
    timeout: Duration,
}

impl TimeoutEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl Embedder for TimeoutEmbedder {
    fn provider_tag(&self) -> &str {
        self.inner.provider_tag()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match tokio::time::timeout(self.timeout, self.inner.embed(text)).await {
            Ok(v) => v,
            Err(_) => {
                warn!(
                    provider = self.inner.provider_tag(),
                    timeout = ?self.timeout,
                    "embedding timed out"
                );
                None
            }
        }
    }
}
