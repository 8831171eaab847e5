//! Retrieval and capture operations.
//!
//! [`MemoryService`] wires the store, the embedder, the scope resolver,
//! the search engine, the context assembler and the import manager into
//! the operations agents call. The CLI is a thin layer over it.
//!
//! | Operation | Kind | Refresh |
//! |-----------|------|---------|
//! | [`search`](MemoryService::search) | retrieval | yes |
//! | [`context_for_request`](MemoryService::context_for_request) | retrieval | yes (inside the assembler) |
//! | [`recall_decision`](MemoryService::recall_decision) / [`recall_bug`](MemoryService::recall_bug) | retrieval | yes |
//! | [`list_sessions`](MemoryService::list_sessions) / [`get_session`](MemoryService::get_session) | retrieval | yes |
//! | [`project_context`](MemoryService::project_context) | retrieval | yes |
//! | `save_decision` / `save_bug` / `save_thought` / `save_pattern` | capture | no |
//! | [`ingest_session`](MemoryService::ingest_session) / [`ingest_message`](MemoryService::ingest_message) | capture | no |
//!
//! Retrieval operations run the cooldown-gated import refresh for the
//! resolved project first; its outcome is reported, never raised.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use coding_memory_core::context::{ContextAssembler, ContextBundle, ContextRequest};
use coding_memory_core::embedding::{attach_embedding, Embedder};
use coding_memory_core::error::{MemoryError, Result};
use coding_memory_core::models::{
    Bug, Decision, Message, Pattern, Record, RecordMeta, RecordType, Role, Session, Severity,
    Summary, Thought,
};
use coding_memory_core::scope::{derive_project_id, Scope, ScopeRequest, ScopeResolver};
use coding_memory_core::search::{HybridSearchEngine, ScoredRecord, SearchRequest};
use coding_memory_core::store::{KnowledgeStore, ListSort};
use coding_memory_core::sync::{RefreshOutcome, SyncTrigger};

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::guard::{TimeoutEmbedder, TimeoutStore};
use crate::migrate;
use crate::sqlite_store::SqliteStore;
use crate::sync::{persist_session, ImportSyncManager};

/// Recall fetches this many times `limit` before filtering.
const RECALL_OVERSAMPLE: usize = 3;

// ============ Requests ============

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    #[serde(default)]
    pub scope: ScopeRequest,
    /// `None` searches every type.
    #[serde(default)]
    pub record_types: Option<Vec<RecordType>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub per_type_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDecision {
    #[serde(default)]
    pub project_id: String,
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

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewBug {
    #[serde(default)]
    pub project_id: String,
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

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewThought {
    #[serde(default)]
    pub project_id: String,
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

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPattern {
    #[serde(default)]
    pub project_id: String,
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

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub role: Option<String>,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<String>,
}

/// A whole session supplied by a caller rather than imported from logs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSession {
    #[serde(default)]
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub messages: Vec<NewMessage>,
}

/// Row caps for [`MemoryService::project_context`].
#[derive(Debug, Clone, Copy)]
pub struct ProjectContextLimits {
    pub sessions: usize,
    pub decisions: usize,
    pub bugs: usize,
    pub patterns: usize,
    pub thoughts: usize,
}

impl Default for ProjectContextLimits {
    fn default() -> Self {
        Self {
            sessions: 5,
            decisions: 10,
            bugs: 5,
            patterns: 5,
            thoughts: 5,
        }
    }
}

// ============ Responses ============

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub project_id: String,
    pub scope: Scope,
    pub refresh: RefreshOutcome,
    pub keyword_only: bool,
    pub results: Vec<ScoredRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecallResponse {
    pub query: String,
    pub project_id: String,
    pub refresh: RefreshOutcome,
    /// Category or severity the results were filtered on.
    pub filter: Option<String>,
    pub keyword_only: bool,
    pub results: Vec<ScoredRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionList {
    pub project_id: String,
    pub scope: Scope,
    pub refresh: RefreshOutcome,
    pub total: usize,
    pub sessions: Vec<Record>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub session: Record,
    pub summary: Option<Record>,
    pub messages: Vec<Message>,
    pub refresh: RefreshOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectContext {
    pub project_id: String,
    pub refresh: RefreshOutcome,
    pub recent_sessions: Vec<Record>,
    pub decisions: Vec<Record>,
    pub bugs: Vec<Record>,
    pub patterns: Vec<Record>,
    pub thoughts: Vec<Record>,
    pub stats: BTreeMap<RecordType, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestedSession {
    pub session_id: String,
    pub project_id: String,
    pub message_count: usize,
    pub summary_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestedMessage {
    pub message_id: String,
    pub session_id: String,
    pub ordinal: i64,
}

// ============ Service ============

/// The memory system's operation surface.
#[derive(Clone)]
pub struct MemoryService {
    store: Arc<dyn KnowledgeStore>,
    embedder: Arc<dyn Embedder>,
    resolver: ScopeResolver,
    engine: HybridSearchEngine,
    assembler: ContextAssembler,
    sync: ImportSyncManager,
    /// One async lock per session with an append in progress.
    appends: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MemoryService {
    /// Build the service over an arbitrary store and embedder.
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: Arc<dyn Embedder>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let params = config.retrieval.search_params();
        params
            .validate()
            .map_err(|e| anyhow::anyhow!("retrieval: {}", e))?;

        let resolver = ScopeResolver::new(config.scope.scope_defaults());
        let engine = HybridSearchEngine::new(store.clone(), embedder.clone(), params);
        let sync = ImportSyncManager::new(
            store.clone(),
            embedder.clone(),
            config.sync.clone(),
            &config.scope.default_project_id,
        );
        let assembler = ContextAssembler::new(
            engine.clone(),
            resolver.clone(),
            Arc::new(sync.clone()),
            config.retrieval.context_defaults(),
        );
        Ok(Self {
            store,
            embedder,
            resolver,
            engine,
            assembler,
            sync,
            appends: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Open the SQLite database named by `config`, migrate it, and wrap
    /// the store and the configured embedder in their timeout guards.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;

        let store: Arc<dyn KnowledgeStore> = Arc::new(TimeoutStore::new(
            Arc::new(SqliteStore::new(pool)),
            Duration::from_secs(config.store.timeout_secs),
        ));
        let embedder: Arc<dyn Embedder> = Arc::new(TimeoutEmbedder::new(
            create_embedder(&config.embedding)?,
            Duration::from_secs(config.embedding.call_timeout_secs),
        ));
        debug!(provider = embedder.provider_tag(), "memory service ready");
        Self::new(store, embedder, config)
    }

    pub fn sync(&self) -> &ImportSyncManager {
        &self.sync
    }

    pub fn resolver(&self) -> &ScopeResolver {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    /// Startup import pass for sources marked `auto_import_on_start`.
    pub async fn start(&self) -> RefreshOutcome {
        let runs = self.sync.run_startup().await;
        crate::sync::summarize(&runs)
    }

    // ---------- retrieval ----------

    pub async fn search(&self, req: &SearchQuery) -> Result<SearchResponse> {
        let resolved = self.resolver.resolve(&req.scope);
        let refresh = self.sync.refresh_for_query(&resolved.project_id).await;

        let defaults = self.assembler.defaults();
        let types = req
            .record_types
            .clone()
            .unwrap_or_else(|| RecordType::ALL.to_vec());
        let outcome = self
            .engine
            .search(&SearchRequest {
                query: &req.query,
                record_types: &types,
                scope: &resolved.scope,
                limit: req.limit.unwrap_or(defaults.limit),
                per_type_limit: req.per_type_limit.unwrap_or(defaults.per_type_limit),
            })
            .await?;

        Ok(SearchResponse {
            query: req.query.clone(),
            project_id: resolved.project_id,
            scope: resolved.scope,
            refresh,
            keyword_only: outcome.keyword_only,
            results: strip(outcome.results),
        })
    }

    pub async fn context_for_request(&self, req: &ContextRequest) -> Result<ContextBundle> {
        self.assembler.build_context(req).await
    }

    /// Past decisions matching `query`, optionally within one category.
    pub async fn recall_decision(
        &self,
        query: &str,
        category: Option<&str>,
        scope: &ScopeRequest,
        limit: usize,
    ) -> Result<RecallResponse> {
        let category = category.map(str::trim).filter(|c| !c.is_empty());
        self.recall(RecordType::Decision, query, scope, limit, category, |record| {
            match (record, category) {
                (Record::Decision(d), Some(c)) => d.category.eq_ignore_ascii_case(c),
                (Record::Decision(_), None) => true,
                _ => false,
            }
        })
        .await
    }

    /// Past bugs matching `query`, optionally of one severity.
    pub async fn recall_bug(
        &self,
        query: &str,
        severity: Option<Severity>,
        scope: &ScopeRequest,
        limit: usize,
    ) -> Result<RecallResponse> {
        let label = severity.map(|s| format!("{:?}", s).to_ascii_lowercase());
        self.recall(RecordType::Bug, query, scope, limit, label.as_deref(), |record| {
            match (record, severity) {
                (Record::Bug(b), Some(s)) => b.severity == s,
                (Record::Bug(_), None) => true,
                _ => false,
            }
        })
        .await
    }

    async fn recall(
        &self,
        record_type: RecordType,
        query: &str,
        scope: &ScopeRequest,
        limit: usize,
        filter: Option<&str>,
        keep: impl Fn(&Record) -> bool,
    ) -> Result<RecallResponse> {
        let resolved = self.resolver.resolve(scope);
        let refresh = self.sync.refresh_for_query(&resolved.project_id).await;

        let fetch = limit.max(1) * RECALL_OVERSAMPLE;
        let outcome = self
            .engine
            .search(&SearchRequest {
                query,
                record_types: &[record_type],
                scope: &resolved.scope,
                limit: fetch,
                per_type_limit: fetch,
            })
            .await?;
        let mut results: Vec<ScoredRecord> = outcome
            .results
            .into_iter()
            .filter(|r| keep(&r.record))
            .collect();
        results.truncate(limit);

        Ok(RecallResponse {
            query: query.to_string(),
            project_id: resolved.project_id,
            refresh,
            filter: filter.map(str::to_string),
            keyword_only: outcome.keyword_only,
            results: strip(results),
        })
    }

    pub async fn list_sessions(
        &self,
        scope: &ScopeRequest,
        sort: ListSort,
        limit: usize,
        offset: usize,
    ) -> Result<SessionList> {
        let resolved = self.resolver.resolve(scope);
        let refresh = self.sync.refresh_for_query(&resolved.project_id).await;
        let filter = resolved.scope.project_filter();

        let total = self.store.count(RecordType::Session, filter).await?;
        let sessions = self
            .store
            .list(RecordType::Session, filter, sort, limit, offset)
            .await?;

        Ok(SessionList {
            project_id: resolved.project_id.clone(),
            scope: resolved.scope.clone(),
            refresh,
            total,
            sessions: sessions.iter().map(Record::without_embedding).collect(),
        })
    }

    /// A session with its summary and, optionally, its most recent
    /// messages (oldest first).
    pub async fn get_session(
        &self,
        session_id: &str,
        include_messages: bool,
        message_limit: usize,
    ) -> Result<SessionDetail> {
        let session = self
            .store
            .get(RecordType::Session, session_id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("session {}", session_id)))?;
        let refresh = self.sync.refresh_for_query(session.project_id()).await;

        // The refresh may have re-imported this session.
        let session = self
            .store
            .get(RecordType::Session, session_id)
            .await?
            .unwrap_or(session);
        let summary = self
            .store
            .get(RecordType::Summary, &Summary::id_for(session_id))
            .await?;
        let messages = if include_messages && message_limit > 0 {
            self.store
                .list_messages(session_id, message_limit, true)
                .await?
                .into_iter()
                .map(|mut m| {
                    m.meta.embedding = None;
                    m.meta.embedding_provider = None;
                    m
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(SessionDetail {
            session: session.without_embedding(),
            summary: summary.map(|s| s.without_embedding()),
            messages,
            refresh,
        })
    }

    /// Recent activity and record counts for one project.
    pub async fn project_context(
        &self,
        project_id: &str,
        limits: ProjectContextLimits,
    ) -> Result<ProjectContext> {
        let project = self.resolver.resolve_project(project_id);
        let refresh = self.sync.refresh_for_query(&project).await;
        let ids = vec![project.clone()];
        let filter = Some(ids.as_slice());

        let recent = |record_type: RecordType, sort: ListSort, limit: usize| async move {
            self.store
                .list(record_type, filter, sort, limit, 0)
                .await
                .map(|rs| rs.iter().map(Record::without_embedding).collect::<Vec<_>>())
        };

        let recent_sessions = recent(RecordType::Session, ListSort::StartedAt, limits.sessions).await?;
        let decisions = recent(RecordType::Decision, ListSort::CreatedAt, limits.decisions).await?;
        let bugs = recent(RecordType::Bug, ListSort::CreatedAt, limits.bugs).await?;
        let patterns = recent(RecordType::Pattern, ListSort::CreatedAt, limits.patterns).await?;
        let thoughts = recent(RecordType::Thought, ListSort::CreatedAt, limits.thoughts).await?;

        let mut stats = BTreeMap::new();
        for record_type in [
            RecordType::Session,
            RecordType::Decision,
            RecordType::Bug,
            RecordType::Pattern,
            RecordType::Thought,
        ] {
            stats.insert(record_type, self.store.count(record_type, filter).await?);
        }

        Ok(ProjectContext {
            project_id: project,
            refresh,
            recent_sessions,
            decisions,
            bugs,
            patterns,
            thoughts,
            stats,
        })
    }

    // ---------- capture ----------

    pub async fn save_decision(&self, input: NewDecision) -> Result<String> {
        require("title", &input.title)?;
        require("description", &input.description)?;
        let record = Record::Decision(Decision {
            meta: self.new_meta(RecordType::Decision, &input.project_id),
            title: input.title.trim().to_string(),
            description: input.description,
            category: input.category,
            context: input.context,
            alternatives: input.alternatives,
            consequences: input.consequences,
            tags: input.tags,
            source_session_id: input.source_session_id,
        });
        self.save(record).await
    }

    pub async fn save_bug(&self, input: NewBug) -> Result<String> {
        require("title", &input.title)?;
        require("description", &input.description)?;
        let record = Record::Bug(Bug {
            meta: self.new_meta(RecordType::Bug, &input.project_id),
            title: input.title.trim().to_string(),
            description: input.description,
            root_cause: input.root_cause,
            fix_description: input.fix_description,
            files_affected: input.files_affected,
            error_messages: input.error_messages,
            severity: input.severity,
            tags: input.tags,
            source_session_id: input.source_session_id,
        });
        self.save(record).await
    }

    pub async fn save_thought(&self, input: NewThought) -> Result<String> {
        require("content", &input.content)?;
        let record = Record::Thought(Thought {
            meta: self.new_meta(RecordType::Thought, &input.project_id),
            content: input.content,
            category: input.category,
            related_files: input.related_files,
            tags: input.tags,
            source_session_id: input.source_session_id,
        });
        self.save(record).await
    }

    pub async fn save_pattern(&self, input: NewPattern) -> Result<String> {
        require("title", &input.title)?;
        require("description", &input.description)?;
        let record = Record::Pattern(Pattern {
            meta: self.new_meta(RecordType::Pattern, &input.project_id),
            title: input.title.trim().to_string(),
            description: input.description,
            code_example: input.code_example,
            use_cases: input.use_cases,
            language: input.language,
            tags: input.tags,
            source_session_id: input.source_session_id,
        });
        self.save(record).await
    }

    fn new_meta(&self, record_type: RecordType, project_id: &str) -> RecordMeta {
        RecordMeta::new(record_type.new_id(), &self.resolver.resolve_project(project_id))
    }

    async fn save(&self, mut record: Record) -> Result<String> {
        attach_embedding(self.embedder.as_ref(), &mut record).await;
        self.store.upsert(&record).await?;
        info!(id = record.id(), project = record.project_id(), "saved {}", record.record_type());
        Ok(record.id().to_string())
    }

    /// Store a caller-supplied session with its messages and a summary
    /// record. The project comes from `project_id` when it names one,
    /// else from `directory`, else from the current workspace.
    pub async fn ingest_session(&self, input: NewSession) -> Result<IngestedSession> {
        require("title", &input.title)?;

        let directory = input.directory.trim().to_string();
        let workspace = if directory.is_empty() {
            self.resolver.defaults().current_project_id.clone()
        } else {
            Some(directory.clone())
        };
        let project_id = derive_project_id(&input.project_id, workspace.as_deref());

        let now = Utc::now();
        let session_id = RecordType::Session.new_id();
        let mut tools: BTreeSet<String> = BTreeSet::new();
        let messages: Vec<Message> = input
            .messages
            .into_iter()
            .filter(|m| !m.content.trim().is_empty())
            .enumerate()
            .map(|(ordinal, m)| {
                let ordinal = ordinal as i64;
                tools.extend(m.tool_calls.iter().cloned());
                Message {
                    meta: RecordMeta::new(Message::id_for(&session_id, ordinal), &project_id),
                    session_id: session_id.clone(),
                    role: m.role.as_deref().and_then(Role::parse).unwrap_or_default(),
                    content: m.content,
                    ordinal,
                    tool_calls: m.tool_calls,
                }
            })
            .collect();

        let summary_text = if input.summary.trim().is_empty() {
            format!("Session: {}", input.title.trim())
        } else {
            input.summary.clone()
        };

        let session = Session {
            meta: RecordMeta::new(session_id.clone(), &project_id),
            source: input.source.unwrap_or_else(|| "manual".to_string()),
            title: input.title.trim().to_string(),
            directory,
            tags: input.tags.clone(),
            summary: input.summary,
            tools_used: tools.into_iter().collect(),
            files_modified: Vec::new(),
            message_count: messages.len(),
            started_at: now,
            ended_at: None,
        };
        let message_count =
            persist_session(self.store.as_ref(), self.embedder.as_ref(), session, messages).await?;

        let mut summary = Record::Summary(Summary {
            meta: RecordMeta::new(Summary::id_for(&session_id), &project_id),
            session_id: session_id.clone(),
            text: summary_text,
            key_topics: input.tags,
        });
        attach_embedding(self.embedder.as_ref(), &mut summary).await;
        self.store.upsert(&summary).await?;

        info!(session = %session_id, project = %project_id, message_count, "ingested session");
        Ok(IngestedSession {
            session_id,
            project_id,
            message_count,
            summary_id: summary.id().to_string(),
        })
    }

    /// Append one message to an existing session.
    ///
    /// The message inherits the session's project. Its ordinal is
    /// `requested` when that keeps the sequence increasing, otherwise one
    /// past the current last message. Appends to one session are
    /// serialized.
    pub async fn ingest_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        tool_calls: Vec<String>,
        requested: Option<i64>,
    ) -> Result<IngestedMessage> {
        require("content", content)?;
        let slot = self.append_slot(session_id);
        let result = {
            let _guard = slot.lock().await;
            self.append_locked(session_id, role, content, tool_calls, requested)
                .await
        };
        self.release_append_slot(session_id, slot);
        result
    }

    fn append_slot(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut appends = self.appends.lock().unwrap_or_else(|e| e.into_inner());
        appends
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Forget the session's lock once no other append holds or awaits it.
    fn release_append_slot(&self, session_id: &str, slot: Arc<tokio::sync::Mutex<()>>) {
        drop(slot);
        let mut appends = self.appends.lock().unwrap_or_else(|e| e.into_inner());
        if appends
            .get(session_id)
            .is_some_and(|s| Arc::strong_count(s) == 1)
        {
            appends.remove(session_id);
        }
    }

    async fn append_locked(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        tool_calls: Vec<String>,
        requested: Option<i64>,
    ) -> Result<IngestedMessage> {
        let mut session = match self.store.get(RecordType::Session, session_id).await? {
            Some(Record::Session(s)) => s,
            _ => return Err(MemoryError::NotFound(format!("session {}", session_id))),
        };

        let last = self
            .store
            .list_messages(session_id, 1, true)
            .await?
            .last()
            .map(|m| m.ordinal);
        let ordinal = match (requested, last) {
            (Some(r), Some(l)) if r > l => r,
            (Some(r), None) if r >= 0 => r,
            (_, Some(l)) => l + 1,
            (_, None) => 0,
        };

        let now = Utc::now();
        let mut record = Record::Message(Message {
            meta: RecordMeta::new(Message::id_for(session_id, ordinal), &session.meta.project_id),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            ordinal,
            tool_calls: tool_calls.clone(),
        });
        attach_embedding(self.embedder.as_ref(), &mut record).await;
        let Record::Message(message) = record else {
            return Err(MemoryError::InvalidInput("message record expected".to_string()));
        };
        self.store.append_message(&message).await?;

        session.message_count += 1;
        session.meta.updated_at = now;
        session.ended_at = Some(now);
        for tool in tool_calls {
            if !session.tools_used.contains(&tool) {
                session.tools_used.push(tool);
            }
        }
        self.store.upsert(&Record::Session(session)).await?;

        Ok(IngestedMessage {
            message_id: message.meta.id,
            session_id: session_id.to_string(),
            ordinal,
        })
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MemoryError::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn strip(results: Vec<ScoredRecord>) -> Vec<ScoredRecord> {
    results
        .into_iter()
        .map(|mut r| {
            r.record = r.record.without_embedding();
            r
        })
        .collect()
}
