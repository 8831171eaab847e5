//! Incremental chat-log import.
//!
//! [`ImportSyncManager`] drives the per-`(source, project)` state machine
//! defined by [`SyncState`]:
//!
//! ```text
//!   Idle ──▶ Scanning ──▶ Importing ──▶ Idle
//!               │             │
//!               └──▶ Error ◀──┘
//! ```
//!
//! # Triggers
//!
//! | Trigger | Cooldown | Caller |
//! |---------|----------|--------|
//! | Startup ([`run_startup`](ImportSyncManager::run_startup)) | bypassed | [`MemoryService::start`](crate::service::MemoryService::start), run by `cmem init` |
//! | Query ([`SyncTrigger::refresh_for_query`]) | honoured | [`ContextAssembler`](coding_memory_core::context::ContextAssembler) and the service's retrieval ops |
//! | Manual ([`sync_now`](ImportSyncManager::sync_now)) | `force` decides | `cmem sync` |
//!
//! A pair is guarded by its own async mutex; a trigger that finds it held
//! returns immediately. A query-time trigger waits at most
//! `scan_timeout_secs` for the pass, which keeps running in a background
//! task after that.
//!
//! # Attribution
//!
//! Every imported session gets the project derived from its working
//! directory, whichever pair imports it. A pair for the reserved `default`
//! project imports everything under those derived projects. A pair for a
//! specific project imports only that project's sessions. Sessions with no
//! usable directory derive `default` and are left to the default pair.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use coding_memory_core::embedding::{attach_embedding, Embedder};
use coding_memory_core::error::{MemoryError, Result};
use coding_memory_core::models::{Message, Record, Session, DEFAULT_PROJECT_ID};
use coding_memory_core::scope::normalize_project_id;
use coding_memory_core::store::KnowledgeStore;
use coding_memory_core::sync::{state_key, RefreshOutcome, SyncPhase, SyncState, SyncTrigger};

use crate::config::{expand_tilde, SourceConfig, SyncConfig};
use crate::importers::{importer_for, ImportedSession};

/// Counters of one completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Candidate files found by discovery.
    pub scanned: usize,
    /// Candidates skipped: already imported, empty, or another project's.
    pub skipped: usize,
    /// Files that failed to parse.
    pub unreadable: usize,
    pub sessions: usize,
    pub messages: usize,
}

/// What happened to one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PassOutcome {
    Cooldown,
    InFlight,
    Completed(ImportReport),
    Failed { error: String },
}

/// A pass result labelled with its pair.
#[derive(Debug, Clone, Serialize)]
pub struct PairRun {
    pub source: String,
    pub project_id: String,
    #[serde(flatten)]
    pub outcome: PassOutcome,
}

/// Status snapshot of one pair.
#[derive(Debug, Clone, Serialize)]
pub struct PairStatus {
    pub source: String,
    pub project_id: String,
    pub phase: SyncPhase,
    pub in_flight: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cursor: Option<DateTime<Utc>>,
    /// Fingerprints remembered for the pair.
    pub fingerprints: usize,
    pub runs: u64,
    pub failures: u64,
    pub sessions_imported: u64,
    pub messages_imported: u64,
}

impl PairStatus {
    fn from_state(state: SyncState, in_flight: bool) -> Self {
        Self {
            fingerprints: state.fingerprint_count(),
            source: state.source,
            project_id: state.project_id,
            phase: state.phase,
            in_flight,
            last_run_at: state.last_run_at,
            last_error: state.last_error,
            cursor: state.cursor,
            runs: state.runs,
            failures: state.failures,
            sessions_imported: state.sessions_imported,
            messages_imported: state.messages_imported,
        }
    }
}

/// Driver of the import state machine. Cheap to clone.
#[derive(Clone)]
pub struct ImportSyncManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KnowledgeStore>,
    embedder: Arc<dyn Embedder>,
    config: SyncConfig,
    default_project: String,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImportSyncManager {
    /// `default_project` is the pair project used by startup and manual
    /// passes when none is named.
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: Arc<dyn Embedder>,
        config: SyncConfig,
        default_project: &str,
    ) -> Self {
        let default_project =
            normalize_project_id(default_project).unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string());
        Self {
            inner: Arc::new(Inner {
                store,
                embedder,
                config,
                default_project,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// One pass for every enabled source marked `auto_import_on_start`.
    pub async fn run_startup(&self) -> Vec<PairRun> {
        let project = self.inner.default_project.clone();
        let mut runs = Vec::new();
        for (name, source) in &self.inner.config.sources {
            if source.enabled && source.auto_import_on_start {
                runs.push(self.run_pair(name, &project, true).await);
            }
        }
        runs
    }

    /// Run passes now for one source (or all enabled sources) and one
    /// project (or the default).
    pub async fn sync_now(
        &self,
        source: Option<&str>,
        project_id: Option<&str>,
        force: bool,
    ) -> Result<Vec<PairRun>> {
        let project = project_id
            .and_then(normalize_project_id)
            .unwrap_or_else(|| self.inner.default_project.clone());
        let names: Vec<String> = match source {
            Some(name) => {
                if !self.inner.config.sources.contains_key(name) {
                    return Err(MemoryError::InvalidInput(format!(
                        "sync source '{}' is not configured",
                        name
                    )));
                }
                vec![name.to_string()]
            }
            None => self.enabled_sources(),
        };
        let mut runs = Vec::with_capacity(names.len());
        for name in names {
            runs.push(self.run_pair(&name, &project, force).await);
        }
        Ok(runs)
    }

    /// Every pair that has ever run.
    pub async fn status(&self) -> Result<Vec<PairStatus>> {
        let states = self.inner.store.list_sync_states().await?;
        Ok(states
            .into_iter()
            .map(|state| {
                let in_flight = self.inner.is_held(&state.key());
                PairStatus::from_state(state, in_flight)
            })
            .collect())
    }

    fn enabled_sources(&self) -> Vec<String> {
        self.inner
            .config
            .sources
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Run one pair unless another trigger holds it.
    pub async fn run_pair(&self, source: &str, project_id: &str, force: bool) -> PairRun {
        let slot = self.inner.slot(&state_key(source, project_id));
        let outcome = match slot.try_lock() {
            Ok(_guard) => match self.inner.pass(source, project_id, force).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(source, project = project_id, error = %e, "sync pass failed");
                    PassOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            },
            Err(_) => {
                debug!(source, project = project_id, "sync pass already in flight");
                PassOutcome::InFlight
            }
        };
        PairRun {
            source: source.to_string(),
            project_id: project_id.to_string(),
            outcome,
        }
    }

    async fn refresh_pairs(&self, project_id: String) -> Vec<PairRun> {
        let mut runs = Vec::new();
        for name in self.enabled_sources() {
            runs.push(self.run_pair(&name, &project_id, false).await);
        }
        runs
    }
}

impl Inner {
    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn is_held(&self, key: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(key)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    async fn pass(&self, source: &str, project_id: &str, force: bool) -> Result<PassOutcome> {
        let source_config = self.config.sources.get(source).ok_or_else(|| {
            MemoryError::InvalidInput(format!("sync source '{}' is not configured", source))
        })?;

        let mut state = self
            .store
            .get_sync_state(source, project_id)
            .await?
            .unwrap_or_else(|| SyncState::new(source, project_id));

        let now = Utc::now();
        let cooldown = chrono::Duration::seconds(self.config.cooldown_secs as i64);
        if !force && !state.cooldown_elapsed(now, cooldown) {
            return Ok(PassOutcome::Cooldown);
        }

        state.begin(now);
        self.store.save_sync_state(&state).await?;
        debug!(source, project = project_id, run = state.runs, "sync pass started");

        match self.scan(source, source_config, &mut state).await {
            Ok(report) => {
                state.finish();
                self.store.save_sync_state(&state).await?;
                info!(
                    source,
                    project = project_id,
                    scanned = report.scanned,
                    sessions = report.sessions,
                    messages = report.messages,
                    "sync pass complete"
                );
                Ok(PassOutcome::Completed(report))
            }
            Err(e) => {
                state.fail(&e);
                if let Err(save_err) = self.store.save_sync_state(&state).await {
                    warn!(source, error = %save_err, "could not record sync failure");
                }
                warn!(source, project = project_id, error = %e, "sync pass failed");
                Ok(PassOutcome::Failed {
                    error: e.to_string(),
                })
            }
        }
    }

    async fn scan(
        &self,
        source: &str,
        source_config: &SourceConfig,
        state: &mut SyncState,
    ) -> Result<ImportReport> {
        let importer = importer_for(source)
            .ok_or_else(|| MemoryError::InvalidInput(format!("unknown sync source '{}'", source)))?;
        let root = source_config
            .path
            .as_deref()
            .map(expand_tilde)
            .ok_or_else(|| MemoryError::import_source(source, "no path configured"))?;
        if !root.exists() {
            return Err(MemoryError::import_source(
                source,
                format!("{} does not exist", root.display()),
            ));
        }

        let discover = importer.clone();
        let candidates = tokio::task::spawn_blocking(move || discover.discover(&root))
            .await
            .map_err(|e| MemoryError::import_source(source, e))?
            .map_err(|e| MemoryError::import_source(source, format!("{:#}", e)))?;

        state.phase = SyncPhase::Importing;
        let mut report = ImportReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            let path_key = candidate.path.to_string_lossy().to_string();
            if state.is_known(&path_key, &candidate.fingerprint) {
                report.skipped += 1;
                continue;
            }

            let parser = importer.clone();
            let job = candidate.clone();
            let parsed = match tokio::task::spawn_blocking(move || parser.parse(&job)).await {
                Ok(Ok(parsed)) => parsed,
                Ok(Err(e)) => {
                    warn!(path = %candidate.path.display(), error = %format!("{:#}", e), "skipping unreadable session file");
                    state.record_skip(path_key, candidate.fingerprint);
                    report.unreadable += 1;
                    continue;
                }
                Err(e) => {
                    warn!(path = %candidate.path.display(), error = %e, "session parser panicked");
                    state.record_skip(path_key, candidate.fingerprint);
                    report.unreadable += 1;
                    continue;
                }
            };

            let Some(imported) = parsed.and_then(|s| attribute(s, &state.project_id)) else {
                state.record_skip(path_key, candidate.fingerprint);
                report.skipped += 1;
                continue;
            };

            let session_id = imported.session.meta.id.clone();
            let messages = persist_session(
                self.store.as_ref(),
                self.embedder.as_ref(),
                imported.session,
                imported.messages,
            )
            .await?;

            state.record_import(
                &path_key,
                candidate.fingerprint,
                &session_id,
                Some(candidate.modified),
                messages,
            );
            self.store.save_sync_state(state).await?;
            debug!(session = %session_id, messages, "imported session");

            report.sessions += 1;
            report.messages += messages;
        }

        Ok(report)
    }
}

/// Keep a parsed session if it belongs to the pair's project. The derived
/// project is never rewritten.
fn attribute(imported: ImportedSession, pair_project: &str) -> Option<ImportedSession> {
    if pair_project == DEFAULT_PROJECT_ID || imported.session.meta.project_id == pair_project {
        Some(imported)
    } else {
        None
    }
}

/// Write a session and its full message set. Embeddings are best-effort.
/// Returns the number of messages written.
pub async fn persist_session(
    store: &dyn KnowledgeStore,
    embedder: &dyn Embedder,
    session: Session,
    messages: Vec<Message>,
) -> Result<usize> {
    let session_id = session.meta.id.clone();

    let mut embedded = Vec::with_capacity(messages.len());
    for message in messages {
        let mut record = Record::Message(message);
        attach_embedding(embedder, &mut record).await;
        if let Record::Message(m) = record {
            embedded.push(m);
        }
    }
    store.replace_messages(&session_id, &embedded).await?;

    let mut record = Record::Session(session);
    attach_embedding(embedder, &mut record).await;
    store.upsert(&record).await?;
    Ok(embedded.len())
}

/// Fold per-pair results into one refresh outcome.
pub fn summarize(runs: &[PairRun]) -> RefreshOutcome {
    if runs.is_empty() {
        return RefreshOutcome::Disabled;
    }
    let errors: Vec<String> = runs
        .iter()
        .filter_map(|r| match &r.outcome {
            PassOutcome::Failed { error } => Some(format!("{}: {}", r.source, error)),
            _ => None,
        })
        .collect();
    if !errors.is_empty() {
        return RefreshOutcome::Failed {
            error: errors.join("; "),
        };
    }

    let mut completed = false;
    let (mut sessions, mut messages) = (0, 0);
    for run in runs {
        if let PassOutcome::Completed(report) = &run.outcome {
            completed = true;
            sessions += report.sessions;
            messages += report.messages;
        }
    }
    if completed {
        RefreshOutcome::Completed { sessions, messages }
    } else if runs.iter().any(|r| r.outcome == PassOutcome::InFlight) {
        RefreshOutcome::InFlight
    } else {
        RefreshOutcome::Cooldown
    }
}

#[async_trait]
impl SyncTrigger for ImportSyncManager {
    async fn refresh_for_query(&self, project_id: &str) -> RefreshOutcome {
        if !self.inner.config.auto_import_on_query || self.enabled_sources().is_empty() {
            return RefreshOutcome::Disabled;
        }
        let project =
            normalize_project_id(project_id).unwrap_or_else(|| self.inner.default_project.clone());

        let manager = self.clone();
        let task = tokio::spawn(async move { manager.refresh_pairs(project).await });
        let wait = Duration::from_secs(self.inner.config.scan_timeout_secs);
        match tokio::time::timeout(wait, task).await {
            Ok(Ok(runs)) => summarize(&runs),
            Ok(Err(e)) => RefreshOutcome::Failed {
                error: format!("sync task aborted: {}", e),
            },
            Err(_) => {
                debug!(project = project_id, "sync pass still running; continuing in background");
                RefreshOutcome::Pending
            }
        }
    }
}
