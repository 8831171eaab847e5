//! Context assembly for a natural-language request.
//!
//! [`ContextAssembler::build_context`] turns a request into a bounded,
//! de-duplicated, multi-type bundle:
//!
//! ```text
//!  request ─▶ scope ─▶ sync refresh ─▶ hybrid search ─▶ attach messages
//!                                                          │
//!            bundle ◀── render ◀── token budget ◀──────────┘
//! ```
//!
//! The sync refresh never blocks retrieval on failure: its outcome is
//! recorded on the bundle and logged. Token estimates use the
//! four-characters-per-token rule.
//!
//! File paths given on the request, plus path-like tokens found in the
//! query, each run a keyword-only lookup whose hits are appended after the
//! ranked results. Tool, skill and sub-agent names seen in the bundle's
//! messages are reported alongside the items.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{is_skill_tool, parse_tool_call_line, Message, Record, RecordType};
use crate::scope::{Scope, ScopeRequest, ScopeResolver};
use crate::search::{HybridSearchEngine, MatchSignal, ScoredRecord, SearchRequest};
use crate::sync::{RefreshOutcome, SyncTrigger};

/// Longest excerpt rendered per line of `context_text`.
const EXCERPT_CHARS: usize = 240;

/// Extensions that make a bare token look like a source file.
const SOURCE_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".tsx", ".go", ".rs", ".java", ".rb", ".md", ".toml",
];

/// Defaults applied when a request leaves a knob unset.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextDefaults {
    pub limit: usize,
    pub per_type_limit: usize,
    pub message_limit: usize,
    pub max_tokens: usize,
    /// Fewer relevant items than this flags the bundle low-confidence.
    pub min_relevant_items: usize,
}

impl Default for ContextDefaults {
    fn default() -> Self {
        Self {
            limit: 12,
            per_type_limit: 6,
            message_limit: 20,
            max_tokens: 2000,
            min_relevant_items: 2,
        }
    }
}

/// One context request.
#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub query: String,
    pub scope: ScopeRequest,
    pub include_messages: bool,
    /// Restrict to these types; `None` searches every type.
    pub record_types: Option<Vec<RecordType>>,
    pub limit: Option<usize>,
    pub per_type_limit: Option<usize>,
    pub message_limit: Option<usize>,
    pub max_tokens: Option<usize>,
    /// Files the request is about. Paths found in the query are added.
    pub file_paths: Vec<String>,
}

/// A ranked item in a [`ContextBundle`].
#[derive(Debug, Clone, Serialize)]
pub struct ContextItem {
    pub id: String,
    pub record_type: RecordType,
    pub project_id: String,
    pub title: String,
    pub score: f64,
    pub keyword_score: f64,
    pub vector_score: f64,
    pub signal: MatchSignal,
    /// Which signal drove the inclusion, in words.
    pub provenance: String,
    pub record: Record,
    /// Most recent messages of a session item, oldest first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}

/// Structured answer to a context request.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub query: String,
    pub project_id: String,
    pub scope: Scope,
    pub refresh: RefreshOutcome,
    pub keyword_only: bool,
    pub low_confidence: bool,
    /// Relevant items found before the token budget was applied.
    pub relevant_items: usize,
    pub counts: BTreeMap<RecordType, usize>,
    /// Item counts per project, for cross-project scopes.
    pub projects: BTreeMap<String, usize>,
    pub items: Vec<ContextItem>,
    /// Paths looked up: the request's, then those inferred from the query.
    pub file_paths: Vec<String>,
    pub tool_calls_in_context: Vec<String>,
    pub skills_in_context: Vec<String>,
    pub subagents_in_context: Vec<String>,
    pub dropped_for_budget: usize,
    pub token_estimate: usize,
    pub context_text: String,
}

/// Builds context bundles from the search engine.
#[derive(Clone)]
pub struct ContextAssembler {
    engine: HybridSearchEngine,
    resolver: ScopeResolver,
    sync: Arc<dyn SyncTrigger>,
    defaults: ContextDefaults,
}

impl ContextAssembler {
    pub fn new(
        engine: HybridSearchEngine,
        resolver: ScopeResolver,
        sync: Arc<dyn SyncTrigger>,
        defaults: ContextDefaults,
    ) -> Self {
        Self {
            engine,
            resolver,
            sync,
            defaults,
        }
    }

    pub fn defaults(&self) -> &ContextDefaults {
        &self.defaults
    }

    pub async fn build_context(&self, req: &ContextRequest) -> Result<ContextBundle> {
        let resolved = self.resolver.resolve(&req.scope);

        let refresh = self.sync.refresh_for_query(&resolved.project_id).await;
        if let RefreshOutcome::Failed { error } = &refresh {
            warn!(project = %resolved.project_id, %error, "import refresh failed; serving stale index");
        }

        let limit = req.limit.unwrap_or(self.defaults.limit);
        let per_type_limit = req.per_type_limit.unwrap_or(self.defaults.per_type_limit);
        let message_limit = req.message_limit.unwrap_or(self.defaults.message_limit);
        let max_tokens = req.max_tokens.unwrap_or(self.defaults.max_tokens);
        let types: Vec<RecordType> = req
            .record_types
            .clone()
            .unwrap_or_else(|| RecordType::ALL.to_vec());

        let outcome = self
            .engine
            .search(&SearchRequest {
                query: &req.query,
                record_types: &types,
                scope: &resolved.scope,
                limit,
                per_type_limit,
            })
            .await?;

        let mut ranked: Vec<(ScoredRecord, Option<String>)> =
            outcome.results.into_iter().map(|r| (r, None)).collect();
        let file_paths = request_paths(&req.file_paths, &req.query);
        let path_limit = (limit / 2).max(3);
        let mut seen: HashSet<String> =
            ranked.iter().map(|(r, _)| r.record.id().to_string()).collect();
        for path in &file_paths {
            let hits = self
                .engine
                .search_with_vector(
                    &SearchRequest {
                        query: path,
                        record_types: &types,
                        scope: &resolved.scope,
                        limit: path_limit,
                        per_type_limit: path_limit,
                    },
                    None,
                )
                .await;
            match hits {
                Ok(found) => {
                    for hit in found.results {
                        if seen.insert(hit.record.id().to_string()) {
                            ranked.push((hit, Some(path.clone())));
                        }
                    }
                }
                Err(e) => warn!(path = %path, error = %e, "file path lookup failed"),
            }
        }

        let mut items = Vec::with_capacity(ranked.len());
        for (scored, path) in ranked {
            let messages = match &scored.record {
                Record::Session(s) if req.include_messages && message_limit > 0 => {
                    self.engine
                        .store()
                        .list_messages(&s.meta.id, message_limit, true)
                        .await?
                }
                _ => Vec::new(),
            };
            let mut item = to_item(scored, messages);
            if let Some(path) = path {
                item.provenance = format!("file path match ({})", path);
            }
            items.push(item);
        }

        let relevant_items = items.len();
        let low_confidence = relevant_items < self.defaults.min_relevant_items;

        let dropped_for_budget = enforce_budget(&req.query, &mut items, max_tokens);
        let context_text = render_context(&req.query, &items);
        let token_estimate = estimate_tokens(&context_text);

        let signals = ToolSignals::collect(&items);

        let mut counts: BTreeMap<RecordType, usize> = BTreeMap::new();
        let mut projects: BTreeMap<String, usize> = BTreeMap::new();
        for item in &items {
            *counts.entry(item.record_type).or_default() += 1;
            *projects.entry(item.project_id.clone()).or_default() += 1;
        }

        debug!(
            items = items.len(),
            dropped_for_budget,
            token_estimate,
            low_confidence,
            "context assembled"
        );

        Ok(ContextBundle {
            query: req.query.clone(),
            project_id: resolved.project_id,
            scope: resolved.scope,
            refresh,
            keyword_only: outcome.keyword_only,
            low_confidence,
            relevant_items,
            counts,
            projects,
            items,
            file_paths,
            tool_calls_in_context: signals.tools.into_iter().collect(),
            skills_in_context: signals.skills.into_iter().collect(),
            subagents_in_context: signals.subagents.into_iter().collect(),
            dropped_for_budget,
            token_estimate,
            context_text,
        })
    }
}

fn looks_like_path(token: &str) -> bool {
    token.contains('/') || SOURCE_EXTENSIONS.iter().any(|ext| token.ends_with(ext))
}

/// Path-like tokens of `query`, de-duplicated in order.
pub fn extract_paths_from_query(query: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for raw in query.split_whitespace() {
        let token = raw.trim_matches(|c: char| " ,:;()[]{}<>\"'`".contains(c));
        if !token.is_empty() && looks_like_path(token) && !paths.iter().any(|p| p == token) {
            paths.push(token.to_string());
        }
    }
    paths
}

/// Explicit paths first, then inferred ones, without repeats.
fn request_paths(explicit: &[String], query: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    let explicit = explicit.iter().map(|p| p.trim().to_string());
    for path in explicit.chain(extract_paths_from_query(query)) {
        if !path.is_empty() && !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Tool, skill and sub-agent names seen in a bundle's messages.
#[derive(Debug, Default, PartialEq)]
pub struct ToolSignals {
    pub tools: BTreeSet<String>,
    pub skills: BTreeSet<String>,
    pub subagents: BTreeSet<String>,
}

impl ToolSignals {
    pub fn collect(items: &[ContextItem]) -> Self {
        let mut signals = Self::default();
        for item in items {
            if let Record::Message(m) = &item.record {
                signals.add(m);
            }
            for m in &item.messages {
                signals.add(m);
            }
        }
        signals
    }

    fn add(&mut self, message: &Message) {
        self.tools.extend(message.tool_calls.iter().cloned());
        for line in message.content.lines() {
            let Some((name, qualifier)) = parse_tool_call_line(line) else {
                continue;
            };
            self.tools.insert(name.to_string());
            if let Some(q) = qualifier {
                if is_skill_tool(name) {
                    self.skills.insert(q.to_string());
                } else {
                    self.subagents.insert(q.to_string());
                }
            }
        }
    }
}

fn to_item(scored: ScoredRecord, messages: Vec<Message>) -> ContextItem {
    let provenance = scored.provenance();
    let record = scored.record.without_embedding();
    ContextItem {
        id: record.id().to_string(),
        record_type: scored.record_type,
        project_id: record.project_id().to_string(),
        title: record.title(),
        score: scored.score,
        keyword_score: scored.keyword_score,
        vector_score: scored.vector_score,
        signal: scored.signal,
        provenance,
        record,
        messages,
    }
}

/// Rough token count: four characters per token, at least one.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// Drop the weakest items until the rendered text fits `max_tokens`.
///
/// The weakest item has the lowest fused score; ties drop the
/// lowest-priority type first, then the later item. Returns how many
/// items were dropped.
pub fn enforce_budget(query: &str, items: &mut Vec<ContextItem>, max_tokens: usize) -> usize {
    let mut dropped = 0;
    while !items.is_empty() && estimate_tokens(&render_context(query, items)) > max_tokens {
        let mut worst = 0;
        for (i, item) in items.iter().enumerate().skip(1) {
            let w = &items[worst];
            let weaker = item.score < w.score
                || (item.score == w.score
                    && item.record_type.priority() >= w.record_type.priority());
            if weaker {
                worst = i;
            }
        }
        items.remove(worst);
        dropped += 1;
    }
    dropped
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(EXCERPT_CHARS - 1).collect();
    cut.push('…');
    cut
}

fn render_line(item: &ContextItem) -> String {
    match &item.record {
        Record::Session(s) => format!("- [{}] {} :: {}", s.source, s.title, excerpt(&s.summary)),
        Record::Summary(s) => format!("- {}", excerpt(&s.text)),
        Record::Message(m) => format!("- [{}] {}", m.role.as_str(), excerpt(&m.content)),
        Record::Decision(d) => format!("- {}: {}", d.title, excerpt(&d.description)),
        Record::Bug(b) => {
            let detail = if b.root_cause.trim().is_empty() {
                &b.description
            } else {
                &b.root_cause
            };
            format!("- {}: {}", b.title, excerpt(detail))
        }
        Record::Pattern(p) => format!("- {}: {}", p.title, excerpt(&p.description)),
        Record::Thought(t) => format!("- {}", excerpt(&t.content)),
    }
}

fn section_heading(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::Decision => "Relevant decisions:",
        RecordType::Bug => "Relevant bugs:",
        RecordType::Pattern => "Relevant patterns:",
        RecordType::Thought => "Recent thoughts:",
        RecordType::Session => "Relevant sessions:",
        RecordType::Message => "Relevant messages:",
        RecordType::Summary => "Relevant summaries:",
    }
}

/// Plain-text rendering grouped by type, in priority order.
pub fn render_context(query: &str, items: &[ContextItem]) -> String {
    let mut lines = vec![format!("Context for request: {}", query)];
    for record_type in RecordType::ALL {
        let group: Vec<&ContextItem> =
            items.iter().filter(|i| i.record_type == record_type).collect();
        if group.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(section_heading(record_type).to_string());
        for item in group {
            lines.push(render_line(item));
            for m in &item.messages {
                lines.push(format!("    [{}] {}", m.role.as_str(), excerpt(&m.content)));
            }
        }
    }
    lines.join("\n")
}
