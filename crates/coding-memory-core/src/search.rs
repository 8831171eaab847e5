//! Hybrid search over the knowledge store.
//!
//! The engine operates entirely through the [`KnowledgeStore`] and
//! [`Embedder`] traits, with no database or configuration dependencies.
//!
//! # Hybrid Scoring Algorithm
//!
//! For every requested record type:
//!
//! 1. Fetch `per_type_limit × oversample` keyword candidates.
//! 2. If the query could be embedded, fetch as many vector candidates
//!    (same provider only) and drop those with cosine similarity at or
//!    below `min_similarity`.
//! 3. De-duplicate each candidate set by record id, keeping the max raw
//!    score.
//! 4. Normalize both sets to `[0, 1]` using min-max normalization; a
//!    record absent from one set scores `0.0` on that axis. A vector set
//!    with no spread keeps its raw similarity clamped to `[0, 1]`.
//! 5. Fuse: `score = w_vector × vector + w_keyword × keyword`. Without a
//!    query vector the weights collapse to keyword-only (`w_keyword = 1`).
//! 6. Sort by score (desc), created_at (desc), id (asc).
//! 7. Truncate to `per_type_limit`.
//!
//! The per-type lists are then merged k-way: each list keeps its order,
//! heads are compared by fused score with ties going to the higher
//! priority type, and the merge stops at `limit`.
//!
//! ```text
//!   decisions ─┐
//!   bugs      ─┼──▶ k-way merge (score, type priority) ──▶ top `limit`
//!   ...       ─┘
//! ```

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::embedding::Embedder;
use crate::error::{MemoryError, Result};
use crate::models::{Record, RecordType};
use crate::scope::Scope;
use crate::store::{Candidate, KnowledgeStore};

/// Fusion and oversampling parameters, decoupled from app config.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub weight_vector: f64,
    pub weight_keyword: f64,
    /// Candidate oversampling factor `K`; each query fetches
    /// `per_type_limit × K` candidates.
    pub oversample: usize,
    /// Vector candidates at or below this cosine similarity are not matches.
    pub min_similarity: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            weight_vector: 0.5,
            weight_keyword: 0.5,
            oversample: 3,
            min_similarity: 0.2,
        }
    }
}

impl SearchParams {
    pub fn validate(&self) -> Result<()> {
        if self.weight_vector < 0.0 || self.weight_keyword < 0.0 {
            return Err(MemoryError::InvalidInput(
                "fusion weights must be non-negative".to_string(),
            ));
        }
        if self.weight_vector + self.weight_keyword <= 0.0 {
            return Err(MemoryError::InvalidInput(
                "at least one fusion weight must be positive".to_string(),
            ));
        }
        if !(-1.0..1.0).contains(&self.min_similarity) {
            return Err(MemoryError::InvalidInput(format!(
                "min_similarity must be in [-1, 1), got {}",
                self.min_similarity
            )));
        }
        if self.oversample < 2 {
            return Err(MemoryError::InvalidInput(format!(
                "oversample must be >= 2, got {}",
                self.oversample
            )));
        }
        Ok(())
    }
}

/// Inputs for one search call.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub record_types: &'a [RecordType],
    pub scope: &'a Scope,
    pub limit: usize,
    pub per_type_limit: usize,
}

/// Which signal put a record into the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSignal {
    Keyword,
    Vector,
    Both,
}

/// One ranked result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredRecord {
    pub record: Record,
    pub record_type: RecordType,
    /// Fused score in `[0, 1]`.
    pub score: f64,
    /// Normalized keyword score (0.0 if absent from keyword candidates).
    pub keyword_score: f64,
    /// Normalized vector score (0.0 if absent from vector candidates).
    pub vector_score: f64,
    pub signal: MatchSignal,
}

impl ScoredRecord {
    /// Human-readable note on why the record was included.
    pub fn provenance(&self) -> String {
        match self.signal {
            MatchSignal::Keyword => format!("keyword match (keyword {:.2})", self.keyword_score),
            MatchSignal::Vector => format!("semantic match (vector {:.2})", self.vector_score),
            MatchSignal::Both => format!(
                "keyword and semantic match (keyword {:.2}, vector {:.2})",
                self.keyword_score, self.vector_score
            ),
        }
    }
}

/// Result of [`HybridSearchEngine::search`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<ScoredRecord>,
    /// True when no query vector was available and ranking was keyword-only.
    pub keyword_only: bool,
}

/// Hybrid keyword + vector ranking across record types.
#[derive(Clone)]
pub struct HybridSearchEngine {
    store: Arc<dyn KnowledgeStore>,
    embedder: Arc<dyn Embedder>,
    params: SearchParams,
}

impl HybridSearchEngine {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: Arc<dyn Embedder>,
        params: SearchParams,
    ) -> Self {
        Self {
            store,
            embedder,
            params,
        }
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    /// Embed the query once, then rank.
    pub async fn search(&self, req: &SearchRequest<'_>) -> Result<SearchOutcome> {
        if req.query.trim().is_empty() {
            return Ok(SearchOutcome {
                results: Vec::new(),
                keyword_only: true,
            });
        }
        let query_vec = if self.embedder.is_enabled() {
            self.embedder.embed(req.query).await
        } else {
            None
        };
        if query_vec.is_none() && self.embedder.is_enabled() {
            debug!("query embedding unavailable, ranking keyword-only");
        }
        self.search_with_vector(req, query_vec.as_deref()).await
    }

    /// Rank with a pre-computed query vector (`None` = keyword-only).
    pub async fn search_with_vector(
        &self,
        req: &SearchRequest<'_>,
        query_vec: Option<&[f32]>,
    ) -> Result<SearchOutcome> {
        let keyword_only = query_vec.is_none();
        if req.query.trim().is_empty() || req.limit == 0 {
            return Ok(SearchOutcome {
                results: Vec::new(),
                keyword_only,
            });
        }

        let per_type_limit = if req.per_type_limit == 0 {
            req.limit
        } else {
            req.per_type_limit
        };
        let fetch = per_type_limit.saturating_mul(self.params.oversample.max(2));
        let (w_vector, w_keyword) = if keyword_only {
            (0.0, 1.0)
        } else {
            (self.params.weight_vector, self.params.weight_keyword)
        };
        let filter = req.scope.project_filter();
        let provider = self.embedder.provider_tag();

        let mut types = req.record_types.to_vec();
        types.sort();
        types.dedup();

        let mut per_type: Vec<Vec<ScoredRecord>> = Vec::with_capacity(types.len());
        for record_type in types {
            let keyword = self
                .store
                .keyword_search(record_type, req.query, filter, fetch)
                .await?;
            let mut vector = match query_vec {
                Some(qv) => {
                    self.store
                        .vector_search(record_type, qv, provider, filter, fetch)
                        .await?
                }
                None => Vec::new(),
            };
            vector.retain(|c| c.raw_score > self.params.min_similarity);
            debug!(
                record_type = %record_type,
                keyword = keyword.len(),
                vector = vector.len(),
                "fetched candidates"
            );

            let mut fused = fuse(record_type, keyword, vector, w_vector, w_keyword);
            fused.truncate(per_type_limit);
            per_type.push(fused);
        }

        Ok(SearchOutcome {
            results: merge_by_priority(per_type, req.limit),
            keyword_only,
        })
    }
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(raw: &[f64]) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }
    let s_min = raw.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    raw.iter()
        .map(|s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Normalize cosine similarities. Min-max when the set has spread;
/// otherwise the raw similarity clamped to `[0.0, 1.0]`, so a lone weak
/// match stays weak.
pub fn normalize_similarities(raw: &[f64]) -> Vec<f64> {
    let s_min = raw.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if raw.len() < 2 || (s_max - s_min).abs() < f64::EPSILON {
        return raw.iter().map(|s| s.clamp(0.0, 1.0)).collect();
    }
    normalize_scores(raw)
}

/// Collapse a candidate set to one entry per id (max raw score), then
/// normalize with `normalize`.
fn normalized_by_id(
    candidates: Vec<Candidate>,
    normalize: fn(&[f64]) -> Vec<f64>,
) -> HashMap<String, (Record, f64)> {
    let mut best: HashMap<String, Candidate> = HashMap::new();
    for c in candidates {
        match best.get(c.record.id()) {
            Some(existing) if existing.raw_score >= c.raw_score => {}
            _ => {
                best.insert(c.record.id().to_string(), c);
            }
        }
    }
    let entries: Vec<Candidate> = best.into_values().collect();
    let raw: Vec<f64> = entries.iter().map(|c| c.raw_score).collect();
    entries
        .into_iter()
        .zip(normalize(&raw))
        .map(|(c, s)| (c.record.id().to_string(), (c.record, s)))
        .collect()
}

/// Fuse keyword and vector candidates of one type into a sorted list.
pub fn fuse(
    record_type: RecordType,
    keyword: Vec<Candidate>,
    vector: Vec<Candidate>,
    w_vector: f64,
    w_keyword: f64,
) -> Vec<ScoredRecord> {
    let mut kw = normalized_by_id(keyword, normalize_scores);
    let vec = normalized_by_id(vector, normalize_similarities);

    let mut out: Vec<ScoredRecord> = Vec::with_capacity(kw.len() + vec.len());
    for (id, (record, v)) in vec {
        let k = kw.remove(&id).map(|(_, s)| s);
        let signal = if k.is_some() {
            MatchSignal::Both
        } else {
            MatchSignal::Vector
        };
        let k = k.unwrap_or(0.0);
        out.push(ScoredRecord {
            record,
            record_type,
            score: w_vector * v + w_keyword * k,
            keyword_score: k,
            vector_score: v,
            signal,
        });
    }
    for (_, (record, k)) in kw {
        out.push(ScoredRecord {
            record,
            record_type,
            score: w_keyword * k,
            keyword_score: k,
            vector_score: 0.0,
            signal: MatchSignal::Keyword,
        });
    }

    out.sort_by(compare_ranked);
    out
}

/// Score desc, created_at desc, id asc.
fn compare_ranked(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.record.created_at().cmp(&a.record.created_at()))
        .then_with(|| a.record.id().cmp(b.record.id()))
}

/// K-way merge of per-type sorted lists.
///
/// Each list keeps its internal order. At every step the head with the
/// highest fused score is taken; ties go to the higher-priority type, then
/// fall back to the usual recency and id order.
pub fn merge_by_priority(lists: Vec<Vec<ScoredRecord>>, limit: usize) -> Vec<ScoredRecord> {
    let mut queues: Vec<VecDeque<ScoredRecord>> =
        lists.into_iter().map(VecDeque::from).collect();
    let mut out = Vec::with_capacity(limit.min(64));

    while out.len() < limit {
        let mut pick: Option<(usize, &ScoredRecord)> = None;
        for (i, queue) in queues.iter().enumerate() {
            let Some(head) = queue.front() else {
                continue;
            };
            match pick {
                Some((_, best)) if merge_order(head, best) != Ordering::Less => {}
                _ => pick = Some((i, head)),
            }
        }
        let Some((i, _)) = pick else {
            break;
        };
        match queues[i].pop_front() {
            Some(item) => out.push(item),
            None => break,
        }
    }
    out
}

fn merge_order(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.record_type.priority().cmp(&b.record_type.priority()))
        .then_with(|| b.record.created_at().cmp(&a.record.created_at()))
        .then_with(|| a.record.id().cmp(b.record.id()))
}
