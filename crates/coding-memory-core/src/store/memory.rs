//! In-memory [`KnowledgeStore`] for tests and embedding in other hosts.
//!
//! Records live in one `BTreeMap` per collection behind
//! `std::sync::RwLock`. Keyword search is term-frequency scoring over
//! [`Record::search_text`]; vector search is brute-force cosine over the
//! stored vectors of the requested provider.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{MemoryError, Result};
use crate::models::{Message, Record, RecordType};
use crate::sync::{state_key, SyncState};

use super::{query_terms, Candidate, KnowledgeStore, ListSort};

type Collections = HashMap<RecordType, BTreeMap<String, Record>>;

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<Collections>,
    sync_states: RwLock<BTreeMap<String, SyncState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Collections>> {
        self.records
            .read()
            .map_err(|_| MemoryError::store("record lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Collections>> {
        self.records
            .write()
            .map_err(|_| MemoryError::store("record lock poisoned"))
    }
}

fn in_filter(record: &Record, filter: Option<&[String]>) -> bool {
    match filter {
        None => true,
        Some(ids) => ids.iter().any(|p| p == record.project_id()),
    }
}

fn term_score(text: &str, terms: &[String]) -> f64 {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if !word.is_empty() {
            *counts.entry(word.to_lowercase()).or_default() += 1;
        }
    }
    terms
        .iter()
        .map(|t| {
            let tf = counts.get(t).copied().unwrap_or(0) as f64;
            tf / (tf + 1.2)
        })
        .sum()
}

/// Best score first; ties newest first, then id.
fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.record.created_at().cmp(&a.record.created_at()))
            .then_with(|| a.record.id().cmp(b.record.id()))
    });
}

fn sort_key(record: &Record, sort: ListSort) -> (i64, i64) {
    let created = record.created_at().timestamp_millis();
    match (record, sort) {
        (Record::Session(s), ListSort::StartedAt) => (s.started_at.timestamp_millis(), created),
        (Record::Session(s), ListSort::MessageCount) => (s.message_count as i64, created),
        _ => (created, 0),
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn upsert(&self, record: &Record) -> Result<()> {
        let mut records = self.write()?;
        records
            .entry(record.record_type())
            .or_default()
            .insert(record.id().to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, record_type: RecordType, id: &str) -> Result<Option<Record>> {
        let records = self.read()?;
        Ok(records.get(&record_type).and_then(|c| c.get(id)).cloned())
    }

    async fn keyword_search(
        &self,
        record_type: RecordType,
        text: &str,
        project_filter: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let terms = query_terms(text);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let records = self.read()?;
        let mut candidates: Vec<Candidate> = records
            .get(&record_type)
            .into_iter()
            .flat_map(|c| c.values())
            .filter(|r| in_filter(r, project_filter))
            .filter_map(|r| {
                let score = term_score(&r.search_text(), &terms);
                (score > 0.0).then(|| Candidate {
                    record: r.clone(),
                    raw_score: score,
                })
            })
            .collect();
        rank(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        record_type: RecordType,
        vector: &[f32],
        provider: &str,
        project_filter: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if vector.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let records = self.read()?;
        let mut candidates: Vec<Candidate> = records
            .get(&record_type)
            .into_iter()
            .flat_map(|c| c.values())
            .filter(|r| in_filter(r, project_filter))
            .filter_map(|r| {
                let meta = r.meta();
                let stored = meta.embedding.as_ref()?;
                if meta.embedding_provider.as_deref() != Some(provider)
                    || stored.len() != vector.len()
                {
                    return None;
                }
                Some(Candidate {
                    record: r.clone(),
                    raw_score: cosine_similarity(vector, stored) as f64,
                })
            })
            .collect();
        rank(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn replace_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let mut records = self.write()?;
        let collection = records.entry(RecordType::Message).or_default();
        collection.retain(|_, r| r.session_id() != Some(session_id));
        for m in messages {
            collection.insert(m.meta.id.clone(), Record::Message(m.clone()));
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        newest: bool,
    ) -> Result<Vec<Message>> {
        let records = self.read()?;
        let mut messages: Vec<Message> = records
            .get(&RecordType::Message)
            .into_iter()
            .flat_map(|c| c.values())
            .filter_map(|r| match r {
                Record::Message(m) if m.session_id == session_id => Some(m.clone()),
                _ => None,
            })
            .collect();
        messages.sort_by_key(|m| m.ordinal);
        if newest && messages.len() > limit {
            messages.drain(..messages.len() - limit);
        } else {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    async fn list(
        &self,
        record_type: RecordType,
        project_filter: Option<&[String]>,
        sort: ListSort,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>> {
        let records = self.read()?;
        let mut out: Vec<&Record> = records
            .get(&record_type)
            .into_iter()
            .flat_map(|c| c.values())
            .filter(|r| in_filter(r, project_filter))
            .collect();
        out.sort_by(|a, b| {
            sort_key(b, sort)
                .cmp(&sort_key(a, sort))
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(out.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn count(
        &self,
        record_type: RecordType,
        project_filter: Option<&[String]>,
    ) -> Result<usize> {
        let records = self.read()?;
        Ok(records
            .get(&record_type)
            .map(|c| c.values().filter(|r| in_filter(r, project_filter)).count())
            .unwrap_or(0))
    }

    async fn get_sync_state(&self, source: &str, project_id: &str) -> Result<Option<SyncState>> {
        let states = self
            .sync_states
            .read()
            .map_err(|_| MemoryError::store("sync lock poisoned"))?;
        Ok(states.get(&state_key(source, project_id)).cloned())
    }

    async fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        let mut states = self
            .sync_states
            .write()
            .map_err(|_| MemoryError::store("sync lock poisoned"))?;
        states.insert(state.key(), state.clone());
        Ok(())
    }

    async fn list_sync_states(&self) -> Result<Vec<SyncState>> {
        let states = self
            .sync_states
            .read()
            .map_err(|_| MemoryError::store("sync lock poisoned"))?;
        Ok(states.values().cloned().collect())
    }
}
