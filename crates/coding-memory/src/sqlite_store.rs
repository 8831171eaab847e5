//! SQLite-backed [`KnowledgeStore`] implementation.
//!
//! Records of all seven kinds share the `records` table: a JSON body
//! (embedding stripped) plus the columns needed for filtering and
//! ordering. Keyword search goes through the `records_fts` FTS5 table
//! (BM25); vector search is brute-force cosine over the BLOBs of the
//! requested provider.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use coding_memory_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use coding_memory_core::error::{MemoryError, Result};
use coding_memory_core::models::{Message, Record, RecordType};
use coding_memory_core::store::{query_terms, Candidate, KnowledgeStore, ListSort};
use coding_memory_core::sync::{state_key, SyncState};

const RECORD_COLUMNS: &str = "id, body, embedding, embedding_provider";

/// SQLite implementation of the [`KnowledgeStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// `AND <column> IN (?, ?, ...)` for a project filter, empty when unfiltered.
fn project_clause(filter: Option<&[String]>, column: &str) -> String {
    match filter {
        None => String::new(),
        Some([]) => " AND 0".to_string(),
        Some(ids) => {
            let placeholders = vec!["?"; ids.len()].join(", ");
            format!(" AND {} IN ({})", column, placeholders)
        }
    }
}

/// FTS5 query matching any of the terms, each quoted as a literal.
fn fts_query(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn decode_record(row: &SqliteRow) -> Result<Record> {
    let body: String = row.get("body");
    let mut record: Record = serde_json::from_str(&body).map_err(|e| {
        let id: String = row.get("id");
        MemoryError::store(format!("corrupt record {}: {}", id, e))
    })?;
    let blob: Option<Vec<u8>> = row.get("embedding");
    let provider: Option<String> = row.get("embedding_provider");
    let meta = record.meta_mut();
    meta.embedding = blob.map(|b| blob_to_vec(&b));
    meta.embedding_provider = provider;
    Ok(record)
}

async fn write_record(conn: &mut SqliteConnection, record: &Record) -> sqlx::Result<()> {
    let meta = record.meta();
    let record_type = record.record_type();
    let body = serde_json::to_string(&record.without_embedding())
        .map_err(|e| sqlx::Error::Protocol(format!("encode record {}: {}", meta.id, e)))?;

    let (ordinal, started_at, message_count) = match record {
        Record::Message(m) => (Some(m.ordinal), None, None),
        Record::Session(s) => (
            None,
            Some(s.started_at.timestamp_millis()),
            Some(s.message_count as i64),
        ),
        _ => (None, None, None),
    };
    let blob = meta.embedding.as_deref().map(vec_to_blob);
    let dims = meta.embedding.as_ref().map(|v| v.len() as i64);

    sqlx::query(
        r#"
        INSERT INTO records (id, record_type, project_id, session_id, ordinal,
                             created_at, updated_at, started_at, message_count,
                             body, embedding, embedding_provider, embedding_dims)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            record_type = excluded.record_type,
            project_id = excluded.project_id,
            session_id = excluded.session_id,
            ordinal = excluded.ordinal,
            updated_at = excluded.updated_at,
            started_at = excluded.started_at,
            message_count = excluded.message_count,
            body = excluded.body,
            embedding = excluded.embedding,
            embedding_provider = excluded.embedding_provider,
            embedding_dims = excluded.embedding_dims
        "#,
    )
    .bind(&meta.id)
    .bind(record_type.as_str())
    .bind(&meta.project_id)
    .bind(match record {
        Record::Message(m) => Some(m.session_id.as_str()),
        Record::Summary(s) => Some(s.session_id.as_str()),
        _ => None,
    })
    .bind(ordinal)
    .bind(meta.created_at.timestamp_millis())
    .bind(meta.updated_at.timestamp_millis())
    .bind(started_at)
    .bind(message_count)
    .bind(&body)
    .bind(blob)
    .bind(&meta.embedding_provider)
    .bind(dims)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM records_fts WHERE record_id = ?")
        .bind(&meta.id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        "INSERT INTO records_fts (record_id, record_type, project_id, search_text) VALUES (?, ?, ?, ?)",
    )
    .bind(&meta.id)
    .bind(record_type.as_str())
    .bind(&meta.project_id)
    .bind(record.search_text())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[async_trait]
impl KnowledgeStore for SqliteStore {
    async fn upsert(&self, record: &Record) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(MemoryError::store)?;
        write_record(&mut tx, record)
            .await
            .map_err(MemoryError::store)?;
        tx.commit().await.map_err(MemoryError::store)?;
        Ok(())
    }

    async fn get(&self, record_type: RecordType, id: &str) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT {} FROM records WHERE id = ? AND record_type = ?",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(record_type.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(MemoryError::store)?;
        row.as_ref().map(decode_record).transpose()
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

        let sql = format!(
            r#"
            SELECT r.id, r.body, r.embedding, r.embedding_provider,
                   bm25(records_fts) AS score
            FROM records_fts
            JOIN records r ON r.id = records_fts.record_id
            WHERE records_fts MATCH ? AND records_fts.record_type = ?{}
            ORDER BY score ASC, r.created_at DESC, r.id ASC
            LIMIT ?
            "#,
            project_clause(project_filter, "r.project_id")
        );

        let mut query = sqlx::query(&sql)
            .bind(fts_query(&terms))
            .bind(record_type.as_str());
        for p in project_filter.unwrap_or_default() {
            query = query.bind(p);
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(MemoryError::store)?;

        rows.iter()
            .map(|row| {
                let score: f64 = row.get("score");
                Ok(Candidate {
                    record: decode_record(row)?,
                    raw_score: -score,
                })
            })
            .collect()
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

        let sql = format!(
            r#"
            SELECT {}
            FROM records
            WHERE record_type = ? AND embedding IS NOT NULL
              AND embedding_provider = ? AND embedding_dims = ?{}
            "#,
            RECORD_COLUMNS,
            project_clause(project_filter, "project_id")
        );

        let mut query = sqlx::query(&sql)
            .bind(record_type.as_str())
            .bind(provider)
            .bind(vector.len() as i64);
        for p in project_filter.unwrap_or_default() {
            query = query.bind(p);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(MemoryError::store)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = decode_record(row)?;
            let sim = record
                .meta()
                .embedding
                .as_deref()
                .map(|v| cosine_similarity(vector, v))
                .unwrap_or(0.0);
            candidates.push(Candidate {
                record,
                raw_score: sim as f64,
            });
        }

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.record.created_at().cmp(&a.record.created_at()))
                .then_with(|| a.record.id().cmp(b.record.id()))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn replace_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(MemoryError::store)?;

        sqlx::query(
            "DELETE FROM records_fts WHERE record_id IN (SELECT id FROM records WHERE record_type = 'message' AND session_id = ?)",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(MemoryError::store)?;

        sqlx::query("DELETE FROM records WHERE record_type = 'message' AND session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(MemoryError::store)?;

        for m in messages {
            write_record(&mut tx, &Record::Message(m.clone()))
                .await
                .map_err(MemoryError::store)?;
        }

        tx.commit().await.map_err(MemoryError::store)?;
        Ok(())
    }

    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        newest: bool,
    ) -> Result<Vec<Message>> {
        let order = if newest { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT {} FROM records WHERE record_type = 'message' AND session_id = ? ORDER BY ordinal {} LIMIT ?",
            RECORD_COLUMNS, order
        );
        let rows = sqlx::query(&sql)
            .bind(session_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(MemoryError::store)?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Record::Message(m) = decode_record(row)? {
                messages.push(m);
            }
        }
        if newest {
            messages.reverse();
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
        let order = match sort {
            ListSort::CreatedAt => "created_at DESC",
            ListSort::StartedAt => "COALESCE(started_at, created_at) DESC, created_at DESC",
            ListSort::MessageCount => "COALESCE(message_count, 0) DESC, created_at DESC",
        };
        let sql = format!(
            "SELECT {} FROM records WHERE record_type = ?{} ORDER BY {}, id ASC LIMIT ? OFFSET ?",
            RECORD_COLUMNS,
            project_clause(project_filter, "project_id"),
            order
        );

        let mut query = sqlx::query(&sql).bind(record_type.as_str());
        for p in project_filter.unwrap_or_default() {
            query = query.bind(p);
        }
        let rows = query
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(MemoryError::store)?;

        rows.iter().map(decode_record).collect()
    }

    async fn count(
        &self,
        record_type: RecordType,
        project_filter: Option<&[String]>,
    ) -> Result<usize> {
        let sql = format!(
            "SELECT COUNT(*) FROM records WHERE record_type = ?{}",
            project_clause(project_filter, "project_id")
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(record_type.as_str());
        for p in project_filter.unwrap_or_default() {
            query = query.bind(p);
        }
        let n = query
            .fetch_one(&self.pool)
            .await
            .map_err(MemoryError::store)?;
        Ok(n.max(0) as usize)
    }

    async fn get_sync_state(&self, source: &str, project_id: &str) -> Result<Option<SyncState>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT state_json FROM sync_state WHERE key = ?")
                .bind(state_key(source, project_id))
                .fetch_optional(&self.pool)
                .await
                .map_err(MemoryError::store)?;
        json.map(|j| serde_json::from_str(&j).map_err(MemoryError::store))
            .transpose()
    }

    async fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        let json = serde_json::to_string(state).map_err(MemoryError::store)?;
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, source, project_id, state_json, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.key())
        .bind(&state.source)
        .bind(&state.project_id)
        .bind(&json)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(MemoryError::store)?;
        Ok(())
    }

    async fn list_sync_states(&self) -> Result<Vec<SyncState>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT state_json FROM sync_state ORDER BY key ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(MemoryError::store)?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(MemoryError::store))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coding_memory_core::models::{Decision, RecordMeta, Role};

    async fn open() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("t.db")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    fn decision(id: &str, project: &str, title: &str) -> Record {
        Record::Decision(Decision {
            meta: RecordMeta::new(id, project),
            title: title.to_string(),
            description: "details".to_string(),
            category: "architecture".to_string(),
            context: String::new(),
            alternatives: vec![],
            consequences: vec![],
            tags: vec![],
            source_session_id: None,
        })
    }

    fn message(session: &str, ordinal: i64, text: &str) -> Message {
        Message {
            meta: RecordMeta::new(Message::id_for(session, ordinal), "P"),
            session_id: session.to_string(),
            role: Role::Assistant,
            content: text.to_string(),
            ordinal,
            tool_calls: vec![],
        }
    }

    #[test]
    fn test_project_clause() {
        assert_eq!(project_clause(None, "p"), "");
        let ids = vec!["a".to_string(), "b".to_string()];
        assert_eq!(project_clause(Some(&ids), "p"), " AND p IN (?, ?)");
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        let q = fts_query(&["async".to_string(), "fast\"api".to_string()]);
        assert_eq!(q, "\"async\" OR \"fastapi\"");
    }

    #[tokio::test]
    async fn test_upsert_get_roundtrip_with_embedding() {
        let (_dir, store) = open().await;
        let mut rec = decision("decision::1", "P", "Use FastAPI");
        rec.meta_mut().embedding = Some(vec![0.5, 0.25]);
        rec.meta_mut().embedding_provider = Some("test".to_string());
        store.upsert(&rec).await.unwrap();

        let got = store.get(RecordType::Decision, "decision::1").await.unwrap().unwrap();
        assert_eq!(got, rec);
        assert!(store.get(RecordType::Bug, "decision::1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keyword_search_ranks_and_filters() {
        let (_dir, store) = open().await;
        store.upsert(&decision("decision::1", "P", "async framework choice")).await.unwrap();
        store.upsert(&decision("decision::2", "P", "logging framework")).await.unwrap();
        store.upsert(&decision("decision::3", "Q", "async framework choice")).await.unwrap();

        let filter = vec!["P".to_string()];
        let hits = store
            .keyword_search(RecordType::Decision, "async framework choice", Some(&filter), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.id(), "decision::1");
        assert!(hits[0].raw_score >= hits[1].raw_score);
    }

    #[tokio::test]
    async fn test_reupsert_does_not_duplicate_fts_rows() {
        let (_dir, store) = open().await;
        let rec = decision("decision::1", "P", "sqlite wal");
        store.upsert(&rec).await.unwrap();
        store.upsert(&rec).await.unwrap();
        let hits = store
            .keyword_search(RecordType::Decision, "sqlite", None, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_messages_and_window() {
        let (_dir, store) = open().await;
        let sid = "session::claude-code::abc";
        let first: Vec<Message> = (0..4).map(|i| message(sid, i, "old")).collect();
        store.replace_messages(sid, &first).await.unwrap();
        let second: Vec<Message> = (0..3).map(|i| message(sid, i, "new")).collect();
        store.replace_messages(sid, &second).await.unwrap();

        let all = store.list_messages(sid, 10, false).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|m| m.content == "new"));

        let tail = store.list_messages(sid, 2, true).await.unwrap();
        assert_eq!(tail.iter().map(|m| m.ordinal).collect::<Vec<_>>(), vec![1, 2]);

        let old_hits = store
            .keyword_search(RecordType::Message, "old", None, 10)
            .await
            .unwrap();
        assert!(old_hits.is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_same_provider_only() {
        let (_dir, store) = open().await;
        let mut a = decision("decision::a", "P", "a");
        a.meta_mut().embedding = Some(vec![1.0, 0.0]);
        a.meta_mut().embedding_provider = Some("p1".to_string());
        let mut b = decision("decision::b", "P", "b");
        b.meta_mut().embedding = Some(vec![1.0, 0.0]);
        b.meta_mut().embedding_provider = Some("p2".to_string());
        store.upsert(&a).await.unwrap();
        store.upsert(&b).await.unwrap();

        let hits = store
            .vector_search(RecordType::Decision, &[0.9, 0.1], "p1", None, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id(), "decision::a");
    }

    #[tokio::test]
    async fn test_sync_state_persistence() {
        let (_dir, store) = open().await;
        let mut state = SyncState::new("codex", "/work/app");
        state.record_import("/logs/1.jsonl", "fp", "session::codex::1", None, 4);
        state.record_skip("/logs/2.jsonl", "fp-2");
        store.save_sync_state(&state).await.unwrap();
        store.save_sync_state(&state).await.unwrap();

        let loaded = store.get_sync_state("codex", "/work/app").await.unwrap();
        assert_eq!(loaded, Some(state));
        assert_eq!(store.list_sync_states().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_count_and_list() {
        let (_dir, store) = open().await;
        for i in 0..3 {
            store
                .upsert(&decision(&format!("decision::{}", i), "P", "x"))
                .await
                .unwrap();
        }
        store.upsert(&decision("decision::q", "Q", "x")).await.unwrap();
        let filter = vec!["P".to_string()];
        assert_eq!(store.count(RecordType::Decision, Some(&filter)).await.unwrap(), 3);
        assert_eq!(store.count(RecordType::Decision, None).await.unwrap(), 4);
        let page = store
            .list(RecordType::Decision, Some(&filter), ListSort::CreatedAt, 2, 0)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }
}
