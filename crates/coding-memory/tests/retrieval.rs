//! End-to-end retrieval and import behaviour over the SQLite store.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use coding_memory::config::{Config, SourceConfig};
use coding_memory::db;
use coding_memory::migrate;
use coding_memory::service::{
    MemoryService, NewBug, NewDecision, NewMessage, NewSession, NewThought, SearchQuery,
};
use coding_memory::sqlite_store::SqliteStore;
use coding_memory::sync::PassOutcome;
use coding_memory_core::context::ContextRequest;
use coding_memory_core::embedding::{DisabledEmbedder, Embedder};
use coding_memory_core::models::{Record, RecordType, Role};
use coding_memory_core::scope::ScopeRequest;
use coding_memory_core::store::KnowledgeStore;
use coding_memory_core::sync::{RefreshOutcome, SyncTrigger};

/// Three-axis embedder: async-ness, event loops, everything else.
struct TopicEmbedder;

#[async_trait]
impl Embedder for TopicEmbedder {
    fn provider_tag(&self) -> &str {
        "test:topics"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let t = text.to_lowercase();
        let hit = |words: &[&str]| {
            if words.iter().any(|w| t.contains(w)) {
                1.0
            } else {
                0.0
            }
        };
        Some(vec![
            hit(&["async", "event loop", "await"]),
            hit(&["loop", "blocking"]),
            0.1,
        ])
    }
}

async fn sqlite_store(dir: &TempDir) -> Arc<dyn KnowledgeStore> {
    let pool = db::connect_path(&dir.path().join("memory.db")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

fn config_with_logs(logs: Option<&Path>) -> Config {
    let mut config = Config::default();
    config.scope.current_project_id = Some("/work/shop".to_string());
    let mut sources = BTreeMap::new();
    if let Some(path) = logs {
        sources.insert(
            "generic-json".to_string(),
            SourceConfig {
                path: Some(path.to_path_buf()),
                enabled: true,
                auto_import_on_start: true,
            },
        );
    }
    config.sync.sources = sources;
    config
}

fn write_session(dir: &Path, name: &str, title: &str, messages: &[&str]) -> std::path::PathBuf {
    let messages: Vec<serde_json::Value> = messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            serde_json::json!({
                "role": if i % 2 == 0 { "user" } else { "assistant" },
                "content": m,
            })
        })
        .collect();
    let body = serde_json::json!({
        "title": title,
        "directory": "/work/shop",
        "messages": messages,
    });
    let path = dir.join(name);
    fs::write(&path, serde_json::to_string(&body).unwrap()).unwrap();
    path
}

fn set_mtime(path: &Path, when: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(when)
        .unwrap();
}

#[tokio::test]
async fn test_keyword_decision_outranks_vector_bug() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let mut config = config_with_logs(None);
    config.sync.auto_import_on_query = false;
    let svc = MemoryService::new(store, Arc::new(TopicEmbedder), &config).unwrap();

    let d1 = svc
        .save_decision(NewDecision {
            project_id: "P".to_string(),
            title: "Use FastAPI".to_string(),
            description: "Framework choice for the API: FastAPI for its async framework support"
                .to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let b1 = svc
        .save_bug(NewBug {
            project_id: "P".to_string(),
            title: "Handlers stall".to_string(),
            description: "A blocking call inside an await point froze the event loop".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let bundle = svc
        .context_for_request(&ContextRequest {
            query: "async framework choice".to_string(),
            scope: ScopeRequest::project("P"),
            limit: Some(5),
            ..Default::default()
        })
        .await
        .unwrap();

    let ids: Vec<&str> = bundle.items.iter().map(|i| i.id.as_str()).collect();
    let d_pos = ids.iter().position(|id| *id == d1).unwrap();
    let b_pos = ids.iter().position(|id| *id == b1).unwrap();
    assert!(d_pos < b_pos, "decision should rank above bug: {:?}", ids);
    assert!(!bundle.keyword_only);
    assert!(!bundle.low_confidence);
    assert!(bundle.context_text.contains("Use FastAPI"));
}

#[tokio::test]
async fn test_limit_one_returns_top_fused_item() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let mut config = config_with_logs(None);
    config.sync.auto_import_on_query = false;
    let svc = MemoryService::new(store, Arc::new(DisabledEmbedder), &config).unwrap();

    let mut best = String::new();
    for i in 0..10 {
        // Only the last note mentions the term three times.
        let content = if i == 9 {
            "retry retry retry the payment webhook".to_string()
        } else {
            format!("note {} about the payment retry", i)
        };
        let id = svc
            .save_thought(NewThought {
                project_id: "P".to_string(),
                content,
                ..Default::default()
            })
            .await
            .unwrap();
        if i == 9 {
            best = id;
        }
    }

    let full = svc
        .search(&SearchQuery {
            query: "retry".to_string(),
            scope: ScopeRequest::project("P"),
            limit: Some(10),
            per_type_limit: Some(10),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(full.results.len(), 10);

    let top = svc
        .search(&SearchQuery {
            query: "retry".to_string(),
            scope: ScopeRequest::project("P"),
            limit: Some(1),
            per_type_limit: Some(10),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(top.results.len(), 1);
    assert_eq!(top.results[0].record.id(), full.results[0].record.id());
    assert_eq!(top.results[0].record.id(), best);
}

#[tokio::test]
async fn test_scope_never_leaks_other_projects() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let mut config = config_with_logs(None);
    config.sync.auto_import_on_query = false;
    let svc = MemoryService::new(store, Arc::new(DisabledEmbedder), &config).unwrap();

    for project in ["/work/shop", "/work/lib", "/work/other"] {
        svc.save_thought(NewThought {
            project_id: project.to_string(),
            content: format!("connection pool sizing for {}", project),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    let projects_of = |results: &[coding_memory_core::search::ScoredRecord]| {
        let mut ps: Vec<String> = results
            .iter()
            .map(|r| r.record.project_id().to_string())
            .collect();
        ps.sort();
        ps
    };

    let own = svc
        .search(&SearchQuery {
            query: "connection pool".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(projects_of(&own.results), vec!["/work/shop"]);

    let related = svc
        .search(&SearchQuery {
            query: "connection pool".to_string(),
            scope: ScopeRequest::project("/work/shop/").with_related(vec!["/work/lib".into()]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(projects_of(&related.results), vec!["/work/lib", "/work/shop"]);

    let all = svc
        .search(&SearchQuery {
            query: "connection pool".to_string(),
            scope: ScopeRequest::all_projects(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.results.len(), 3);
}

#[tokio::test]
async fn test_import_is_idempotent_and_replaces_on_update() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    fs::create_dir_all(&logs).unwrap();
    let path = write_session(
        &logs,
        "checkout.json",
        "Checkout double charge",
        &["why does checkout charge twice", "the webhook retries", "add an idempotency key"],
    );

    let store = sqlite_store(&dir).await;
    let mut config = config_with_logs(Some(&logs));
    config.sync.auto_import_on_query = false;
    let svc = MemoryService::new(store.clone(), Arc::new(DisabledEmbedder), &config).unwrap();

    let first = svc.sync().sync_now(None, None, true).await.unwrap();
    assert!(matches!(&first[0].outcome, PassOutcome::Completed(r) if r.sessions == 1 && r.messages == 3));

    let again = svc.sync().sync_now(None, None, true).await.unwrap();
    assert!(matches!(&again[0].outcome, PassOutcome::Completed(r) if r.sessions == 0 && r.skipped == 1));
    assert_eq!(store.count(RecordType::Session, None).await.unwrap(), 1);
    assert_eq!(store.count(RecordType::Message, None).await.unwrap(), 3);

    // The assistant rewrites the log: fewer turns, newer mtime.
    write_session(
        &logs,
        "checkout.json",
        "Checkout double charge",
        &["why does checkout charge twice", "fixed with an idempotency key"],
    );
    set_mtime(&path, SystemTime::now() + Duration::from_secs(120));

    let updated = svc.sync().sync_now(None, None, true).await.unwrap();
    assert!(matches!(&updated[0].outcome, PassOutcome::Completed(r) if r.sessions == 1));
    assert_eq!(store.count(RecordType::Session, None).await.unwrap(), 1);
    assert_eq!(store.count(RecordType::Message, None).await.unwrap(), 2);

    let sessions = svc
        .list_sessions(&ScopeRequest::default(), Default::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(sessions.total, 1);
    let Record::Session(session) = &sessions.sessions[0] else {
        panic!("expected a session");
    };
    assert_eq!(session.message_count, 2);
    assert_eq!(session.meta.project_id, "/work/shop");

    let status = svc.sync().status().await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].fingerprints, 1);
}

#[tokio::test]
async fn test_cursor_does_not_move_backward() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    fs::create_dir_all(&logs).unwrap();
    let newer = write_session(&logs, "b.json", "Newer", &["second session"]);
    set_mtime(&newer, SystemTime::now() - Duration::from_secs(60));

    let store = sqlite_store(&dir).await;
    let svc = MemoryService::new(
        store,
        Arc::new(DisabledEmbedder),
        &config_with_logs(Some(&logs)),
    )
    .unwrap();
    svc.sync().sync_now(None, None, true).await.unwrap();
    let cursor = svc.sync().status().await.unwrap()[0].cursor.unwrap();

    // A late-arriving file with an older mtime.
    let older = write_session(&logs, "a.json", "Older", &["first session"]);
    set_mtime(&older, SystemTime::now() - Duration::from_secs(3600));
    let runs = svc.sync().sync_now(None, None, true).await.unwrap();
    assert!(matches!(&runs[0].outcome, PassOutcome::Completed(r) if r.sessions == 1));

    let status = svc.sync().status().await.unwrap();
    assert_eq!(status[0].cursor.unwrap(), cursor);
    assert_eq!(status[0].sessions_imported, 2);
}

#[tokio::test]
async fn test_queries_within_cooldown_scan_once() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    fs::create_dir_all(&logs).unwrap();
    write_session(&logs, "s.json", "Pool tuning", &["tune the connection pool"]);

    let store = sqlite_store(&dir).await;
    let svc = MemoryService::new(
        store,
        Arc::new(DisabledEmbedder),
        &config_with_logs(Some(&logs)),
    )
    .unwrap();

    let query = SearchQuery {
        query: "connection pool".to_string(),
        ..Default::default()
    };
    let first = svc.search(&query).await.unwrap();
    assert!(!first.results.is_empty(), "first query should see the imported session");
    let second = svc.search(&query).await.unwrap();
    assert_eq!(
        serde_json::to_value(&second.refresh).unwrap()["status"],
        "cooldown"
    );

    let status = svc.sync().status().await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].project_id, "/work/shop");
    assert_eq!(status[0].runs, 1);
}

#[tokio::test]
async fn test_unrelated_vectors_leave_results_sparse() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let mut config = config_with_logs(None);
    config.sync.auto_import_on_query = false;
    let svc = MemoryService::new(store, Arc::new(TopicEmbedder), &config).unwrap();

    svc.save_decision(NewDecision {
        project_id: "P".to_string(),
        title: "Use FastAPI".to_string(),
        description: "async framework for the API".to_string(),
        ..Default::default()
    })
    .await
    .unwrap();
    svc.save_bug(NewBug {
        project_id: "P".to_string(),
        title: "Handlers stall".to_string(),
        description: "blocking call froze the event loop".to_string(),
        ..Default::default()
    })
    .await
    .unwrap();

    // Embeds to the catch-all axis only and shares no terms with either record.
    let bundle = svc
        .context_for_request(&ContextRequest {
            query: "quarterly invoice totals".to_string(),
            scope: ScopeRequest::project("P"),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!bundle.keyword_only);
    assert!(bundle.items.is_empty(), "got {:?}", bundle.items);
    assert_eq!(bundle.relevant_items, 0);
    assert!(bundle.low_confidence);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_message_capture_keeps_every_message() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let mut config = config_with_logs(None);
    config.sync.auto_import_on_query = false;
    let svc = MemoryService::new(store.clone(), Arc::new(DisabledEmbedder), &config).unwrap();

    let ingested = svc
        .ingest_session(NewSession {
            title: "Release checklist".to_string(),
            directory: "/work/shop".to_string(),
            messages: vec![NewMessage {
                role: Some("user".to_string()),
                content: "walk through the release".to_string(),
                tool_calls: vec![],
            }],
            ..Default::default()
        })
        .await
        .unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let svc = svc.clone();
            let session_id = ingested.session_id.clone();
            tokio::spawn(async move {
                svc.ingest_message(
                    &session_id,
                    Role::Assistant,
                    &format!("checked item {}", i),
                    vec![],
                    None,
                )
                .await
                .unwrap()
                .ordinal
            })
        })
        .collect();
    let mut ordinals = Vec::new();
    for task in tasks {
        ordinals.push(task.await.unwrap());
    }
    ordinals.sort_unstable();
    assert_eq!(ordinals, (1..=8).collect::<Vec<i64>>());

    let messages = store
        .list_messages(&ingested.session_id, 100, false)
        .await
        .unwrap();
    assert_eq!(messages.len(), 9);
    let detail = svc.get_session(&ingested.session_id, false, 0).await.unwrap();
    let Record::Session(session) = &detail.session else {
        panic!("expected a session");
    };
    assert_eq!(session.message_count, 9);
}

#[tokio::test]
async fn test_rewritten_foreign_log_does_not_grow_sync_state() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    fs::create_dir_all(&logs).unwrap();
    write_session(&logs, "mine.json", "Ours", &["tune the connection pool"]);
    let foreign = logs.join("theirs.json");

    let store = sqlite_store(&dir).await;
    let mut config = config_with_logs(Some(&logs));
    config.sync.auto_import_on_query = false;
    let svc = MemoryService::new(store, Arc::new(DisabledEmbedder), &config).unwrap();

    let base = SystemTime::now() - Duration::from_secs(3600);
    for round in 0..5u64 {
        let body = serde_json::json!({
            "title": "Elsewhere",
            "directory": "/work/analytics",
            "messages": [{"role": "user", "content": format!("draft {}", round)}],
        });
        fs::write(&foreign, body.to_string()).unwrap();
        set_mtime(&foreign, base + Duration::from_secs(round * 10));

        svc.sync()
            .sync_now(None, Some("/work/shop"), true)
            .await
            .unwrap();
        let status = svc.sync().status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].fingerprints, 2, "round {}", round);
    }
}

/// Embedder that reports its first call and then stalls, keeping an
/// import pass busy.
struct StallingEmbedder {
    started: Arc<Notify>,
}

#[async_trait]
impl Embedder for StallingEmbedder {
    fn provider_tag(&self) -> &str {
        "test:stall"
    }

    fn dims(&self) -> usize {
        2
    }

    async fn embed(&self, _text: &str) -> Option<Vec<f32>> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        Some(vec![1.0, 0.0])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_query_refresh_during_startup_scan_does_not_wait() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    fs::create_dir_all(&logs).unwrap();
    for i in 0..3 {
        write_session(
            &logs,
            &format!("s{}.json", i),
            &format!("Session {}", i),
            &["first turn", "second turn"],
        );
    }

    let store = sqlite_store(&dir).await;
    let started = Arc::new(Notify::new());
    let svc = MemoryService::new(
        store.clone(),
        Arc::new(StallingEmbedder {
            started: started.clone(),
        }),
        &config_with_logs(Some(&logs)),
    )
    .unwrap();

    let startup = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.start().await })
    };
    started.notified().await;

    let refresh = tokio::time::timeout(
        Duration::from_millis(500),
        svc.sync().refresh_for_query(""),
    )
    .await
    .expect("query-time refresh waited on the startup pass");
    assert_eq!(refresh, RefreshOutcome::InFlight);

    let outcome = startup.await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Completed {
            sessions: 3,
            messages: 6
        }
    );
    assert_eq!(store.count(RecordType::Session, None).await.unwrap(), 3);
    assert_eq!(store.count(RecordType::Message, None).await.unwrap(), 6);
    assert_eq!(svc.sync().status().await.unwrap()[0].sessions_imported, 3);
}
