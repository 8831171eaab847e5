use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cmem_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cmem");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let logs_dir = root.join("logs");
    fs::create_dir_all(&logs_dir).unwrap();
    fs::write(
        logs_dir.join("checkout.json"),
        r#"{"title":"Checkout double charge","directory":"/work/shop","messages":[
            {"role":"user","content":"Why does checkout charge customers twice?"},
            {"role":"assistant","content":"The payment webhook is retried without an idempotency key."}
        ]}"#,
    )
    .unwrap();
    fs::write(
        logs_dir.join("reports.json"),
        r#"{"title":"Slow reports","directory":"/work/analytics","messages":[
            {"role":"user","content":"The monthly report query takes minutes."}
        ]}"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/memory.db"

[scope]
current_project_id = "/work/shop"

[sync]
cooldown_secs = 300

[sync.sources.generic-json]
path = "{root}/logs"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("cmem.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cmem(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cmem_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cmem binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run_json(config_path: &Path, args: &[&str]) -> serde_json::Value {
    let (stdout, stderr, success) = run_cmem(config_path, args);
    assert!(success, "cmem {:?} failed: {}", args, stderr);
    serde_json::from_str(&stdout)
        .unwrap_or_else(|e| panic!("cmem {:?} printed invalid JSON ({}): {}", args, e, stdout))
}

#[test]
fn test_init_creates_database_and_imports() {
    let (tmp, config) = setup_test_env();
    let out = run_json(&config, &["init"]);
    assert!(tmp.path().join("data/memory.db").exists());
    assert_eq!(out["startup_import"]["status"], "completed");
    assert_eq!(out["startup_import"]["sessions"], 2);
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &["init"]);
    let out = run_json(&config, &["init"]);
    assert_eq!(out["startup_import"]["sessions"], 0);
}

#[test]
fn test_sync_skips_unchanged_logs() {
    let (_tmp, config) = setup_test_env();
    let first = run_json(&config, &["sync"]);
    assert_eq!(first[0]["status"], "completed");
    assert_eq!(first[0]["sessions"], 2);

    let cooled = run_json(&config, &["sync"]);
    assert_eq!(cooled[0]["status"], "cooldown");

    let forced = run_json(&config, &["sync", "--force"]);
    assert_eq!(forced[0]["sessions"], 0);
    assert_eq!(forced[0]["skipped"], 2);
}

#[test]
fn test_sync_unknown_source_fails() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_cmem(&config, &["sync", "--source", "nope"]);
    assert!(!success);
    assert!(stderr.contains("not configured"), "stderr: {}", stderr);
}

#[test]
fn test_status_lists_pairs() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &["sync"]);
    let status = run_json(&config, &["status"]);
    let pairs = status.as_array().unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0]["source"], "generic-json");
    assert_eq!(pairs[0]["phase"], "idle");
    assert_eq!(pairs[0]["fingerprints"], 2);
}

#[test]
fn test_search_is_scoped_to_current_project() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &["init"]);

    let own = run_json(&config, &["search", "checkout idempotency"]);
    let results = own["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert!(results
        .iter()
        .all(|r| r["record"]["project_id"] == "/work/shop"));

    let other = run_json(&config, &["search", "monthly report"]);
    assert!(other["results"].as_array().unwrap().is_empty());

    let all = run_json(&config, &["search", "monthly report", "--all-projects"]);
    assert!(!all["results"].as_array().unwrap().is_empty());
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &["init"]);
    let out = run_json(&config, &["search", ""]);
    assert!(out["results"].as_array().unwrap().is_empty());
}

#[test]
fn test_context_bundle() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &["init"]);
    let bundle = run_json(&config, &["context", "checkout charge twice", "--messages"]);
    assert_eq!(bundle["project_id"], "/work/shop");
    assert_eq!(bundle["keyword_only"], true);
    assert!(bundle["context_text"]
        .as_str()
        .unwrap()
        .contains("Checkout double charge"));

    assert_eq!(bundle["file_paths"].as_array().unwrap().len(), 0);

    let with_files = run_json(
        &config,
        &["context", "checkout in api/payments.rs", "--file", "src/webhook.rs"],
    );
    assert_eq!(
        with_files["file_paths"],
        serde_json::json!(["src/webhook.rs", "api/payments.rs"])
    );

    let (text, _, success) = run_cmem(&config, &["context", "checkout", "--text"]);
    assert!(success);
    assert!(text.contains("Checkout double charge"));
}

#[test]
fn test_save_then_recall_decision() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &["init"]);
    let saved = run_json(
        &config,
        &[
            "save",
            "decision",
            "--title",
            "Idempotency keys for payments",
            "--description",
            "Every webhook carries an idempotency key",
            "--category",
            "payments",
        ],
    );
    let id = saved["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("decision::"));

    let recalled = run_json(&config, &["recall", "decision", "idempotency", "--category", "payments"]);
    assert_eq!(recalled["results"][0]["record"]["id"], id.as_str());

    let other = run_json(&config, &["recall", "decision", "idempotency", "--category", "infra"]);
    assert!(other["results"].as_array().unwrap().is_empty());
}

#[test]
fn test_sessions_and_session_detail() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &["init"]);

    let list = run_json(&config, &["sessions"]);
    assert_eq!(list["total"], 1);
    let id = list["sessions"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(id, "session::generic-json::checkout");

    let detail = run_json(&config, &["session", &id, "--messages"]);
    assert_eq!(detail["session"]["title"], "Checkout double charge");
    assert_eq!(detail["messages"].as_array().unwrap().len(), 2);
}

#[test]
fn test_missing_session_fails() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &["init"]);
    let (_, stderr, success) = run_cmem(&config, &["session", "session::nope"]);
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr: {}", stderr);
}

#[test]
fn test_ingest_session_and_message() {
    let (tmp, config) = setup_test_env();
    run_json(&config, &["init"]);

    let input = tmp.path().join("manual.json");
    fs::write(
        &input,
        r#"{"title":"Pairing on cache eviction","directory":"/work/shop","tags":["cache"],
            "messages":[{"role":"user","content":"the LRU evicts too early"}]}"#,
    )
    .unwrap();
    let ingested = run_json(&config, &["ingest", "session", input.to_str().unwrap()]);
    let session_id = ingested["session_id"].as_str().unwrap().to_string();
    assert_eq!(ingested["project_id"], "/work/shop");
    assert_eq!(ingested["message_count"], 1);

    let appended = run_json(
        &config,
        &["ingest", "message", &session_id, "capacity counts bytes", "--role", "assistant"],
    );
    assert_eq!(appended["ordinal"], 1);

    let detail = run_json(&config, &["session", &session_id, "--messages"]);
    assert_eq!(detail["session"]["message_count"], 2);
    assert_eq!(detail["summary"]["text"], "Session: Pairing on cache eviction");
}

#[test]
fn test_project_context() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &["init"]);
    run_json(&config, &["save", "thought", "Watch the webhook retry budget"]);

    let ctx = run_json(&config, &["project"]);
    assert_eq!(ctx["project_id"], "/work/shop");
    assert_eq!(ctx["stats"]["session"], 1);
    assert_eq!(ctx["stats"]["thought"], 1);
    assert_eq!(ctx["recent_sessions"].as_array().unwrap().len(), 1);
}

#[test]
fn test_invalid_config_fails() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(&bad, "[embedding]\nprovider = \"magic\"\n").unwrap();
    let (_, stderr, success) = run_cmem(&bad, &["status"]);
    assert!(!success);
    assert!(stderr.contains("Unknown embedding provider"), "stderr: {}", stderr);
}
