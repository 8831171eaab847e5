//! Codex CLI / desktop session logs.
//!
//! Sessions are JSONL files under `~/.codex/sessions/YYYY/MM/DD/` and
//! `~/.codex/archived_sessions/`. The first `session_meta` line carries the
//! session id, working directory and start time; conversation turns arrive
//! as `event_msg` (`user_message`, `agent_message`) and tool traffic as
//! `response_item` (`function_call`, `function_call_output`).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::Value;
use walkdir::WalkDir;

use coding_memory_core::models::{first_line, tool_call_label, Role, TOOL_CALL_PREFIX};

use super::{
    build_session, parse_timestamp, read_jsonl, DraftMessage, DraftSession, ImportedSession,
    Importer, SessionCandidate,
};

const TOOL_OUTPUT_CHARS: usize = 180;

pub struct CodexImporter;

/// Directories to walk under a Codex root.
///
/// `~/.codex` scans both `sessions` and `archived_sessions`; any other
/// directory is walked as-is.
fn scan_dirs(root: &Path) -> Vec<PathBuf> {
    let dirs: Vec<PathBuf> = ["sessions", "archived_sessions"]
        .iter()
        .map(|d| root.join(d))
        .filter(|d| d.is_dir())
        .collect();
    if dirs.is_empty() {
        vec![root.to_path_buf()]
    } else {
        dirs
    }
}

impl Importer for CodexImporter {
    fn source(&self) -> &'static str {
        "codex"
    }

    fn discover(&self, root: &Path) -> Result<Vec<SessionCandidate>> {
        let mut candidates = Vec::new();
        for dir in scan_dirs(root) {
            for entry in WalkDir::new(&dir) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                    let candidate = SessionCandidate::from_path(path)?;
                    candidates.push(match rollout_id(path) {
                        Some(id) => candidate.with_external_id(self.source(), &id),
                        None => candidate,
                    });
                }
            }
        }
        candidates.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(candidates)
    }

    fn parse(&self, candidate: &SessionCandidate) -> Result<Option<ImportedSession>> {
        let mut meta: Option<Value> = None;
        let mut drafts = Vec::new();

        for entry in read_jsonl(&candidate.path)? {
            let kind = entry.get("type").and_then(Value::as_str);
            let payload = entry.get("payload").filter(|p| p.is_object());
            let timestamp = parse_timestamp(entry.get("timestamp"));
            match (kind, payload) {
                (Some("session_meta"), Some(p)) => meta = Some(p.clone()),
                (Some("event_msg"), Some(p)) => drafts.extend(event_message(p, timestamp)),
                (Some("response_item"), Some(p)) => drafts.extend(response_item(p, timestamp)),
                _ => {}
            }
        }

        let stem = candidate.stem();
        let field = |key: &str| {
            meta.as_ref()
                .and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let token = field("id").filter(|id| !id.is_empty()).unwrap_or_else(|| stem.clone());
        let started_at = parse_timestamp(meta.as_ref().and_then(|m| m.get("timestamp")));

        Ok(build_session(
            DraftSession {
                source: self.source(),
                token,
                title_fallback: format!("Codex Session {}", stem),
                title: None,
                directory: field("cwd").unwrap_or_default(),
                started_at,
                modified: candidate.modified,
            },
            drafts,
        ))
    }
}

/// Session id from the leading `session_meta` line, if the rollout has one.
///
/// Codex moves finished rollouts into `archived_sessions/` without touching
/// them, so the id keeps a moved file from being imported twice.
fn rollout_id(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut first = String::new();
    BufReader::new(file).read_line(&mut first).ok()?;
    let entry: Value = serde_json::from_str(first.trim()).ok()?;
    if entry.get("type").and_then(Value::as_str) != Some("session_meta") {
        return None;
    }
    entry
        .get("payload")
        .and_then(|p| p.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn event_message(
    payload: &Value,
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
) -> Option<DraftMessage> {
    let role = match payload.get("type").and_then(Value::as_str)? {
        "user_message" => Role::User,
        "agent_message" => Role::Assistant,
        _ => return None,
    };
    let content = normalize_text(payload.get("message")?);
    if content.is_empty() {
        return None;
    }
    Some(DraftMessage {
        role,
        content,
        tool_calls: Vec::new(),
        timestamp,
    })
}

fn response_item(
    payload: &Value,
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
) -> Option<DraftMessage> {
    match payload.get("type").and_then(Value::as_str)? {
        "function_call" => {
            let name = payload
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())?;
            let arguments = payload.get("arguments").map(parse_arguments);
            Some(DraftMessage {
                role: Role::Assistant,
                content: format!("{}{}", TOOL_CALL_PREFIX, tool_call_label(name, arguments.as_ref())),
                tool_calls: vec![name.to_string()],
                timestamp,
            })
        }
        "function_call_output" => {
            let call_id = payload
                .get("call_id")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())?;
            let output = payload.get("output").map(normalize_text).unwrap_or_default();
            let summary = first_line(&output, TOOL_OUTPUT_CHARS);
            let content = if summary.is_empty() {
                format!("Tool result for {}", call_id)
            } else {
                format!("Tool result for {}: {}", call_id, summary)
            };
            Some(DraftMessage {
                role: Role::Tool,
                content,
                tool_calls: Vec::new(),
                timestamp,
            })
        }
        _ => None,
    }
}

/// Function-call arguments arrive as a JSON-encoded string.
fn parse_arguments(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s.trim()).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

/// Text of a message value: a string, a list of text parts, or an object
/// with a `text` / `output_text` / `input_text` field.
fn normalize_text(value: &Value) -> String {
    fn part_text(v: &Value) -> Option<&str> {
        ["text", "output_text", "input_text"]
            .iter()
            .find_map(|k| v.get(*k).and_then(Value::as_str))
    }

    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.as_str()),
                Value::Object(_) => part_text(item),
                _ => None,
            })
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => part_text(value).map(|s| s.trim().to_string()).unwrap_or_default(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const LOG: &str = r#"{"timestamp":"2025-04-02T08:00:00Z","type":"session_meta","payload":{"id":"0195-abc","cwd":"/srv/billing","timestamp":"2025-04-02T08:00:00Z"}}
{"timestamp":"2025-04-02T08:00:01Z","type":"event_msg","payload":{"type":"user_message","message":"Add retry to the invoice sender"}}
{"timestamp":"2025-04-02T08:00:02Z","type":"response_item","payload":{"type":"function_call","name":"shell","call_id":"c1","arguments":"{\"command\":[\"rg\",\"send_invoice\"]}"}}
{"timestamp":"2025-04-02T08:00:03Z","type":"response_item","payload":{"type":"function_call_output","call_id":"c1","output":"src/invoice.rs:12: fn send_invoice()\nmore"}}
{"timestamp":"2025-04-02T08:00:04Z","type":"event_msg","payload":{"type":"agent_message","message":"Added exponential backoff."}}
{"timestamp":"2025-04-02T08:00:05Z","type":"event_msg","payload":{"type":"token_count"}}
"#;

    #[test]
    fn test_scan_dirs_prefers_session_folders() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(scan_dirs(tmp.path()), vec![tmp.path().to_path_buf()]);
        fs::create_dir_all(tmp.path().join("sessions/2025/04/02")).unwrap();
        fs::create_dir_all(tmp.path().join("archived_sessions")).unwrap();
        assert_eq!(scan_dirs(tmp.path()).len(), 2);
    }

    #[test]
    fn test_discover_walks_nested_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let day = tmp.path().join("sessions/2025/04/02");
        fs::create_dir_all(&day).unwrap();
        fs::write(day.join("rollout-1.jsonl"), LOG).unwrap();
        fs::create_dir_all(tmp.path().join("archived_sessions")).unwrap();
        fs::write(tmp.path().join("archived_sessions/rollout-0.jsonl"), LOG).unwrap();
        fs::write(tmp.path().join("config.toml"), "").unwrap();

        let found = CodexImporter.discover(tmp.path()).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_archived_copy_shares_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        let day = tmp.path().join("sessions/2025/04/02");
        fs::create_dir_all(&day).unwrap();
        fs::create_dir_all(tmp.path().join("archived_sessions")).unwrap();
        let live = day.join("rollout-1.jsonl");
        let archived = tmp.path().join("archived_sessions/rollout-1.jsonl");
        fs::write(&live, LOG).unwrap();
        fs::write(&archived, LOG).unwrap();
        let mtime = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_743_580_800);
        for path in [&live, &archived] {
            File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }
        fs::write(day.join("rollout-2.jsonl"), "{\"type\":\"event_msg\"}\n").unwrap();

        let found = CodexImporter.discover(tmp.path()).unwrap();
        assert_eq!(found.len(), 3);
        let keyed: Vec<&SessionCandidate> = found
            .iter()
            .filter(|c| c.fingerprint.starts_with("ext:codex:0195-abc@"))
            .collect();
        assert_eq!(keyed.len(), 2);
        assert_eq!(keyed[0].fingerprint, keyed[1].fingerprint);
        assert_eq!(rollout_id(&day.join("rollout-2.jsonl")), None);
    }

    #[test]
    fn test_parse_session() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rollout-1.jsonl");
        fs::write(&path, LOG).unwrap();
        let candidate = SessionCandidate::from_path(&path).unwrap();

        let imported = CodexImporter.parse(&candidate).unwrap().unwrap();
        assert_eq!(imported.session.meta.id, "session::codex::0195-abc");
        assert_eq!(imported.session.meta.project_id, "/srv/billing");
        assert_eq!(imported.session.title, "Add retry to the invoice sender");
        assert_eq!(imported.session.tools_used, vec!["shell".to_string()]);

        let contents: Vec<&str> = imported.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "Add retry to the invoice sender",
                "Tool call: shell",
                "Tool result for c1: src/invoice.rs:12: fn send_invoice()",
                "Added exponential backoff.",
            ]
        );
        assert_eq!(imported.messages[2].role, Role::Tool);
    }

    #[test]
    fn test_token_falls_back_to_stem() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rollout-9.jsonl");
        fs::write(
            &path,
            "{\"type\":\"event_msg\",\"payload\":{\"type\":\"user_message\",\"message\":\"hi\"}}\n",
        )
        .unwrap();
        let candidate = SessionCandidate::from_path(&path).unwrap();
        let imported = CodexImporter.parse(&candidate).unwrap().unwrap();
        assert_eq!(imported.session.meta.id, "session::codex::rollout-9");
        assert_eq!(imported.session.meta.project_id, "default");
    }

    #[test]
    fn test_function_call_labels_subagents() {
        let payload = serde_json::json!({
            "type": "function_call",
            "name": "Task",
            "call_id": "c9",
            "arguments": "{\"subagent_type\":\"reviewer\"}"
        });
        let draft = response_item(&payload, None).unwrap();
        assert_eq!(draft.content, "Tool call: Task (reviewer)");
        assert_eq!(draft.tool_calls, vec!["Task".to_string()]);
    }

    #[test]
    fn test_normalize_text_variants() {
        assert_eq!(normalize_text(&serde_json::json!("  a ")), "a");
        assert_eq!(
            normalize_text(&serde_json::json!([{"text": "a"}, "b", {"output_text": "c"}])),
            "a\nb\nc"
        );
        assert_eq!(normalize_text(&serde_json::json!({"input_text": "x"})), "x");
        assert_eq!(normalize_text(&serde_json::json!(3)), "");
    }
}
