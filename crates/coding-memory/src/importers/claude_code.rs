//! Claude Code session logs.
//!
//! Each session is one JSONL file under a per-project directory:
//! `~/.claude/projects/<project-hash>/<session-uuid>.jsonl`. Lines carry a
//! `message` object (`role`, `content`) next to envelope fields such as
//! `cwd`, `timestamp` and `isMeta`. Content is either a string or an array
//! of blocks (`text`, `tool_use`, `tool_result`).

use std::path::Path;

use anyhow::Result;
use serde_json::Value;
use walkdir::WalkDir;

use coding_memory_core::models::{tool_call_label, Role, TOOL_CALL_PREFIX};

use super::{
    build_session, parse_timestamp, read_jsonl, DraftMessage, DraftSession, ImportedSession,
    Importer, SessionCandidate,
};

/// Longest tool-result excerpt kept in a message.
const TOOL_RESULT_CHARS: usize = 400;

pub struct ClaudeCodeImporter;

impl Importer for ClaudeCodeImporter {
    fn source(&self) -> &'static str {
        "claude-code"
    }

    fn discover(&self, root: &Path) -> Result<Vec<SessionCandidate>> {
        let mut candidates = Vec::new();
        for entry in WalkDir::new(root).min_depth(2).max_depth(2) {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type().is_file() && path.extension().map(|e| e == "jsonl").unwrap_or(false)
            {
                candidates.push(SessionCandidate::from_path(path)?);
            }
        }
        candidates.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(candidates)
    }

    fn parse(&self, candidate: &SessionCandidate) -> Result<Option<ImportedSession>> {
        let mut drafts = Vec::new();
        let mut directory = String::new();

        for entry in read_jsonl(&candidate.path)? {
            let Some((draft, cwd)) = normalize_entry(&entry) else {
                continue;
            };
            if directory.is_empty() {
                if let Some(cwd) = cwd.filter(|c| !c.trim().is_empty()) {
                    directory = cwd;
                }
            }
            drafts.push(draft);
        }

        if directory.is_empty() {
            if let Some(parent) = candidate.path.parent() {
                directory = parent.to_string_lossy().to_string();
            }
        }

        let stem = candidate.stem();
        Ok(build_session(
            DraftSession {
                source: self.source(),
                title_fallback: format!("Claude Session {}", stem),
                token: stem,
                title: None,
                directory,
                started_at: None,
                modified: candidate.modified,
            },
            drafts,
        ))
    }
}

/// One log line as a message plus the `cwd` it reports.
fn normalize_entry(entry: &Value) -> Option<(DraftMessage, Option<String>)> {
    let obj = entry.as_object()?;
    if obj.get("isMeta").and_then(Value::as_bool) == Some(true) {
        return None;
    }

    // Plain lines, `message` envelopes, and `payload` envelopes.
    let body = obj
        .get("message")
        .filter(|m| m.is_object())
        .or_else(|| obj.get("payload").filter(|p| p.is_object()))
        .unwrap_or(entry);

    let role_str = body
        .get("role")
        .or_else(|| obj.get("role"))
        .and_then(Value::as_str)?;
    let role = Role::parse(role_str)?;
    let content = body.get("content").or_else(|| obj.get("content"))?;

    let text = content_text(content);
    if text.trim().is_empty() {
        return None;
    }

    let cwd = body
        .get("cwd")
        .or_else(|| obj.get("cwd"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string());
    let timestamp = parse_timestamp(body.get("timestamp").or_else(|| obj.get("timestamp")));

    Some((
        DraftMessage {
            role,
            content: text,
            tool_calls: tool_names(content),
            timestamp,
        },
        cwd,
    ))
}

/// Flatten message content to text. Tool calls are rendered as a label,
/// tool results as a cut excerpt.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let mut parts: Vec<String> = Vec::new();
            for block in blocks {
                match block {
                    Value::String(s) => parts.push(s.clone()),
                    Value::Object(b) => match b.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(t) = b.get("text").and_then(Value::as_str) {
                                parts.push(t.to_string());
                            }
                        }
                        Some("tool_use") => {
                            let name = b.get("name").and_then(Value::as_str).unwrap_or("tool");
                            parts.push(format!(
                                "{}{}",
                                TOOL_CALL_PREFIX,
                                tool_call_label(name, b.get("input"))
                            ));
                        }
                        Some("tool_result") => {
                            let inner = b.get("content").map(content_text).unwrap_or_default();
                            let excerpt: String =
                                inner.trim().chars().take(TOOL_RESULT_CHARS).collect();
                            if !excerpt.is_empty() {
                                parts.push(format!("Tool result: {}", excerpt));
                            }
                        }
                        _ => {}
                    },
                    _ => {}
                }
            }
            parts.join("\n")
        }
        _ => String::new(),
    }
}

fn tool_names(content: &Value) -> Vec<String> {
    let Some(blocks) = content.as_array() else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
        .filter_map(|b| b.get("name").and_then(Value::as_str))
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}
