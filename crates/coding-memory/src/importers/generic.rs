//! Generic JSON conversation files.
//!
//! One file per session:
//!
//! ```json
//! {
//!   "title": "Session title",
//!   "directory": "/optional/workspace",
//!   "messages": [
//!     {"role": "user", "content": "..."},
//!     {"role": "assistant", "content": "...", "timestamp": "2025-01-01T00:00:00Z"}
//!   ]
//! }
//! ```
//!
//! The configured path may be a directory (every `*.json` directly inside
//! it) or a single file. Without a `directory` field the file's parent
//! directory names the project.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use walkdir::WalkDir;

use coding_memory_core::models::Role;

use super::{
    build_session, parse_timestamp, DraftMessage, DraftSession, ImportedSession, Importer,
    SessionCandidate,
};

pub struct GenericJsonImporter;

#[derive(Debug, Deserialize)]
struct SessionFile {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    messages: Vec<MessageEntry>,
}

#[derive(Debug, Deserialize)]
struct MessageEntry {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
    #[serde(default)]
    tool_calls: Vec<String>,
}

impl Importer for GenericJsonImporter {
    fn source(&self) -> &'static str {
        "generic-json"
    }

    fn discover(&self, root: &Path) -> Result<Vec<SessionCandidate>> {
        if root.is_file() {
            return Ok(vec![SessionCandidate::from_path(root)?]);
        }
        let mut candidates = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type().is_file() && path.extension().map(|e| e == "json").unwrap_or(false) {
                candidates.push(SessionCandidate::from_path(path)?);
            }
        }
        candidates.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(candidates)
    }

    fn parse(&self, candidate: &SessionCandidate) -> Result<Option<ImportedSession>> {
        let raw = std::fs::read_to_string(&candidate.path)?;
        let file: SessionFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid session file {}", candidate.path.display()))?;

        let drafts: Vec<DraftMessage> = file
            .messages
            .into_iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| DraftMessage {
                role: m.role.as_deref().and_then(Role::parse).unwrap_or_default(),
                content: m.content,
                tool_calls: m.tool_calls,
                timestamp: parse_timestamp(m.timestamp.as_ref()),
            })
            .collect();

        let directory = file.directory.filter(|d| !d.trim().is_empty()).unwrap_or_else(|| {
            candidate
                .path
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default()
        });

        let stem = candidate.stem();
        Ok(build_session(
            DraftSession {
                source: self.source(),
                title_fallback: stem.clone(),
                title: file.title,
                token: stem,
                directory,
                started_at: None,
                modified: candidate.modified,
            },
            drafts,
        ))
    }
}
