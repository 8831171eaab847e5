//! Import synchronization state.
//!
//! One [`SyncState`] exists per `(source, project)` pair. It carries the
//! set of imported fingerprints, the latest fingerprint of every skipped
//! path, a cursor that never moves backward, and the phase of the pair's
//! state machine:
//!
//! ```text
//!   Idle ──▶ Scanning ──▶ Importing ──▶ Idle
//!               │             │
//!               └──▶ Error ◀──┘      (retried on the next trigger)
//! ```
//!
//! The driver of the state machine lives in the app crate. The core only
//! defines the state record and the [`SyncTrigger`] seam the context
//! assembler calls before searching.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Phase of a `(source, project)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Scanning,
    Importing,
    Error,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Scanning => "scanning",
            SyncPhase::Importing => "importing",
            SyncPhase::Error => "error",
        }
    }
}

/// Persistent import cursor for one `(source, project)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub source: String,
    pub project_id: String,
    /// Imported fingerprints mapped to the session id they produced.
    #[serde(default)]
    pub imported: BTreeMap<String, String>,
    /// Skipped candidates: source path mapped to the fingerprint it had
    /// when skipped. One entry per path.
    #[serde(default)]
    pub skipped: BTreeMap<String, String>,
    /// Latest source modification time imported so far.
    #[serde(default)]
    pub cursor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase: SyncPhase,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub runs: u64,
    #[serde(default)]
    pub failures: u64,
    #[serde(default)]
    pub sessions_imported: u64,
    #[serde(default)]
    pub messages_imported: u64,
}

impl SyncState {
    pub fn new(source: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            project_id: project_id.into(),
            imported: BTreeMap::new(),
            skipped: BTreeMap::new(),
            cursor: None,
            last_run_at: None,
            phase: SyncPhase::Idle,
            last_error: None,
            runs: 0,
            failures: 0,
            sessions_imported: 0,
            messages_imported: 0,
        }
    }

    /// Storage key of the pair.
    pub fn key(&self) -> String {
        state_key(&self.source, &self.project_id)
    }

    /// Whether a candidate at `path` with `fingerprint` was already
    /// imported or skipped in this exact version.
    pub fn is_known(&self, path: &str, fingerprint: &str) -> bool {
        self.imported.contains_key(fingerprint)
            || self.skipped.get(path).is_some_and(|fp| fp == fingerprint)
    }

    /// Total fingerprints remembered.
    pub fn fingerprint_count(&self) -> usize {
        self.imported.len() + self.skipped.len()
    }

    /// Move the cursor forward. Older markers are ignored.
    pub fn advance_cursor(&mut self, marker: DateTime<Utc>) {
        match self.cursor {
            Some(current) if current >= marker => {}
            _ => self.cursor = Some(marker),
        }
    }

    /// Record one imported session. Earlier fingerprints of the same
    /// session and any skip entry for `path` are dropped.
    pub fn record_import(
        &mut self,
        path: &str,
        fingerprint: impl Into<String>,
        session_id: &str,
        marker: Option<DateTime<Utc>>,
        messages: usize,
    ) {
        self.imported.retain(|_, sid| sid != session_id);
        self.imported.insert(fingerprint.into(), session_id.to_string());
        self.skipped.remove(path);
        if let Some(ts) = marker {
            self.advance_cursor(ts);
        }
        self.sessions_imported += 1;
        self.messages_imported += messages as u64;
    }

    /// Remember a candidate that belongs elsewhere so this version of it
    /// is not parsed again. Replaces the previous entry for `path`.
    pub fn record_skip(&mut self, path: impl Into<String>, fingerprint: impl Into<String>) {
        self.skipped.insert(path.into(), fingerprint.into());
    }

    /// Whether a query-time trigger may start a pass at `now`.
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.last_run_at {
            None => true,
            Some(last) => now - last >= cooldown,
        }
    }

    /// Enter `Scanning`, stamping the run time.
    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.phase = SyncPhase::Scanning;
        self.last_run_at = Some(now);
        self.runs += 1;
    }

    /// Pass succeeded: back to `Idle`, error cleared.
    pub fn finish(&mut self) {
        self.phase = SyncPhase::Idle;
        self.last_error = None;
    }

    /// Pass failed: `Error` until the next trigger.
    pub fn fail(&mut self, error: impl std::fmt::Display) {
        self.phase = SyncPhase::Error;
        self.last_error = Some(error.to_string());
        self.failures += 1;
    }
}

pub fn state_key(source: &str, project_id: &str) -> String {
    format!("{}::{}", source, project_id)
}

/// Fingerprint of a file-backed candidate: SHA-256 of path and mtime.
pub fn file_fingerprint(path: &str, modified: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(modified.timestamp_millis().to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fingerprint for a candidate whose log carries its own session id.
///
/// Independent of the file path, so a log that is moved or copied with its
/// mtime intact keeps the same fingerprint.
pub fn external_fingerprint(source: &str, external_id: &str, modified: DateTime<Utc>) -> String {
    format!(
        "ext:{}:{}@{}",
        source,
        external_id,
        modified.timestamp_millis()
    )
}

/// Result of a query-time refresh request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// Query-time import is switched off.
    Disabled,
    /// Every pair ran recently enough.
    Cooldown,
    /// Another trigger already holds the pair.
    InFlight,
    /// A pass finished within the wait budget.
    Completed { sessions: usize, messages: usize },
    /// A pass was started but is still running in the background.
    Pending,
    /// At least one pair failed; retried on the next trigger.
    Failed { error: String },
}

/// Seam between retrieval and import.
///
/// Implementations must never block retrieval for longer than their own
/// timeout and must never return an error: failures are reported through
/// [`RefreshOutcome::Failed`].
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn refresh_for_query(&self, project_id: &str) -> RefreshOutcome;
}

/// Trigger that never imports.
#[derive(Debug, Default, Clone)]
pub struct NoopSync;

#[async_trait]
impl SyncTrigger for NoopSync {
    async fn refresh_for_query(&self, _project_id: &str) -> RefreshOutcome {
        RefreshOutcome::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_cursor_never_moves_backward() {
        let mut state = SyncState::new("codex", "P");
        state.advance_cursor(ts(200));
        state.advance_cursor(ts(100));
        assert_eq!(state.cursor, Some(ts(200)));
        state.record_import("/a", "fp", "session::x", Some(ts(150)), 3);
        assert_eq!(state.cursor, Some(ts(200)));
        state.record_import("/b", "fp2", "session::y", Some(ts(300)), 1);
        assert_eq!(state.cursor, Some(ts(300)));
        assert_eq!(state.messages_imported, 4);
    }

    #[test]
    fn test_cooldown_window() {
        let mut state = SyncState::new("claude-code", "P");
        let cooldown = Duration::seconds(45);
        assert!(state.cooldown_elapsed(ts(0), cooldown));
        state.begin(ts(1000));
        assert!(!state.cooldown_elapsed(ts(1044), cooldown));
        assert!(state.cooldown_elapsed(ts(1045), cooldown));
    }

    #[test]
    fn test_error_is_not_sticky() {
        let mut state = SyncState::new("codex", "P");
        state.begin(ts(10));
        state.fail("path missing");
        assert_eq!(state.phase, SyncPhase::Error);
        state.begin(ts(100));
        state.finish();
        assert_eq!(state.phase, SyncPhase::Idle);
        assert!(state.last_error.is_none());
        assert_eq!(state.failures, 1);
        assert_eq!(state.runs, 2);
    }

    #[test]
    fn test_file_fingerprint_changes_with_mtime() {
        let a = file_fingerprint("/logs/a.jsonl", ts(1));
        assert_eq!(a, file_fingerprint("/logs/a.jsonl", ts(1)));
        assert_ne!(a, file_fingerprint("/logs/a.jsonl", ts(2)));
        assert_ne!(a, file_fingerprint("/logs/b.jsonl", ts(1)));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_skips_keep_one_entry_per_path() {
        let mut state = SyncState::new("generic-json", "P");
        for secs in 1..=5 {
            state.record_skip("/logs/other.json", file_fingerprint("/logs/other.json", ts(secs)));
        }
        assert_eq!(state.skipped.len(), 1);
        let latest = file_fingerprint("/logs/other.json", ts(5));
        assert!(state.is_known("/logs/other.json", &latest));
        assert!(!state.is_known("/logs/other.json", &file_fingerprint("/logs/other.json", ts(4))));

        state.record_import("/logs/other.json", "fp-new", "session::g::other", None, 1);
        assert!(state.skipped.is_empty());
        assert_eq!(state.fingerprint_count(), 1);
    }

    #[test]
    fn test_reimport_replaces_session_fingerprint() {
        let mut state = SyncState::new("codex", "P");
        state.record_import("/a", "v1", "session::codex::1", Some(ts(1)), 2);
        state.record_import("/a", "v2", "session::codex::1", Some(ts(2)), 3);
        assert_eq!(state.imported.len(), 1);
        assert!(state.is_known("/a", "v2"));
        assert!(!state.is_known("/a", "v1"));
    }

    #[test]
    fn test_external_fingerprint_ignores_path() {
        let a = external_fingerprint("codex", "0195-abc", ts(7));
        assert_eq!(a, external_fingerprint("codex", "0195-abc", ts(7)));
        assert_ne!(a, external_fingerprint("codex", "0195-abc", ts(8)));
        assert_ne!(a, external_fingerprint("claude-code", "0195-abc", ts(7)));
    }

    #[test]
    fn test_state_roundtrips_through_json() {
        let mut state = SyncState::new("codex", "P");
        state.record_import("/a", "fp", "session::codex::1", Some(ts(5)), 2);
        state.record_skip("/b", "fp-b");
        let json = serde_json::to_string(&state).unwrap();
        let back: SyncState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.key(), "codex::P");
    }
}
