//! Project scope resolution.
//!
//! Every read and write is bounded by a [`Scope`]: either a concrete,
//! ordered set of project identifiers or "unbounded" (no project filter
//! at all). [`ScopeResolver`] turns the loosely-specified scope
//! parameters of a request into one, using process-wide defaults when the
//! request is silent.
//!
//! # Policy
//!
//! First match wins:
//!
//! 1. `include_all_projects` (request value, else the process default) is
//!    true → [`Scope::Unbounded`].
//! 2. related projects (request list, else the process default list) are
//!    non-empty → `{project} ∪ related`.
//! 3. otherwise → `{project}`.
//!
//! An explicit request value always beats the process default, so
//! `include_all_projects = Some(false)` narrows a process that defaults
//! to unbounded. Resolution never fails: missing information narrows the
//! scope to the single resolved project.

use serde::{Deserialize, Serialize};

use crate::models::DEFAULT_PROJECT_ID;

/// Effective read/write boundary of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "projects", rename_all = "snake_case")]
pub enum Scope {
    /// No project filter is applied downstream.
    Unbounded,
    /// Ordered, de-duplicated project identifiers. Never empty.
    Projects(Vec<String>),
}

impl Scope {
    pub fn single(project_id: impl Into<String>) -> Self {
        Scope::Projects(vec![project_id.into()])
    }

    /// Project filter handed to the store; `None` means unfiltered.
    pub fn project_filter(&self) -> Option<&[String]> {
        match self {
            Scope::Unbounded => None,
            Scope::Projects(ids) => Some(ids.as_slice()),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Scope::Unbounded)
    }

    /// Whether a record in `project_id` is visible under this scope.
    pub fn contains(&self, project_id: &str) -> bool {
        match self {
            Scope::Unbounded => true,
            Scope::Projects(ids) => ids.iter().any(|p| p == project_id),
        }
    }
}

/// Scope parameters as supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRequest {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub related_project_ids: Option<Vec<String>>,
    #[serde(default)]
    pub include_all_projects: Option<bool>,
}

impl ScopeRequest {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    pub fn all_projects() -> Self {
        Self {
            include_all_projects: Some(true),
            ..Default::default()
        }
    }

    pub fn with_related(mut self, related: Vec<String>) -> Self {
        self.related_project_ids = Some(related);
        self
    }
}

/// Process-wide scope defaults, read from configuration at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeDefaults {
    /// Marker that callers send when they do not know their project.
    pub default_project_id: String,
    /// Workspace the process was started in, if known.
    pub current_project_id: Option<String>,
    pub default_related_projects: Vec<String>,
    pub include_all_projects_by_default: bool,
}

impl Default for ScopeDefaults {
    fn default() -> Self {
        Self {
            default_project_id: DEFAULT_PROJECT_ID.to_string(),
            current_project_id: None,
            default_related_projects: Vec::new(),
            include_all_projects_by_default: false,
        }
    }
}

/// Outcome of scope resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedScope {
    /// Project writes go to, and the head of `scope` when bounded.
    pub project_id: String,
    pub scope: Scope,
}

/// Stateless resolver over a fixed set of defaults.
#[derive(Debug, Clone, Default)]
pub struct ScopeResolver {
    defaults: ScopeDefaults,
}

impl ScopeResolver {
    pub fn new(mut defaults: ScopeDefaults) -> Self {
        defaults.current_project_id = defaults
            .current_project_id
            .as_deref()
            .and_then(normalize_project_id);
        defaults.default_related_projects =
            normalize_project_ids(&defaults.default_related_projects);
        if defaults.default_project_id.trim().is_empty() {
            defaults.default_project_id = DEFAULT_PROJECT_ID.to_string();
        }
        Self { defaults }
    }

    pub fn defaults(&self) -> &ScopeDefaults {
        &self.defaults
    }

    /// Resolve the caller's project id to a concrete, non-empty one.
    ///
    /// Empty input, the default marker, and unusable identifiers (`/`,
    /// `.`) map to the current workspace when known, else to the reserved
    /// default.
    pub fn resolve_project(&self, project_id: &str) -> String {
        let fallback = || {
            self.defaults
                .current_project_id
                .clone()
                .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string())
        };
        match normalize_project_id(project_id) {
            Some(p) if p == self.defaults.default_project_id => fallback(),
            Some(p) => p,
            None => fallback(),
        }
    }

    pub fn resolve(&self, request: &ScopeRequest) -> ResolvedScope {
        let project_id = self.resolve_project(&request.project_id);

        let include_all = request
            .include_all_projects
            .unwrap_or(self.defaults.include_all_projects_by_default);
        if include_all {
            return ResolvedScope {
                project_id,
                scope: Scope::Unbounded,
            };
        }

        let related = match &request.related_project_ids {
            Some(ids) => normalize_project_ids(ids),
            None => self.defaults.default_related_projects.clone(),
        };

        let mut ids = Vec::with_capacity(related.len() + 1);
        ids.push(project_id.clone());
        for id in related {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        ResolvedScope {
            project_id,
            scope: Scope::Projects(ids),
        }
    }
}

/// Normalize one project identifier. Returns `None` for values that
/// cannot name a project.
pub fn normalize_project_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "/" || trimmed == "." {
        return None;
    }
    let stripped = trimmed.trim_end_matches('/');
    if stripped.is_empty() {
        return None;
    }
    Some(stripped.to_string())
}

/// Project an imported session belongs to.
///
/// An explicit (non-default) sync project wins; otherwise the session's
/// working directory names the project, falling back to
/// [`DEFAULT_PROJECT_ID`].
pub fn derive_project_id(sync_project_id: &str, directory: Option<&str>) -> String {
    if let Some(p) = normalize_project_id(sync_project_id) {
        if p != DEFAULT_PROJECT_ID {
            return p;
        }
    }
    directory
        .and_then(normalize_project_id)
        .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string())
}

/// Normalize a list of identifiers, dropping unusable ones and keeping
/// first-occurrence order.
pub fn normalize_project_ids<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for id in raw.iter().filter_map(|s| normalize_project_id(s.as_ref())) {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ScopeResolver {
        ScopeResolver::new(ScopeDefaults {
            current_project_id: Some("/work/app/".to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn test_include_all_wins_over_related() {
        let req = ScopeRequest::project("P").with_related(vec!["Q".into()]);
        let req = ScopeRequest {
            include_all_projects: Some(true),
            ..req
        };
        let resolved = resolver().resolve(&req);
        assert_eq!(resolved.scope, Scope::Unbounded);
        assert_eq!(resolved.project_id, "P");
    }

    #[test]
    fn test_related_union_is_ordered_and_deduplicated() {
        let req = ScopeRequest::project("P").with_related(vec![
            "Q".into(),
            "P".into(),
            "Q/".into(),
            ".".into(),
            "R".into(),
        ]);
        let resolved = resolver().resolve(&req);
        assert_eq!(
            resolved.scope,
            Scope::Projects(vec!["P".into(), "Q".into(), "R".into()])
        );
    }

    #[test]
    fn test_empty_project_uses_current_workspace() {
        let resolved = resolver().resolve(&ScopeRequest::default());
        assert_eq!(resolved.project_id, "/work/app");
        assert_eq!(resolved.scope, Scope::single("/work/app"));
    }

    #[test]
    fn test_default_marker_maps_to_workspace() {
        assert_eq!(resolver().resolve_project("default"), "/work/app");
    }

    #[test]
    fn test_no_workspace_falls_back_to_reserved_default() {
        let r = ScopeResolver::default();
        assert_eq!(r.resolve_project(""), DEFAULT_PROJECT_ID);
        assert_eq!(r.resolve_project("/"), DEFAULT_PROJECT_ID);
    }

    #[test]
    fn test_process_defaults_apply_when_request_silent() {
        let r = ScopeResolver::new(ScopeDefaults {
            default_related_projects: vec!["shared".into()],
            ..Default::default()
        });
        let resolved = r.resolve(&ScopeRequest::project("P"));
        assert_eq!(
            resolved.scope,
            Scope::Projects(vec!["P".into(), "shared".into()])
        );

        let explicit_empty = ScopeRequest::project("P").with_related(vec![]);
        assert_eq!(r.resolve(&explicit_empty).scope, Scope::single("P"));
    }

    #[test]
    fn test_explicit_false_overrides_unbounded_default() {
        let r = ScopeResolver::new(ScopeDefaults {
            include_all_projects_by_default: true,
            ..Default::default()
        });
        assert!(r.resolve(&ScopeRequest::project("P")).scope.is_unbounded());

        let narrowed = ScopeRequest {
            include_all_projects: Some(false),
            ..ScopeRequest::project("P")
        };
        assert_eq!(r.resolve(&narrowed).scope, Scope::single("P"));
    }

    #[test]
    fn test_derive_project_prefers_explicit_sync_project() {
        assert_eq!(derive_project_id("P", Some("/repo/x")), "P");
        assert_eq!(derive_project_id("default", Some("/repo/x/")), "/repo/x");
        assert_eq!(derive_project_id("", None), DEFAULT_PROJECT_ID);
        assert_eq!(derive_project_id("default", Some("/")), DEFAULT_PROJECT_ID);
    }

    #[test]
    fn test_scope_contains() {
        let scope = Scope::Projects(vec!["A".into(), "B".into()]);
        assert!(scope.contains("B"));
        assert!(!scope.contains("C"));
        assert!(Scope::Unbounded.contains("anything"));
        assert!(Scope::Unbounded.project_filter().is_none());
    }
}
