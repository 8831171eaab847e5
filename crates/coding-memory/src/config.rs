//! Configuration parsing and validation.
//!
//! Coding Memory is configured with a TOML file (default
//! `~/.config/coding-memory/cmem.toml`). Every section is optional; a
//! missing file yields [`Config::default`].
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "~/.local/share/coding-memory/memory.db"
//!
//! [retrieval]
//! weight_vector = 0.5
//! weight_keyword = 0.5
//! oversample = 3
//! min_similarity = 0.2            # vector matches at or below are dropped
//! max_context_tokens = 2000
//!
//! [embedding]
//! provider = "openai"            # disabled | openai | ollama
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [scope]
//! default_related_projects = ["/work/shared-lib"]
//! include_all_projects_by_default = false
//!
//! [sync]
//! auto_import_on_query = true
//! cooldown_secs = 45
//!
//! [sync.sources.claude-code]
//! path = "~/.claude/projects"
//! auto_import_on_start = true
//! ```
//!
//! The OpenAI provider reads its key from `OPENAI_API_KEY`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use coding_memory_core::context::ContextDefaults;
use coding_memory_core::models::DEFAULT_PROJECT_ID;
use coding_memory_core::scope::ScopeDefaults;
use coding_memory_core::search::SearchParams;

use crate::importers::KNOWN_SOURCES;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("coding-memory")
        .join("memory.db")
}

/// Timeout applied to every store call.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_store_timeout_secs(),
        }
    }
}

fn default_store_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_weight")]
    pub weight_vector: f64,
    #[serde(default = "default_weight")]
    pub weight_keyword: f64,
    #[serde(default = "default_oversample")]
    pub oversample: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_per_type_limit")]
    pub per_type_limit: usize,
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_min_relevant_items")]
    pub min_relevant_items: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            weight_vector: default_weight(),
            weight_keyword: default_weight(),
            oversample: default_oversample(),
            min_similarity: default_min_similarity(),
            limit: default_limit(),
            per_type_limit: default_per_type_limit(),
            message_limit: default_message_limit(),
            max_context_tokens: default_max_context_tokens(),
            min_relevant_items: default_min_relevant_items(),
        }
    }
}

fn default_weight() -> f64 {
    0.5
}
fn default_oversample() -> usize {
    3
}
fn default_min_similarity() -> f64 {
    0.2
}
fn default_limit() -> usize {
    12
}
fn default_per_type_limit() -> usize {
    6
}
fn default_message_limit() -> usize {
    20
}
fn default_max_context_tokens() -> usize {
    2000
}
fn default_min_relevant_items() -> usize {
    2
}

impl RetrievalConfig {
    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            weight_vector: self.weight_vector,
            weight_keyword: self.weight_keyword,
            oversample: self.oversample,
            min_similarity: self.min_similarity,
        }
    }

    pub fn context_defaults(&self) -> ContextDefaults {
        ContextDefaults {
            limit: self.limit,
            per_type_limit: self.per_type_limit,
            message_limit: self.message_limit,
            max_tokens: self.max_context_tokens,
            min_relevant_items: self.min_relevant_items,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-HTTP-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound on one `embed` call including retries.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_call_timeout_secs() -> u64 {
    15
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn model_or_default(&self) -> String {
        self.model.clone().unwrap_or_else(|| match self.provider.as_str() {
            "ollama" => "nomic-embed-text".to_string(),
            _ => "text-embedding-3-small".to_string(),
        })
    }

    pub fn dims_or_default(&self) -> usize {
        self.dims.unwrap_or(match self.provider.as_str() {
            "ollama" => 768,
            "openai" => 1536,
            _ => 0,
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScopeConfig {
    #[serde(default = "default_project_id")]
    pub default_project_id: String,
    /// Workspace project; defaults to the process working directory.
    #[serde(default)]
    pub current_project_id: Option<String>,
    #[serde(default)]
    pub default_related_projects: Vec<String>,
    #[serde(default)]
    pub include_all_projects_by_default: bool,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            default_project_id: default_project_id(),
            current_project_id: None,
            default_related_projects: Vec::new(),
            include_all_projects_by_default: false,
        }
    }
}

fn default_project_id() -> String {
    DEFAULT_PROJECT_ID.to_string()
}

impl ScopeConfig {
    pub fn scope_defaults(&self) -> ScopeDefaults {
        let current = self
            .current_project_id
            .as_deref()
            .map(|p| expand_tilde(Path::new(p)).display().to_string())
            .or_else(|| {
                std::env::current_dir()
                    .ok()
                    .map(|p| p.display().to_string())
            });
        ScopeDefaults {
            default_project_id: self.default_project_id.clone(),
            current_project_id: current,
            default_related_projects: self
                .default_related_projects
                .iter()
                .map(|p| expand_tilde(Path::new(p)).display().to_string())
                .collect(),
            include_all_projects_by_default: self.include_all_projects_by_default,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub auto_import_on_query: bool,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// How long a query waits for a triggered pass before moving on.
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    #[serde(default = "default_sources")]
    pub sources: BTreeMap<String, SourceConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_import_on_query: true,
            cooldown_secs: default_cooldown_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
            sources: default_sources(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_cooldown_secs() -> u64 {
    45
}
fn default_scan_timeout_secs() -> u64 {
    5
}

fn default_sources() -> BTreeMap<String, SourceConfig> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    let mut sources = BTreeMap::new();
    sources.insert(
        "claude-code".to_string(),
        SourceConfig {
            path: Some(home.join(".claude").join("projects")),
            enabled: true,
            auto_import_on_start: true,
        },
    );
    sources.insert(
        "codex".to_string(),
        SourceConfig {
            path: Some(home.join(".codex")),
            enabled: true,
            auto_import_on_start: true,
        },
    );
    sources
}

/// One chat-log source.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_import_on_start: bool,
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Default location of the config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("config"))
        .join("coding-memory")
        .join("cmem.toml")
}

/// Load and validate the config at `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    config.db.path = expand_tilde(&config.db.path);
    for source in config.sync.sources.values_mut() {
        if let Some(p) = &source.path {
            source.path = Some(expand_tilde(p));
        }
    }

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config
        .retrieval
        .search_params()
        .validate()
        .map_err(|e| anyhow::anyhow!("retrieval: {}", e))?;

    if config.retrieval.limit == 0 {
        bail!("retrieval.limit must be >= 1");
    }
    if config.retrieval.max_context_tokens == 0 {
        bail!("retrieval.max_context_tokens must be > 0");
    }
    if config.store.timeout_secs == 0 {
        bail!("store.timeout_secs must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.dims_or_default() == 0 {
        bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    for (name, source) in &config.sync.sources {
        if !KNOWN_SOURCES.contains(&name.as_str()) {
            bail!(
                "Unknown sync source '{}'. Must be one of: {}",
                name,
                KNOWN_SOURCES.join(", ")
            );
        }
        if source.enabled && source.path.is_none() {
            bail!("sync.sources.{}.path is required when enabled", name);
        }
    }

    Ok(())
}
