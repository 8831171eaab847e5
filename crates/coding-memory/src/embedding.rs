//! Embedding providers.
//!
//! Concrete implementations of the core [`Embedder`] capability:
//! - **[`DisabledEmbedder`]**: always unavailable; used when embeddings are not configured.
//! - **[`OpenAiEmbedder`]**: calls the OpenAI embeddings API.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Providers never return errors to callers. An HTTP failure is logged
//! and surfaces as `None`, which the search engine treats as
//! keyword-only ranking.
//!
//! # Retry Strategy
//!
//! Both HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, ... (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use coding_memory_core::embedding::{DisabledEmbedder, Embedder};

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Instantiate the provider named by `config.provider`.
///
/// A provider that cannot be constructed (for example OpenAI without
/// `OPENAI_API_KEY`) degrades to [`DisabledEmbedder`] with a warning.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.provider.as_str() {
        "disabled" => Arc::new(DisabledEmbedder),
        "openai" => match OpenAiEmbedder::new(config) {
            Ok(e) => Arc::new(e),
            Err(e) => {
                warn!(error = %e, "OpenAI embeddings unavailable; falling back to keyword-only");
                Arc::new(DisabledEmbedder)
            }
        },
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(embedder)
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// POST `body` with retry and backoff, returning the parsed JSON body.
async fn post_with_retry(
    label: &str,
    max_retries: u32,
    build: impl Fn() -> reqwest::RequestBuilder,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow!("{} connection error: {}", label, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
}

fn parse_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

/// Parse `{"data": [{"embedding": [...]}, ...]}`.
pub fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    data.iter()
        .map(|item| {
            item.get("embedding")
                .and_then(parse_vector)
                .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))
        })
        .collect()
}

/// Parse `{"embeddings": [[...], ...]}`.
pub fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            parse_vector(e).ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

fn first_vector(label: &str, result: Result<Vec<Vec<f32>>>) -> Option<Vec<f32>> {
    match result {
        Ok(vectors) => vectors.into_iter().next(),
        Err(e) => {
            warn!(provider = label, error = %e, "embedding request failed");
            None
        }
    }
}

// ============ OpenAI ============

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    tag: String,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let model = config.model_or_default();
        Ok(Self {
            client: http_client(config)?,
            api_key,
            tag: format!("openai:{}", model),
            model,
            dims: config.dims_or_default(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn provider_tag(&self) -> &str {
        &self.tag
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
            "dimensions": self.dims,
        });
        debug!(model = %self.model, chars = text.len(), "embedding via OpenAI");
        let result = post_with_retry("OpenAI", self.max_retries, || {
            self.client
                .post(OPENAI_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
        })
        .await
        .and_then(|json| parse_openai_response(&json));
        first_vector("openai", result)
    }
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    tag: String,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model_or_default();
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());
        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            tag: format!("ollama:{}", model),
            model,
            dims: config.dims_or_default(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn provider_tag(&self) -> &str {
        &self.tag
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let endpoint = format!("{}/api/embed", self.url);
        let result = post_with_retry("Ollama", self.max_retries, || {
            self.client.post(&endpoint).json(&body)
        })
        .await
        .and_then(|json| parse_ollama_response(&json));
        first_vector("ollama", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_response() {
        let json = serde_json::json!({
            "data": [{"embedding": [0.1, 0.2]}, {"embedding": [0.3, 0.4]}]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[1], vec![0.3f32, 0.4]);
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({"embeddings": [[1.0, 2.0, 3.0]]});
        assert_eq!(parse_ollama_response(&json).unwrap()[0].len(), 3);
        assert!(parse_ollama_response(&serde_json::json!({"embeddings": [1]})).is_err());
    }

    #[test]
    fn test_create_disabled() {
        let emb = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(emb.provider_tag(), "disabled");
        assert!(!emb.is_enabled());
    }

    #[test]
    fn test_ollama_tag_and_dims() {
        let config = EmbeddingConfig {
            provider: "ollama".to_string(),
            url: Some("http://127.0.0.1:9/".to_string()),
            ..Default::default()
        };
        let emb = create_embedder(&config).unwrap();
        assert_eq!(emb.provider_tag(), "ollama:nomic-embed-text");
        assert_eq!(emb.dims(), 768);
    }

    #[tokio::test]
    async fn test_unreachable_ollama_is_unavailable_not_error() {
        let config = EmbeddingConfig {
            provider: "ollama".to_string(),
            url: Some("http://127.0.0.1:9".to_string()),
            max_retries: 0,
            timeout_secs: 1,
            ..Default::default()
        };
        let emb = OllamaEmbedder::new(&config).unwrap();
        assert!(emb.embed("hello").await.is_none());
    }
}
