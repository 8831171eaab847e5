//! Embedder capability interface and vector utilities.
//!
//! Defines the [`Embedder`] trait every embedding backend implements,
//! plus pure helpers for vector serialization and similarity.
//!
//! Embedding is best-effort. A provider that is disabled, unreachable, or
//! slow yields `None` and the caller degrades to keyword-only ranking; it
//! never raises. Concrete providers (OpenAI, Ollama) live in the
//! `coding-memory` app crate.

use async_trait::async_trait;

use crate::models::Record;

/// Capability interface: `embed(text) -> vector | unavailable`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider tag stored next to every vector (e.g.
    /// `"openai:text-embedding-3-small"`). Vectors with different tags are
    /// never compared.
    fn provider_tag(&self) -> &str;

    /// Vector dimensionality; `0` when disabled.
    fn dims(&self) -> usize;

    /// Embed `text`. `None` means unavailable for this call.
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;

    fn is_enabled(&self) -> bool {
        self.dims() > 0
    }
}

/// Embedder used when no provider is configured.
#[derive(Debug, Default, Clone)]
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn provider_tag(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> Option<Vec<f32>> {
        None
    }
}

/// Keep `vector` only if it has the expected dimensionality.
pub fn accept_vector(vector: Vec<f32>, dims: usize) -> Option<Vec<f32>> {
    if dims > 0 && vector.len() == dims {
        Some(vector)
    } else {
        None
    }
}

/// Embed a record in place. Returns whether a vector was attached.
///
/// On failure any stale vector is cleared, so a record never carries a
/// vector from a different provider than the one it was last embedded
/// with.
pub async fn attach_embedding(embedder: &dyn Embedder, record: &mut Record) -> bool {
    if !embedder.is_enabled() {
        return false;
    }
    let text = record.embedding_text();
    let vector = match embedder.embed(&text).await {
        Some(v) => accept_vector(v, embedder.dims()),
        None => None,
    };
    let meta = record.meta_mut();
    match vector {
        Some(v) => {
            meta.embedding = Some(v);
            meta.embedding_provider = Some(embedder.provider_tag().to_string());
            true
        }
        None => {
            meta.embedding = None;
            meta.embedding_provider = None;
            false
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use coding_memory_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
