//! Error taxonomy shared by the core and every store backend.
//!
//! Only conditions a caller can act on are errors. An unavailable embedder
//! is modelled as an absent vector (`Option::None`) and a conflicting scope
//! request is resolved by policy, so neither appears here.

use thiserror::Error;

/// Errors surfaced by the retrieval and import pipeline.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The knowledge store could not be reached or timed out.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// An import source (chat-log directory or file) is missing or unparseable.
    #[error("import source '{source_id}' unreadable: {reason}")]
    ImportSourceUnreadable { source_id: String, reason: String },

    /// A record addressed by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request itself is malformed (empty title, unknown type name, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl MemoryError {
    /// Wrap any backend error as [`MemoryError::StoreUnavailable`].
    pub fn store(err: impl std::fmt::Display) -> Self {
        MemoryError::StoreUnavailable(err.to_string())
    }

    /// Build an [`MemoryError::ImportSourceUnreadable`] for `source_id`.
    pub fn import_source(source_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        MemoryError::ImportSourceUnreadable {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error means the store itself is unhealthy.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, MemoryError::StoreUnavailable(_))
    }
}

/// Result alias used across the core crate.
pub type Result<T> = std::result::Result<T, MemoryError>;
