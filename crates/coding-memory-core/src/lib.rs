//! # Coding Memory Core
//!
//! Shared, WASM-safe logic for Coding Memory: record models, scope
//! resolution, the knowledge-store abstraction, hybrid ranking, context
//! assembly, and the import sync-state record.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Persistence backends, embedding providers,
//! chat-log importers, and the sync driver live in the `coding-memory`
//! app crate.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`models`] | Tagged record variants sharing [`models::RecordMeta`] |
//! | [`scope`] | [`scope::ScopeResolver`] |
//! | [`embedding`] | [`embedding::Embedder`] capability + vector helpers |
//! | [`store`] | [`store::KnowledgeStore`] trait + in-memory backend |
//! | [`search`] | [`search::HybridSearchEngine`] |
//! | [`context`] | [`context::ContextAssembler`] |
//! | [`sync`] | [`sync::SyncState`] + [`sync::SyncTrigger`] seam |
//! | [`error`] | [`error::MemoryError`] |

pub mod context;
pub mod embedding;
pub mod error;
pub mod models;
pub mod scope;
pub mod search;
pub mod store;
pub mod sync;
