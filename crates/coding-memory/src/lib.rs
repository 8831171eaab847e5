//! # Coding Memory
//!
//! **Per-project memory of AI coding sessions.**
//!
//! Coding Memory keeps the sessions, decisions, bugs, patterns and notes
//! produced while working with AI coding assistants, grouped by project.
//! Agents query it with hybrid (keyword + vector) search and receive a
//! token-budgeted context bundle. Chat logs written by the assistants
//! themselves are imported incrementally, both at startup and just before
//! queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────┐
//! │  Chat logs   │──▶│ ImportSyncManager │──▶│  SQLite   │
//! │ Claude/Codex │   │ fingerprint+embed │   │ FTS5+Vec  │
//! └──────────────┘   └──────────────────┘   └────┬─────┘
//!                                                │
//!                   ┌────────────────────────────┤
//!                   ▼                            ▼
//!           ┌────────────────┐          ┌────────────────┐
//!           │ HybridSearch / │          │ capture ops    │
//!           │ ContextAssembler│         │ save / ingest  │
//!           └───────┬────────┘          └───────┬────────┘
//!                   └──────────┬────────────────┘
//!                              ▼
//!                     ┌────────────────┐
//!                     │ MemoryService  │──▶ `cmem` CLI
//!                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | TOML configuration with defaults and validation |
//! | [`db`] / [`migrate`] | SQLite pool and schema |
//! | [`sqlite_store`] | [`KnowledgeStore`](coding_memory_core::store::KnowledgeStore) over SQLite (FTS5 + vector BLOBs) |
//! | [`guard`] | Per-call timeouts for the store and the embedder |
//! | [`embedding`] | OpenAI and Ollama embedding providers |
//! | [`importers`] | Chat-log parsers (`claude-code`, `codex`, `generic-json`) |
//! | [`sync`] | Cooldown-gated, idempotent import passes |
//! | [`service`] | Retrieval and capture operations |
//! | [`logging`] | `tracing` subscriber setup |
//!
//! The scope rules, the hybrid ranking and context assembly live in
//! [`coding_memory_core`] so they can be reused over any store.
//!
//! ## Quick Start
//!
//! ```bash
//! cmem init                          # create the database
//! cmem sync                          # import configured chat logs
//! cmem context "why did checkout double-charge"
//! cmem save decision --title "Use sqlx" --description "compile-checked queries"
//! ```

pub mod config;
pub mod db;
pub mod embedding;
pub mod guard;
pub mod importers;
pub mod logging;
pub mod migrate;
pub mod service;
pub mod sqlite_store;
pub mod sync;

pub use coding_memory_core as core;
