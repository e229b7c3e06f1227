//! Scriptorium: explicit retrieval and memory for offline inference.
//!
//! Scriptorium ingests offline corpora (curated Wikipedia, MITRE ATT&CK, arXiv
//! abstracts) into a searchable index, answers retrieval queries with ranked,
//! provenance-tagged passages, keeps a durable and reversible memory of prior
//! interactions that does not depend on the inference model, and assembles
//! token-budgeted context bundles. Nothing happens implicitly: every action is
//! a [`router::ToolInvocation`] dispatched through [`router::Router`], and every
//! dispatch is audit-logged.
//!
//! # Architecture
//!
//! - **Corpus**: SQLite with FTS5 (BM25) and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) vectors in `corpus.db`
//! - **Memory**: a separate `memory.db` with tombstones and explicit compaction
//! - **Embeddings**: feature hashing by default, or local ONNX Runtime with
//!   all-MiniLM-L6-v2 (384 dimensions)
//! - **Surfaces**: the `scriptorium` CLI and an MCP server over stdio or
//!   Streamable HTTP
//!
//! # Modules
//!
//! - [`config`]: configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations, connection pooling
//! - [`embedding`]: text-to-vector providers
//! - [`corpus`]: document store, chunker, indexer, file loader
//! - [`retrieval`]: hybrid ranking, dedup, latency budget
//! - [`memory`]: session memory store
//! - [`context`]: token-budgeted bundles and the inference request shape
//! - [`router`]: the closed set of invocations and the audit log

pub mod cli;
pub mod config;
pub mod context;
pub mod corpus;
pub mod db;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod retrieval;
pub mod router;
pub mod server;
pub mod tools;

pub use error::{CoreError, Result};
