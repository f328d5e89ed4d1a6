//! # rag-index
//!
//! A local indexing and hybrid search engine for retrieval-augmented
//! generation.
//!
//! Files under an allow-listed set of directories are extracted, chunked,
//! embedded and committed to SQLite. Queries are answered by fusing vector
//! similarity with FTS5 keyword relevance, and turned into ranked context
//! items for a downstream model.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────────┐   ┌───────────┐
//! │  Policy   │──▶│ Pipeline                 │──▶│  SQLite   │
//! │ allow/excl│   │ extract → chunk → embed  │   │ FTS5+Vec  │
//! └───────────┘   └──────────────────────────┘   └─────┬─────┘
//!                                                      │
//!                               ┌──────────────────────┤
//!                               ▼                      ▼
//!                         ┌───────────┐         ┌────────────┐
//!                         │  Hybrid   │────────▶│  Context   │
//!                         │  search   │         │  assembler │
//!                         └───────────┘         └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragx init
//! ragx policy set --allow ~/Documents
//! ragx index ~/Documents
//! ragx search "invoice total"
//! ragx context "invoice total" --format prompt
//! ragx health
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`policy`] | Directory allow/exclude policy |
//! | [`extract`] | Text extraction registry |
//! | [`chunk`] | Chunking strategies |
//! | [`embedding`] | Embedding backends, batching and cache |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`store`] | Transactional persistence and read snapshots |
//! | [`search`] | Vector, keyword and hybrid search |
//! | [`result_cache`] | Search result cache |
//! | [`pipeline`] | Per-file and per-directory indexing |
//! | [`progress`] | Progress reporting |
//! | [`context`] | Context assembly, history, export |
//! | [`stats`] | Index statistics |
//! | [`engine`] | Administration façade |

pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod progress;
pub mod result_cache;
pub mod search;
pub mod stats;
pub mod store;

pub use engine::RagEngine;
pub use error::{EmbeddingError, IndexError};
