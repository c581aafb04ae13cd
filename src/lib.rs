//! # Artifact Index
//!
//! **A per-project semantic code index for XML integration artifacts.**
//!
//! Artifact Index watches a project tree of XML configuration artifacts
//! (APIs, sequences, endpoints, proxies, data services, …), decomposes each
//! file into token-bounded semantic chunks, embeds every chunk with a
//! sentence-transformer model, stores embeddings and metadata in SQLite with
//! an FTS5 mirror, and serves hybrid (dense + BM25) search with diversity
//! reranking and overlap deduplication.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────────────┐   ┌───────────┐
//! │ Scanner  │──▶│ Chunker  │──▶│ reuse? │ embed? │──▶│  SQLite   │
//! │ sha256   │   │ XML walk │   │  (content hash) │   │ FTS5+BLOB │
//! └──────────┘   └──────────┘   └─────────────────┘   └─────┬─────┘
//!                                                           │
//!                                   ┌───────────────────────┤
//!                                   ▼                       ▼
//!                             ┌───────────┐          ┌────────────┐
//!                             │  Service  │          │   Search   │
//!                             │  facade   │          │ dense+BM25 │
//!                             └───────────┘          └────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **scanner** ([`scanner`]) walks the project, hashes files, and
//!    emits [`models::FileChange`]s; a warm start seeds it from the store so
//!    untouched files are never re-indexed.
//! 2. The **chunker** ([`chunker`]) partitions each XML file into
//!    context-rich [`models::ChunkDraft`]s using the plugin registry
//!    ([`artifacts`]) plus boundary heuristics.
//! 3. The **pipeline** ([`pipeline`]) reconciles drafts against stored rows
//!    by slot and content hash ([`hasher`]); only changed chunks are
//!    re-embedded ([`embedding`]).
//! 4. The **store** ([`store`]) persists chunks, embeddings (f32 BLOBs), and
//!    the bijective FTS5 mirror, plus the caller → callee reference edges.
//! 5. The **search engine** ([`search`]) fuses cosine similarity with
//!    normalized BM25, reranks with MMR, and deduplicates overlapping
//!    spans.
//! 6. The **service facade** ([`service`]) owns lifecycle, per-project
//!    instances, the watcher ([`watcher`]) and the poll timer, and exposes
//!    `start` / `notify_file_change` / `search` / `stop`.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Failure taxonomy (`IndexError`) |
//! | [`models`] | Core data types: `ChunkDraft`, `StoredChunk`, `FileChange`, search DTOs |
//! | [`artifacts`] | Artifact plugin registry and aggregate tag lookups |
//! | [`xml`] | Ordered element tree over `quick-xml` events |
//! | [`chunker`] | Structure-aware, token-bounded XML chunking |
//! | [`hasher`] | Canonical content hashing and Merkle grouping |
//! | [`scanner`] | Directory walking and per-file change detection |
//! | [`embedding`] | Embedder contracts, tract-onnx + hashing embedders, vector utilities |
//! | [`store`] | SQLite persistence with the FTS5 sparse mirror |
//! | [`pipeline`] | Incremental chunk/embed/store orchestration |
//! | [`search`] | Hybrid retrieval: fusion, MMR, overlap dedup |
//! | [`service`] | Per-project lifecycle facade |
//! | [`watcher`] | Debounced file-system watcher |
//! | [`progress`] | Four-stage progress reporting |

pub mod artifacts;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod hasher;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod scanner;
pub mod search;
pub mod service;
pub mod store;
pub mod watcher;
pub mod xml;
