//! Core data types flowing through the index.
//!
//! The data lifecycle is:
//!
//! ```text
//! Scanner → FileChange → Pipeline → Chunker → ChunkDraft
//!                                       ↓
//!                              embed() / reuse → StoredChunk (SQLite)
//!                                       ↓
//!                              SearchEngine → SearchResultItem
//! ```
//!
//! A **[`ChunkDraft`]** is the chunker's output: a token-bounded semantic
//! subtree of one XML artifact, with its line range, propagated context,
//! extracted references, and the text that will be embedded. The pipeline
//! reconciles drafts against **[`StoredChunk`]** rows by slot
//! `(chunk_index, start_line, end_line)` and by content hash, so unchanged
//! chunks keep their embeddings across runs.

use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

/// A chunk as produced by the chunker, before it has a store id or an
/// embedding.
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    /// Emission order within the file, starting at 0.
    pub chunk_index: i64,
    /// Inclusive 1-based line range in the source file.
    pub start_line: i64,
    pub end_line: i64,
    /// Best-available name: `name`/`key`/`context` attribute, else the tag.
    pub resource_name: String,
    /// Artifact type of the enclosing file (`api`, `sequence`, …).
    pub resource_type: String,
    /// The XML tag that induced this chunk.
    pub chunk_type: String,
    /// Index (within this file's emission) of the enclosing emitted chunk.
    pub parent_index: Option<usize>,
    /// SHA-256 over the canonical encoding of content + type + intent +
    /// context. Embedding reuse is keyed on this.
    pub content_hash: String,
    /// Coarse classification: api, sequence, mediator, connector, policy,
    /// configuration, boundary, component.
    pub semantic_type: String,
    /// validation, transformation, delegation, response, logging,
    /// error-handling, data-access, mediation, processing.
    pub semantic_intent: String,
    /// Schema-agnostic hierarchical context accumulated on the way down.
    pub context: Value,
    /// Set iff this chunk is a standalone artifact definition.
    pub sequence_key: Option<String>,
    pub is_sequence_definition: bool,
    /// Qualified references (`type:name`) found in the chunk content.
    pub referenced_sequences: Vec<String>,
    /// The text fed to the embedder and mirrored into FTS.
    pub embedding_text: String,
}

/// A chunk row as persisted in the `chunks` table.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    /// Store-assigned id.
    pub id: i64,
    pub file_path: String,
    /// SHA-256 of the source file at the time of chunking.
    pub file_hash: String,
    pub chunk_index: i64,
    pub start_line: i64,
    pub end_line: i64,
    pub resource_name: String,
    pub resource_type: String,
    pub chunk_type: String,
    pub parent_chunk_id: Option<i64>,
    /// Raw little-endian f32 bytes; decode with
    /// [`crate::embedding::blob_to_vec`].
    pub embedding: Vec<u8>,
    pub content_hash: String,
    pub semantic_type: String,
    pub semantic_intent: String,
    pub context: Value,
    pub sequence_key: Option<String>,
    pub is_sequence_definition: bool,
    pub referenced_sequences: Vec<String>,
    /// Last write, epoch milliseconds.
    pub timestamp: i64,
    pub embedding_text: String,
}

/// A change detected by the scanner.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    /// SHA-256 of the file content; empty for deletions.
    pub hash: String,
    /// False when the file disappeared.
    pub exists: bool,
}

/// Counters reported by a pipeline pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub files_processed: u64,
    pub files_deleted: u64,
    /// Chunks whose embedding was computed in this pass.
    pub embedded: u64,
    /// Chunks whose stored embedding was kept (identical content hash).
    pub reused: u64,
    /// Stored chunks removed because their slot is no longer produced.
    pub deleted: u64,
    /// Reference edges inserted.
    pub references_linked: u64,
}

/// Options accepted by [`crate::service::IndexService::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub top_k: Option<usize>,
    pub score_threshold: Option<f32>,
    /// Restrict results to one semantic type.
    pub semantic_type: Option<String>,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub file_path: String,
    /// `[start, end]`, inclusive, 1-based.
    pub line_range: [i64; 2],
    /// Outer-to-inner rendering, e.g.
    /// `["api:OrderApi", "resource:GET /orders", "log:audit"]`.
    pub xml_element_hierarchy: Vec<String>,
    /// Hybrid score rounded to 1e-4.
    pub score: f32,
    pub chunk_id: String,
}

/// Structured response of the search surface. Never an error: failures are
/// reported through `code`/`message` so the host can fall back to plain
/// text search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultItem>,
    pub confidence_threshold: f32,
    pub query_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SearchResponse {
    pub fn unavailable(threshold: f32) -> Self {
        Self {
            results: Vec::new(),
            confidence_threshold: threshold,
            query_latency_ms: 0,
            code: Some("EMBEDDING_SERVICE_UNAVAILABLE".to_string()),
            message: Some(
                "Semantic index is not ready; fall back to plain text search.".to_string(),
            ),
        }
    }

    pub fn empty_index(threshold: f32, latency_ms: u64) -> Self {
        Self {
            results: Vec::new(),
            confidence_threshold: threshold,
            query_latency_ms: latency_ms,
            code: None,
            message: Some(
                "No chunks indexed yet; plain text search may give better results.".to_string(),
            ),
        }
    }
}
