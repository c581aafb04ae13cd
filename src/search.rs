//! Hybrid search engine: dense + BM25 fusion, MMR rerank, overlap dedup.
//!
//! Query pipeline, in order: embed the query, pick an adaptive K, collect a
//! BM25 candidate set from the FTS mirror (normalized to `[0, 1]`), scan
//! every stored embedding for cosine similarity, fuse the two scores,
//! filter, rerank the top candidates with Maximal Marginal Relevance for
//! diversity, drop same-file candidates whose line spans substantially
//! overlap, and trim. All stages are in-memory except the query embed and
//! the FTS probe; at this index's scale (10²–10⁴ chunks) the brute-force
//! cosine scan is well under interactive latency.

use anyhow::Result;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

use crate::config::RetrievalConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, Embedder};
use crate::models::{SearchOptions, SearchResponse, SearchResultItem, StoredChunk};
use crate::store::Store;

/// Candidate pool multiplier for both the sparse set and the MMR input.
const CANDIDATE_MULTIPLIER: usize = 3;

/// K used for very short (≤ 2 word) queries.
const SHORT_QUERY_K: usize = 8;

pub struct SearchEngine<'a> {
    store: &'a Store,
    embedder: &'a dyn Embedder,
    config: &'a RetrievalConfig,
}

impl<'a> SearchEngine<'a> {
    pub fn new(store: &'a Store, embedder: &'a dyn Embedder, config: &'a RetrievalConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResponse> {
        let started = Instant::now();
        let threshold = opts.score_threshold.unwrap_or(self.config.score_threshold);

        let chunks = self.store.get_all().await?;
        if chunks.is_empty() {
            return Ok(SearchResponse::empty_index(
                threshold,
                started.elapsed().as_millis() as u64,
            ));
        }

        let query_vec = self.embedder.embed_one(query).await?;

        let requested = opts
            .top_k
            .unwrap_or(self.config.default_top_k)
            .min(self.config.max_top_k);
        let k = effective_k(
            query.split_whitespace().count(),
            requested,
            self.config.max_top_k,
        );

        // Sparse: FTS MATCH, rank-normalized. Syntax errors already became
        // an empty set in the store.
        let sparse = self
            .store
            .bm25_candidates(query, (CANDIDATE_MULTIPLIER * k) as i64)
            .await?;
        let bm25_norm = normalize_bm25(&sparse);

        // Dense: scan every chunk.
        struct Scored<'c> {
            chunk: &'c StoredChunk,
            vector: Vec<f32>,
            hybrid: f32,
        }

        let mut scored: Vec<Scored> = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            if let Some(filter) = &opts.semantic_type {
                if &chunk.semantic_type != filter {
                    continue;
                }
            }
            let vector = blob_to_vec(&chunk.embedding);
            let dense = cosine_similarity(&query_vec, &vector);
            let sparse_score = bm25_norm.get(&chunk.id).copied().unwrap_or(0.0);
            let hybrid =
                self.config.dense_weight * dense + self.config.sparse_weight * sparse_score;
            if hybrid < threshold {
                continue;
            }
            scored.push(Scored {
                chunk,
                vector,
                hybrid,
            });
        }

        scored.sort_by(|a, b| {
            b.hybrid
                .partial_cmp(&a.hybrid)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(CANDIDATE_MULTIPLIER * k);

        let relevance: Vec<f32> = scored.iter().map(|s| s.hybrid).collect();
        let vectors: Vec<&[f32]> = scored.iter().map(|s| s.vector.as_slice()).collect();
        let order = mmr_select(&relevance, &vectors, self.config.mmr_lambda, k);

        // Overlap dedup in MMR order, then trim to K.
        let mut kept: Vec<usize> = Vec::new();
        for idx in order {
            let candidate = scored[idx].chunk;
            let overlaps = kept.iter().any(|&k_idx| {
                let other = scored[k_idx].chunk;
                other.file_path == candidate.file_path
                    && span_overlap_ratio(
                        (candidate.start_line, candidate.end_line),
                        (other.start_line, other.end_line),
                    ) > self.config.overlap_threshold
            });
            if !overlaps {
                kept.push(idx);
            }
            if kept.len() >= k {
                break;
            }
        }

        let results: Vec<SearchResultItem> = kept
            .into_iter()
            .map(|idx| {
                let chunk = scored[idx].chunk;
                SearchResultItem {
                    file_path: chunk.file_path.clone(),
                    line_range: [chunk.start_line, chunk.end_line],
                    xml_element_hierarchy: render_hierarchy(chunk),
                    score: round_score(scored[idx].hybrid),
                    chunk_id: chunk.id.to_string(),
                }
            })
            .collect();

        debug!(
            query,
            candidates = scored.len(),
            results = results.len(),
            "search complete"
        );

        Ok(SearchResponse {
            results,
            confidence_threshold: threshold,
            query_latency_ms: started.elapsed().as_millis() as u64,
            code: None,
            message: None,
        })
    }
}

/// Adaptive K: short queries get a small fixed K, medium queries the
/// requested K, long queries a padded K capped at `max_k`.
pub fn effective_k(query_words: usize, requested: usize, max_k: usize) -> usize {
    if query_words <= 2 {
        SHORT_QUERY_K
    } else if query_words <= 5 {
        requested
    } else {
        (requested + 5).min(max_k)
    }
}

/// Linear normalization of FTS5 rank values into `[0, 1]`. Ranks are
/// negative with most-negative best; the best row maps to 1, the worst to
/// 0, and a single row maps to exactly 1.
pub fn normalize_bm25(rows: &[(i64, f64)]) -> HashMap<i64, f32> {
    if rows.is_empty() {
        return HashMap::new();
    }
    let best = rows.iter().map(|(_, r)| *r).fold(f64::INFINITY, f64::min);
    let worst = rows
        .iter()
        .map(|(_, r)| *r)
        .fold(f64::NEG_INFINITY, f64::max);
    let span = worst - best;

    rows.iter()
        .map(|(id, rank)| {
            let norm = if span.abs() < f64::EPSILON {
                1.0
            } else {
                (worst - rank) / span
            };
            (*id, norm as f32)
        })
        .collect()
}

/// Greedy MMR: repeatedly take the candidate maximizing
/// `λ · relevance − (1 − λ) · max_sim_to_selected`. Ties go to the earlier
/// candidate. Returns indices in selection order.
pub fn mmr_select(relevance: &[f32], vectors: &[&[f32]], lambda: f32, k: usize) -> Vec<usize> {
    let n = relevance.len();
    let mut selected: Vec<usize> = Vec::with_capacity(k.min(n));
    let mut remaining: Vec<usize> = (0..n).collect();

    while selected.len() < k && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (pos, &idx) in remaining.iter().enumerate() {
            let max_sim = selected
                .iter()
                .map(|&s| cosine_similarity(vectors[idx], vectors[s]))
                .fold(0.0f32, f32::max);
            let score = lambda * relevance[idx] - (1.0 - lambda) * max_sim;
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        selected.push(remaining.remove(best_pos));
    }
    selected
}

/// Overlap of two inclusive line spans as a fraction of the smaller span.
pub fn span_overlap_ratio(a: (i64, i64), b: (i64, i64)) -> f32 {
    let overlap = (a.1.min(b.1) - a.0.max(b.0) + 1).max(0);
    let span_a = a.1 - a.0 + 1;
    let span_b = b.1 - b.0 + 1;
    let min_span = span_a.min(span_b).max(1);
    overlap as f32 / min_span as f32
}

fn round_score(score: f32) -> f32 {
    (score * 10_000.0).round() / 10_000.0
}

/// Outer-to-inner rendering of the chunk's position:
/// `["{artifact.type}:{artifact.name}", "resource:{methods} {uri}",
/// "sequence:{name}", "{chunk_type}:{resource_name}"]`, omitting absent
/// levels.
fn render_hierarchy(chunk: &StoredChunk) -> Vec<String> {
    let mut levels = Vec::new();

    if let Some(artifact) = chunk.context.get("artifact") {
        let ty = artifact
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let name = artifact
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        levels.push(format!("{}:{}", ty, name));
    }

    if let Some(resource) = chunk.context.get("resource").and_then(|v| v.as_object()) {
        let methods = resource.get("methods").and_then(|v| v.as_str()).unwrap_or("");
        let uri = resource
            .get("uri-template")
            .or_else(|| resource.get("url-mapping"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let rendered = format!("resource:{} {}", methods, uri);
        let rendered = rendered.trim_end().to_string();
        if rendered != "resource:" {
            levels.push(rendered);
        }
    }

    if let Some(sequence) = chunk.context.get("sequence") {
        let name = match sequence {
            serde_json::Value::Object(map) => map
                .get("name")
                .or_else(|| map.get("key"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            serde_json::Value::String(s) => Some(s.clone()),
            _ => None,
        };
        if let Some(name) = name {
            levels.push(format!("sequence:{}", name));
        }
    }

    let own = format!(
        "{}:{}",
        crate::artifacts::local_name(&chunk.chunk_type),
        chunk.resource_name
    );
    if levels.first() != Some(&own) {
        levels.push(own);
    }

    levels
}
