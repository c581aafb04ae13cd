//! Embedding provider abstraction and implementations.
//!
//! Defines the thin contracts the index consumes:
//!
//! - [`TokenCounter`] — token counting for the chunker's size gate.
//! - [`Embedder`] — batch text embedding with a fixed output dimension.
//! - [`ModelProvider`] — resolves (and verifies) the model directory.
//!
//! Two embedders ship with the crate: [`TractEmbedder`] runs a local
//! sentence-transformer ONNX model with the `tokenizers` + `tract-onnx`
//! pure-Rust path, and [`HashingEmbedder`] produces deterministic
//! pseudo-embeddings for offline use and tests.
//!
//! Also provides the vector utilities shared by the store and the search
//! engine: [`vec_to_blob`] / [`blob_to_vec`] for BLOB storage and
//! [`cosine_similarity`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tract_onnx::prelude::*;

use crate::config::EmbeddingConfig;
use crate::error::IndexError;

/// Token counting for the chunker's size gate.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Batch text embedding. Output vectors all have [`dims`](Embedder::dims)
/// elements.
#[async_trait]
pub trait Embedder: TokenCounter {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
    }

    fn dims(&self) -> usize;
}

/// Borrow an embedder as a plain token counter (the chunker only needs the
/// counting half of the contract).
pub struct EmbedderTokenCounter<'a>(pub &'a dyn Embedder);

impl TokenCounter for EmbedderTokenCounter<'_> {
    fn count_tokens(&self, text: &str) -> usize {
        self.0.count_tokens(text)
    }
}

/// Resolves the directory holding the model artifacts. Implementations may
/// download and cache; the index only reads.
pub trait ModelProvider: Send + Sync {
    fn ensure_model(&self) -> Result<PathBuf, IndexError>;
}

/// Files a usable model directory must contain.
const MODEL_FILES: &[&str] = &[
    "config.json",
    "tokenizer_config.json",
    "tokenizer.json",
    "vocab.txt",
    "onnx/model_quantized.onnx",
];

/// Provider over an already-materialized local directory.
pub struct LocalModelProvider {
    dir: PathBuf,
}

impl LocalModelProvider {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl ModelProvider for LocalModelProvider {
    fn ensure_model(&self) -> Result<PathBuf, IndexError> {
        for file in MODEL_FILES {
            let path = self.dir.join(file);
            if !path.exists() {
                return Err(IndexError::ModelUnavailable(format!(
                    "missing {} under {}",
                    file,
                    self.dir.display()
                )));
            }
        }
        Ok(self.dir.clone())
    }
}

/// Approximate chars-per-token ratio used when no tokenizer is loaded.
const CHARS_PER_TOKEN: usize = 4;

/// Character-ratio token counter for tests and the hashing embedder.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        text.len().div_ceil(CHARS_PER_TOKEN)
    }
}

// ============ Tract Embedder ============

/// Pure-Rust local embedding: `tokenizers` for encoding, `tract-onnx` for
/// inference, mean pooling over valid positions, L2 normalization.
pub struct TractEmbedder {
    tokenizer: Arc<tokenizers::Tokenizer>,
    model: Arc<TypedRunnableModel<TypedModel>>,
    dims: usize,
    max_len: usize,
    batch_size: usize,
}

impl TractEmbedder {
    /// Load from a model directory in the standard layout (see
    /// [`LocalModelProvider`]).
    pub fn load(model_dir: &Path, config: &EmbeddingConfig) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("load tokenizer {}: {}", tokenizer_path.display(), e))?;

        let onnx_path = model_dir.join("onnx").join("model_quantized.onnx");
        let model = tract_onnx::onnx()
            .model_for_path(&onnx_path)
            .map_err(|e| anyhow::anyhow!("load ONNX {}: {}", onnx_path.display(), e))?
            .into_optimized()
            .map_err(|e| anyhow::anyhow!("optimize model: {}", e))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("build runnable model: {}", e))?;

        Ok(Self {
            tokenizer: Arc::new(tokenizer),
            model: Arc::new(model),
            dims: config.dims,
            max_len: config.max_len,
            batch_size: config.batch_size,
        })
    }

    fn run_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let encodings: Vec<_> = texts
            .iter()
            .map(|s| {
                self.tokenizer
                    .encode(s.as_str(), true)
                    .map_err(|e| anyhow::anyhow!("tokenize: {}", e))
            })
            .collect::<Result<Vec<_>>>()?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(1)
            .min(self.max_len)
            .max(1);

        let batch = encodings.len();
        let mut input_ids = vec![0i64; batch * max_len];
        let mut attention_mask = vec![0i64; batch * max_len];
        for (i, enc) in encodings.iter().enumerate() {
            let ids = enc.get_ids();
            let len = ids.len().min(max_len);
            for (j, &id) in ids.iter().take(len).enumerate() {
                input_ids[i * max_len + j] = id as i64;
                attention_mask[i * max_len + j] = 1;
            }
        }

        let input_ids_tensor = tract_onnx::prelude::tract_ndarray::Array2::from_shape_vec((batch, max_len), input_ids)
            .map_err(|e| anyhow::anyhow!("input ids shape: {}", e))?;
        let attention_tensor = tract_onnx::prelude::tract_ndarray::Array2::from_shape_vec((batch, max_len), attention_mask)
            .map_err(|e| anyhow::anyhow!("attention mask shape: {}", e))?;

        let input_ids_t: Tensor = input_ids_tensor.into();
        let attention_t: Tensor = attention_tensor.into();
        let result = self
            .model
            .run(tvec!(input_ids_t.into(), attention_t.into()))?;

        let output = result
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no output tensor"))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| anyhow::anyhow!("output to array: {}", e))?;

        // [batch, dims] for sentence_embedding heads, [batch, seq, dims] for
        // last_hidden_state; mean-pool the latter over valid positions.
        let shape = view.shape();
        let mut embeddings = Vec::with_capacity(batch);
        if shape.len() == 2 {
            for i in 0..shape[0] {
                let row: Vec<f32> = view.slice(tract_onnx::prelude::tract_ndarray::s![i, ..]).iter().copied().collect();
                embeddings.push(normalize_l2(row));
            }
        } else if shape.len() == 3 {
            let seq_len = shape[1];
            for (i, enc) in encodings.iter().enumerate() {
                let valid = enc.get_ids().len().min(seq_len).min(max_len);
                let mut sum = vec![0f32; self.dims];
                let mut count = 0f32;
                for j in 0..valid {
                    for (k, &v) in view.slice(tract_onnx::prelude::tract_ndarray::s![i, j, ..]).iter().enumerate() {
                        if k < self.dims {
                            sum[k] += v;
                        }
                    }
                    count += 1.0;
                }
                if count > 0.0 {
                    for x in &mut sum {
                        *x /= count;
                    }
                }
                embeddings.push(normalize_l2(sum));
            }
        } else {
            bail!("unexpected output shape: {:?}", shape);
        }

        Ok(embeddings)
    }
}

impl TokenCounter for TractEmbedder {
    fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer
            .encode(text, true)
            .map(|enc| enc.get_ids().len())
            .unwrap_or_else(|_| ApproxTokenCounter.count_tokens(text))
    }
}

#[async_trait]
impl Embedder for TractEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let tokenizer = Arc::clone(&self.tokenizer);
            let model = Arc::clone(&self.model);
            let this = TractEmbedder {
                tokenizer,
                model,
                dims: self.dims,
                max_len: self.max_len,
                batch_size: self.batch_size,
            };
            let batch = batch.to_vec();
            let vectors =
                tokio::task::spawn_blocking(move || this.run_batch(&batch)).await??;
            all.extend(vectors);
        }
        Ok(all)
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

// ============ Hashing Embedder ============

/// Deterministic pseudo-embedder: token hashes scattered into a fixed-size
/// vector, L2-normalized. Shares vocabulary overlap with real text, so
/// similar texts get similar vectors; useful offline and in tests.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dims];
        for token in text.split_whitespace() {
            let digest = Sha256::digest(token.to_ascii_lowercase().as_bytes());
            let bucket = u64::from_le_bytes(digest[0..8].try_into().unwrap()) as usize % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalize_l2(v)
    }
}

impl TokenCounter for HashingEmbedder {
    fn count_tokens(&self, text: &str) -> usize {
        ApproxTokenCounter.count_tokens(text)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity. Returns 0 for empty vectors, mismatched lengths, or a
/// zero norm on either side.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip_is_identity() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), vec.len() * 4);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_one("log audit message").await.unwrap();
        let b = embedder.embed_one("log audit message").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn hashing_embedder_separates_unrelated_text() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_one("validate order payload schema").await.unwrap();
        let b = embedder.embed_one("completely different words here").await.unwrap();
        let sim_self = cosine_similarity(&a, &a);
        let sim_other = cosine_similarity(&a, &b);
        assert!(sim_self > sim_other);
    }

    #[test]
    fn local_provider_reports_missing_files() {
        let dir = std::env::temp_dir().join("arti-missing-model");
        std::fs::create_dir_all(&dir).unwrap();
        let provider = LocalModelProvider::new(dir);
        match provider.ensure_model() {
            Err(IndexError::ModelUnavailable(msg)) => assert!(msg.contains("config.json")),
            other => panic!("expected ModelUnavailable, got {:?}", other.map(|p| p.display().to_string())),
        }
    }

    #[test]
    fn approx_counter_rounds_up() {
        let counter = ApproxTokenCounter;
        assert_eq!(counter.count_tokens(""), 0);
        assert_eq!(counter.count_tokens("abcd"), 1);
        assert_eq!(counter.count_tokens("abcde"), 2);
    }
}
