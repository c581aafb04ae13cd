use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexConfig {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub references: ReferencesConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DbConfig {
    /// Explicit database path. When unset, the service derives a per-project
    /// path under the user data directory; nothing is written into the
    /// project tree.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Token ceiling for a single chunk's embedding text.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Weight of the dense (cosine) score in the hybrid fusion.
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f32,
    /// Weight of the normalized BM25 score in the hybrid fusion.
    #[serde(default = "default_sparse_weight")]
    pub sparse_weight: f32,
    /// Results below this hybrid score are dropped.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    /// MMR relevance/diversity trade-off.
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
    /// Same-file candidates overlapping more than this fraction of the
    /// smaller span are deduplicated.
    #[serde(default = "default_overlap_threshold")]
    pub overlap_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dense_weight: default_dense_weight(),
            sparse_weight: default_sparse_weight(),
            score_threshold: default_score_threshold(),
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            mmr_lambda: default_mmr_lambda(),
            overlap_threshold: default_overlap_threshold(),
        }
    }
}

fn default_dense_weight() -> f32 {
    0.85
}
fn default_sparse_weight() -> f32 {
    0.15
}
fn default_score_threshold() -> f32 {
    0.25
}
fn default_top_k() -> usize {
    10
}
fn default_max_top_k() -> usize {
    50
}
fn default_mmr_lambda() -> f32 {
    0.7
}
fn default_overlap_threshold() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Directory containing the model artifacts (`config.json`,
    /// `tokenizer_config.json`, `tokenizer.json`, `vocab.txt`,
    /// `onnx/model_quantized.onnx`). Read-only. When unset, the
    /// deterministic hashing embedder is used.
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum token sequence length fed to the model.
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_len: default_max_len(),
        }
    }
}

fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    32
}
fn default_max_len() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// File extensions indexed by the scanner.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Collapse window for file-change events, per path.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Interval of the background incremental scan. Zero disables polling.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            debounce_ms: default_debounce_ms(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    ["xml", "yaml", "yml", "properties", "dmc"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_debounce_ms() -> u64 {
    2000
}
fn default_poll_interval_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ReferencesConfig {
    /// When true, `find_definition` matches both the reference kind and the
    /// name. The default matches on name only, preserving the behavior of
    /// the system this index was built against (artifact names are unique in
    /// practice).
    #[serde(default)]
    pub qualified: bool,
}

pub fn load_config(path: &Path) -> Result<IndexConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: IndexConfig =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.retrieval.default_top_k == 0 {
        anyhow::bail!("retrieval.default_top_k must be >= 1");
    }
    if config.retrieval.max_top_k < config.retrieval.default_top_k {
        anyhow::bail!("retrieval.max_top_k must be >= retrieval.default_top_k");
    }
    if !(0.0..=1.0).contains(&config.retrieval.mmr_lambda) {
        anyhow::bail!("retrieval.mmr_lambda must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.retrieval.overlap_threshold) {
        anyhow::bail!("retrieval.overlap_threshold must be in [0.0, 1.0]");
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.watch.extensions.is_empty() {
        anyhow::bail!("watch.extensions must not be empty");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_search_contract() {
        let config = IndexConfig::default();
        assert!((config.retrieval.dense_weight - 0.85).abs() < 1e-6);
        assert!((config.retrieval.sparse_weight - 0.15).abs() < 1e-6);
        assert!((config.retrieval.score_threshold - 0.25).abs() < 1e-6);
        assert_eq!(config.retrieval.default_top_k, 10);
        assert_eq!(config.retrieval.max_top_k, 50);
        assert!((config.retrieval.mmr_lambda - 0.7).abs() < 1e-6);
        assert_eq!(config.watch.debounce_ms, 2000);
        assert!(config.watch.extensions.contains(&"xml".to_string()));
        assert!(!config.references.qualified);
    }

    #[test]
    fn rejects_zero_max_tokens() {
        let dir = std::env::temp_dir().join("arti-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.toml");
        std::fs::write(&path, "[chunking]\nmax_tokens = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
