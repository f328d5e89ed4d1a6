use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/rag.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap")]
    pub overlap_chars: usize,
    /// `auto` picks a strategy from the file type.
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap(),
            strategy: default_strategy(),
        }
    }
}

fn default_max_chars() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}
fn default_strategy() -> String {
    "auto".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_true")]
    pub normalize: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            cache_capacity: default_cache_capacity(),
            normalize: true,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_capacity() -> usize {
    4096
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    /// Each channel fetches `top_k * candidate_factor` candidates.
    #[serde(default = "default_candidate_factor")]
    pub candidate_factor: usize,
    #[serde(default)]
    pub similarity_threshold: f64,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_true")]
    pub rerank: bool,
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
    #[serde(default = "default_normalization")]
    pub normalization: String,
    #[serde(default)]
    pub min_context_score: f64,
    /// Cached hybrid result sets; 0 disables the cache.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Jaccard word overlap above which a lower-ranked result counts as a
    /// duplicate.
    #[serde(default = "default_dedupe_threshold")]
    pub dedupe_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            candidate_factor: default_candidate_factor(),
            similarity_threshold: 0.0,
            final_limit: default_final_limit(),
            rerank: true,
            rerank_top_n: default_rerank_top_n(),
            normalization: default_normalization(),
            min_context_score: 0.0,
            cache_size: default_cache_size(),
            cache_ttl_secs: default_cache_ttl_secs(),
            dedupe_threshold: default_dedupe_threshold(),
        }
    }
}

fn default_vector_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_candidate_factor() -> usize {
    2
}
fn default_final_limit() -> usize {
    10
}
fn default_rerank_top_n() -> usize {
    20
}
fn default_normalization() -> String {
    "min_max".to_string()
}
fn default_cache_size() -> usize {
    100
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_dedupe_threshold() -> f64 {
    0.9
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 0 means one worker per available CPU.
    #[serde(default)]
    pub max_workers: usize,
    /// Empty means every extension the extractor registry supports.
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_workers: 0,
            extensions: Vec::new(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

impl IndexingConfig {
    pub fn effective_workers(&self) -> usize {
        if self.max_workers > 0 {
            self.max_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

/// Initial directory policy. A policy saved in the database wins over this.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    #[serde(default)]
    pub allowed: Vec<PathBuf>,
    #[serde(default)]
    pub excluded: Vec<PathBuf>,
}

/// Expand `~` at the start of a path to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/") || s == "~" {
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            return home.join(s.strip_prefix("~/").unwrap_or(""));
        }
    }
    path.to_path_buf()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        bail!("chunking.overlap_chars must be < chunking.max_chars");
    }
    match config.chunking.strategy.as_str() {
        "auto" | "fixed" | "paragraph" | "sentence" | "code" => {}
        other => bail!(
            "Unknown chunking strategy: '{}'. Must be auto, fixed, paragraph, sentence, or code.",
            other
        ),
    }

    let r = &config.retrieval;
    if r.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if r.vector_weight < 0.0 || r.keyword_weight < 0.0 {
        bail!("retrieval weights must be >= 0");
    }
    if r.vector_weight + r.keyword_weight <= 0.0 {
        bail!("retrieval.vector_weight and retrieval.keyword_weight cannot both be 0");
    }
    if r.candidate_factor < 1 {
        bail!("retrieval.candidate_factor must be >= 1");
    }
    if !(-1.0..=1.0).contains(&r.similarity_threshold) {
        bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&r.dedupe_threshold) {
        bail!("retrieval.dedupe_threshold must be in [0.0, 1.0]");
    }
    match r.normalization.as_str() {
        "min_max" | "softmax" => {}
        other => bail!(
            "Unknown retrieval.normalization: '{}'. Must be min_max or softmax.",
            other
        ),
    }

    let e = &config.embedding;
    if e.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if e.cache_capacity == 0 {
        bail!("embedding.cache_capacity must be > 0");
    }
    if e.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    match e.provider.as_str() {
        "hash" | "local" => {}
        "openai" | "ollama" => {
            if e.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    e.provider
                );
            }
            if e.dims.is_none() {
                bail!(
                    "embedding.dims must be specified when provider is '{}'",
                    e.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, ollama, openai, or local.",
            other
        ),
    }

    Ok(())
}
