//! Embedding backends.
//!
//! A backend turns a batch of texts into vectors in one call. Retries,
//! timeouts, caching and normalization live in
//! [`EmbeddingGenerator`](super::EmbeddingGenerator); backends only report
//! whether a failure is transient ([`EmbeddingError::Unavailable`]) or
//! final ([`EmbeddingError::Rejected`]).
//!
//! | `provider` | Backend |
//! |------------|---------|
//! | `"hash"`   | [`HashBackend`], offline feature hashing |
//! | `"ollama"` | [`OllamaBackend`], `POST /api/embed` |
//! | `"openai"` | [`OpenAiBackend`], `POST /v1/embeddings` |
//! | `"local"`  | `FastEmbedBackend` (feature `local-embeddings-fastembed`) |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

/// Default dimension of the hash backend.
pub const DEFAULT_HASH_DIMS: usize = 384;

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Identifier stored with every embedding this backend produces.
    fn model_id(&self) -> &str;
    fn dims(&self) -> usize;
    /// Embed `texts`, returning one vector per text in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Build the backend named by `embedding.provider`.
pub fn create_backend(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingBackend>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashBackend::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "ollama" => Ok(Arc::new(OllamaBackend::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiBackend::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(FastEmbedBackend::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Hash Backend ============

/// Deterministic bag-of-features embedder.
///
/// Each lowercase word and each character trigram of a word is hashed
/// (FNV-1a) into one of `dims` buckets with a hash-derived sign. Texts
/// that share words or word fragments land close together; texts with
/// disjoint vocabulary are near-orthogonal. Needs no model or network.
#[derive(Debug, Clone)]
pub struct HashBackend {
    dims: usize,
    model_id: String,
}

impl HashBackend {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            model_id: format!("hash-{}", dims),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            self.add_feature(&mut v, word.as_bytes(), 1.0);

            let chars: Vec<char> = format!("^{}$", word).chars().collect();
            for tri in chars.windows(3) {
                let tri: String = tri.iter().collect();
                self.add_feature(&mut v, tri.as_bytes(), 0.25);
            }
        }
        v
    }

    fn add_feature(&self, v: &mut [f32], bytes: &[u8], weight: f32) {
        let h = fnv1a(bytes);
        let bucket = (h % self.dims as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

#[async_trait]
impl EmbeddingBackend for HashBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ HTTP Backends ============

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn required_model_and_dims(config: &EmbeddingConfig, provider: &str) -> Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", provider))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", provider))?;
    Ok((model, dims))
}

/// Send a JSON request and map the HTTP outcome onto [`EmbeddingError`].
///
/// 429 and 5xx are transient; any other non-success status is final.
async fn post_json(
    request: reqwest::RequestBuilder,
    label: &str,
) -> Result<serde_json::Value, EmbeddingError> {
    let response = request.send().await.map_err(|e| {
        EmbeddingError::Unavailable(format!("{} connection error: {}", label, e))
    })?;
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(format!("{}: {}", label, e)));
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} API error {}: {}", label, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        Err(EmbeddingError::Unavailable(message))
    } else {
        Err(EmbeddingError::Rejected(message))
    }
}

fn json_vector(value: &serde_json::Value) -> Result<Vec<f32>, EmbeddingError> {
    value
        .as_array()
        .ok_or_else(|| EmbeddingError::InvalidResponse("embedding is not an array".into()))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::InvalidResponse("non-numeric component".into()))
        })
        .collect()
}

/// Local Ollama instance. Requires an embedding model to be pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model_and_dims(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body);
        let json = post_json(request, "Ollama").await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing embeddings array".into()))?
        .iter()
        .map(json_vector)
        .collect()
}

/// OpenAI-compatible embeddings endpoint. Reads `OPENAI_API_KEY`.
pub struct OpenAiBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model_and_dims(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = post_json(request, "OpenAI").await?;
        parse_openai_response(&json)
    }
}

/// Items carry an `index`; order by it rather than trusting array order.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding".into()))?;
        indexed.push((index, json_vector(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Local (fastembed) Backend ============

/// In-process ONNX models via fastembed. Downloaded on first use.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct FastEmbedBackend {
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
    model_id: String,
    dims: usize,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl FastEmbedBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_id = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (kind, default_dims) = match model_id.as_str() {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "nomic-embed-text-v1.5" => (fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
            "multilingual-e5-small" => (fastembed::EmbeddingModel::MultilingualE5Small, 384),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: all-minilm-l6-v2, \
                 bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5, multilingual-e5-small",
                other
            ),
        };
        let model = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(kind))
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(model)),
            model_id,
            dims: config.dims.unwrap_or(default_dims),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingBackend for FastEmbedBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            model
                .embed(texts, None)
                .map_err(|e| EmbeddingError::Unavailable(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| EmbeddingError::Unavailable(format!("local embedding task failed: {}", e)))?
    }
}
