//! Embedding generation.
//!
//! [`EmbeddingGenerator`] wraps an [`EmbeddingBackend`] with:
//! - a content-hash keyed LRU cache ([`EmbeddingCache`]) that is emptied
//!   when the model id changes,
//! - batching: cache misses are split into `batch_size` groups that run
//!   concurrently, results scattered back to their input positions,
//! - a per-call timeout and exponential backoff retry for transient
//!   failures,
//! - dimension checks and optional unit-length normalization.
//!
//! Failures are reported per item. A text whose batch failed gets an
//! [`EmbeddingError`], never a zero vector.
//!
//! Also provides the vector utilities used by storage and search:
//! [`cosine_similarity`], [`vec_to_blob`], [`blob_to_vec`].

pub mod backends;
pub mod cache;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

pub use backends::{create_backend, EmbeddingBackend, HashBackend};
pub use cache::{CacheStats, EmbeddingCache};

/// Tuning knobs for [`EmbeddingGenerator`].
#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub batch_size: usize,
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each further attempt.
    pub retry_backoff: Duration,
    pub timeout: Duration,
    pub cache_capacity: usize,
    pub normalize: bool,
    /// Batches in flight at once.
    pub concurrency: usize,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self::from_config(&EmbeddingConfig::default())
    }
}

impl GeneratorOptions {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs),
            cache_capacity: config.cache_capacity,
            normalize: config.normalize,
            concurrency: 4,
        }
    }
}

pub struct EmbeddingGenerator {
    backend: Arc<dyn EmbeddingBackend>,
    cache: EmbeddingCache,
    options: GeneratorOptions,
}

impl EmbeddingGenerator {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, options: GeneratorOptions) -> Self {
        Self {
            cache: EmbeddingCache::new(options.cache_capacity),
            backend,
            options,
        }
    }

    /// Build the configured backend and wrap it.
    pub fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let backend = create_backend(config)?;
        Ok(Self::new(backend, GeneratorOptions::from_config(config)))
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    pub fn dims(&self) -> usize {
        self.backend.dims()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Embed one text (e.g. a search query).
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut results = self.embed_batch(&[text.to_string()]).await;
        results
            .pop()
            .unwrap_or_else(|| Err(EmbeddingError::InvalidResponse("empty result".into())))
    }

    /// One uncached round trip to the backend, with the usual timeout,
    /// retries and dimension check.
    pub async fn check_backend(&self) -> Result<(), EmbeddingError> {
        let mut vectors = self.call_with_retry(&["health check".to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty result".into()))?;
        self.finish_vector(vector).map(|_| ())
    }

    /// Embed many texts. The output has one entry per input, in input
    /// order.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>, EmbeddingError>> {
        let model_id = self.backend.model_id().to_string();
        let mut results: Vec<Option<Result<Vec<f32>, EmbeddingError>>> = vec![None; texts.len()];
        let mut misses: Vec<(usize, String)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = EmbeddingCache::key(text);
            match self.cache.get(&model_id, &key) {
                Some(v) => results[i] = Some(Ok(v)),
                None => misses.push((i, key)),
            }
        }

        if !misses.is_empty() {
            let batches: Vec<Vec<(usize, String)>> = misses
                .chunks(self.options.batch_size)
                .map(|c| c.to_vec())
                .collect();

            let mut completed = stream::iter(batches)
                .map(|batch| async move {
                    let inputs: Vec<String> =
                        batch.iter().map(|(i, _)| texts[*i].clone()).collect();
                    let outcome = self.call_with_retry(&inputs).await;
                    (batch, outcome)
                })
                .buffer_unordered(self.options.concurrency.max(1));

            while let Some((batch, outcome)) = completed.next().await {
                match outcome {
                    Ok(vectors) => {
                        for ((i, key), vector) in batch.into_iter().zip(vectors) {
                            let checked = self.finish_vector(vector);
                            if let Ok(v) = &checked {
                                self.cache.put(&model_id, key, v.clone());
                            }
                            results[i] = Some(checked);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(batch = batch.len(), error = %e, "embedding batch failed");
                        for (i, _) in batch {
                            results[i] = Some(Err(e.clone()));
                        }
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| Err(EmbeddingError::InvalidResponse("missing result".into())))
            })
            .collect()
    }

    fn finish_vector(&self, mut vector: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
        let expected = self.backend.dims();
        if vector.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        if self.options.normalize {
            normalize(&mut vector);
        }
        Ok(vector)
    }

    /// One backend call with timeout, retried with exponential backoff.
    ///
    /// Backoff: `retry_backoff × 2^(attempt-1)`, exponent capped at 5.
    async fn call_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut last_err = EmbeddingError::Unavailable("no attempt made".into());

        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                let delay = self.options.retry_backoff * (1u32 << (attempt - 1).min(5));
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying embedding call");
                tokio::time::sleep(delay).await;
            }

            match tokio::time::timeout(self.options.timeout, self.backend.embed(texts)).await {
                Ok(Ok(vectors)) if vectors.len() == texts.len() => return Ok(vectors),
                Ok(Ok(vectors)) => {
                    return Err(EmbeddingError::InvalidResponse(format!(
                        "expected {} vectors, got {}",
                        texts.len(),
                        vectors.len()
                    )))
                }
                Ok(Err(e)) if e.is_retryable() => last_err = e,
                Ok(Err(e)) => return Err(e),
                Err(_) => last_err = EmbeddingError::Timeout(self.options.timeout),
            }
        }

        Err(last_err)
    }
}

/// Scale to unit length in place. Zero vectors are left unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use rag_index::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-length vector.
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
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that records calls and can fail or stall on demand.
    struct ScriptedBackend {
        dims: usize,
        calls: AtomicUsize,
        fail_first: usize,
        error: EmbeddingError,
        stall: Option<Duration>,
    }

    impl ScriptedBackend {
        fn ok(dims: usize) -> Self {
            Self {
                dims,
                calls: AtomicUsize::new(0),
                fail_first: 0,
                error: EmbeddingError::Unavailable("down".into()),
                stall: None,
            }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for ScriptedBackend {
        fn model_id(&self) -> &str {
            "scripted"
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.stall {
                tokio::time::sleep(d).await;
            }
            if n < self.fail_first {
                return Err(self.error.clone());
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dims];
                    v[0] = t.len() as f32;
                    v[self.dims - 1] = 1.0;
                    v
                })
                .collect())
        }
    }

    fn options() -> GeneratorOptions {
        GeneratorOptions {
            batch_size: 2,
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
            cache_capacity: 16,
            normalize: false,
            concurrency: 3,
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let gen = EmbeddingGenerator::new(Arc::new(ScriptedBackend::ok(3)), options());
        let input = texts(&["a", "bbbb", "cc", "ddddddd", "eee"]);
        let out = gen.embed_batch(&input).await;
        let firsts: Vec<f32> = out.iter().map(|r| r.as_ref().unwrap()[0]).collect();
        assert_eq!(firsts, vec![1.0, 4.0, 2.0, 7.0, 3.0]);
    }

    #[tokio::test]
    async fn cache_avoids_backend_calls() {
        let backend = Arc::new(ScriptedBackend::ok(3));
        let gen = EmbeddingGenerator::new(backend.clone(), options());
        gen.embed_batch(&texts(&["x", "y"])).await;
        let before = backend.calls.load(Ordering::SeqCst);
        let out = gen.embed_batch(&texts(&["y", "x"])).await;
        assert!(out.iter().all(|r| r.is_ok()));
        assert_eq!(backend.calls.load(Ordering::SeqCst), before);
        assert_eq!(gen.cache_stats().hits, 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = Arc::new(ScriptedBackend {
            fail_first: 2,
            ..ScriptedBackend::ok(3)
        });
        let gen = EmbeddingGenerator::new(backend.clone(), options());
        let v = gen.embed("hello").await.unwrap();
        assert_eq!(v[0], 5.0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_requests_fail_per_item_without_retry() {
        let backend = Arc::new(ScriptedBackend {
            fail_first: usize::MAX,
            error: EmbeddingError::Rejected("401".into()),
            ..ScriptedBackend::ok(3)
        });
        let gen = EmbeddingGenerator::new(backend.clone(), options());
        let out = gen.embed_batch(&texts(&["a", "b", "c"])).await;
        assert_eq!(out.len(), 3);
        assert!(out
            .iter()
            .all(|r| matches!(r, Err(EmbeddingError::Rejected(_)))));
        // two batches, one call each
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let backend = Arc::new(ScriptedBackend {
            stall: Some(Duration::from_millis(500)),
            ..ScriptedBackend::ok(3)
        });
        let gen = EmbeddingGenerator::new(
            backend,
            GeneratorOptions {
                timeout: Duration::from_millis(20),
                max_retries: 1,
                ..options()
            },
        );
        let err = gen.embed("slow").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Timeout(_)));
    }

    #[tokio::test]
    async fn dimension_mismatch_is_reported() {
        struct Short;
        #[async_trait]
        impl EmbeddingBackend for Short {
            fn model_id(&self) -> &str {
                "short"
            }
            fn dims(&self) -> usize {
                4
            }
            async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
                Ok(texts.iter().map(|_| vec![1.0, 2.0]).collect())
            }
        }
        let gen = EmbeddingGenerator::new(Arc::new(Short), options());
        let err = gen.embed("x").await.unwrap_err();
        assert_eq!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 2
            }
        );
    }

    #[tokio::test]
    async fn vectors_are_unit_length_when_normalizing() {
        let gen = EmbeddingGenerator::new(
            Arc::new(HashBackend::new(32)),
            GeneratorOptions {
                normalize: true,
                ..options()
            },
        );
        let v = gen.embed("normalize me please").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
