use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_openai::types::CreateEmbeddingRequestArgs;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::debug;

use crate::{
    error::AppError,
    utils::config::{AppConfig, EmbeddingBackendKind},
};

/// How many transport retries an embedding call gets before the caller has
/// to decide whether to proceed without a vector.
const MAX_RETRIES: usize = 2;

#[allow(clippy::missing_docs_in_private_items)]
enum Backend {
    OpenAi {
        client: async_openai::Client<async_openai::config::OpenAIConfig>,
        model: String,
    },
    /// Deterministic feature-hashed vectors. No network, stable across runs.
    Hashed,
}

/// Async text -> unit vector client with bounded concurrency and an LRU
/// cache keyed by the SHA-256 of the normalized text.
pub struct EmbeddingClient {
    backend: Backend,
    dimension: usize,
    batch_size: usize,
    request_timeout: Duration,
    /// Minimum gap between upstream requests, derived from the RPM cap.
    min_request_gap: Option<Duration>,
    last_request: Mutex<Option<Instant>>,
    permits: Semaphore,
    cache: Mutex<LruCache<String, Arc<Vec<f32>>>>,
}

impl EmbeddingClient {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let backend = match config.embedding_backend {
            EmbeddingBackendKind::Openai => {
                let client = async_openai::Client::with_config(
                    async_openai::config::OpenAIConfig::new()
                        .with_api_key(&config.openai_api_key)
                        .with_api_base(&config.openai_base_url),
                );
                Backend::OpenAi {
                    client,
                    model: "text-embedding-3-large".to_string(),
                }
            }
            EmbeddingBackendKind::Hashed => Backend::Hashed,
        };

        Self::new(
            backend,
            config.embedding_dimensions,
            config.embedding_max_concurrency,
            config.embedding_batch_size,
            config.embedding_cache_capacity,
            config.embedding_rpm,
            Duration::from_secs(config.embed_timeout_secs),
        )
    }

    fn new(
        backend: Backend,
        dimension: usize,
        max_concurrency: usize,
        batch_size: usize,
        cache_capacity: usize,
        rpm: Option<u32>,
        request_timeout: Duration,
    ) -> Result<Self, AppError> {
        let capacity = NonZeroUsize::new(cache_capacity.max(1))
            .ok_or_else(|| AppError::Validation("embedding cache capacity must be > 0".into()))?;
        Ok(Self {
            backend,
            dimension,
            batch_size: batch_size.max(1),
            request_timeout,
            min_request_gap: rpm
                .filter(|rpm| *rpm > 0)
                .map(|rpm| Duration::from_secs_f64(60.0 / f64::from(rpm))),
            last_request: Mutex::new(None),
            permits: Semaphore::new(max_concurrency.max(1)),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Deterministic test/offline client.
    pub fn hashed(dimension: usize) -> Result<Self, AppError> {
        Self::new(
            Backend::Hashed,
            dimension,
            8,
            32,
            1024,
            None,
            Duration::from_secs(30),
        )
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed one text. Retries transport failures, asserts the dimension and
    /// L2-normalizes before returning. Identical text always yields the
    /// identical cached vector.
    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let key = cache_key(input);
        if let Some(hit) = self.cache_get(&key) {
            return Ok(hit.as_ref().clone());
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AppError::Internal("embedding semaphore closed".into()))?;

        let vector = self.embed_uncached(input).await?;
        self.cache_put(key, Arc::new(vector.clone()));
        Ok(vector)
    }

    /// Embed many texts, preserving order. Cache hits are skipped; misses go
    /// out in capped batches.
    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; inputs.len()];
        let mut misses: Vec<(usize, String)> = Vec::new();

        for (i, input) in inputs.iter().enumerate() {
            let key = cache_key(input);
            if let Some(hit) = self.cache_get(&key) {
                results[i] = Some(hit.as_ref().clone());
            } else {
                misses.push((i, input.clone()));
            }
        }

        debug!(
            total = inputs.len(),
            misses = misses.len(),
            "embedding batch"
        );

        for chunk in misses.chunks(self.batch_size) {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| AppError::Internal("embedding semaphore closed".into()))?;

            let texts: Vec<String> = chunk.iter().map(|(_, text)| text.clone()).collect();
            let vectors = self.embed_chunk(&texts).await?;
            for ((index, text), vector) in chunk.iter().zip(vectors) {
                self.cache_put(cache_key(text), Arc::new(vector.clone()));
                results[*index] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|slot| slot.ok_or_else(|| AppError::Embedding("missing batch slot".into())))
            .collect()
    }

    async fn embed_uncached(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let texts = [input.to_string()];
        let vectors = self.embed_chunk(&texts).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Embedding("no embedding data received".into()))
    }

    /// Honor the configured RPM cap by spacing upstream requests.
    async fn throttle(&self) {
        let Some(gap) = self.min_request_gap else {
            return;
        };
        let wait = match self.last_request.lock() {
            Ok(mut last) => {
                let now = Instant::now();
                let ready_at = last.map_or(now, |at| (at + gap).max(now));
                *last = Some(ready_at);
                ready_at.saturating_duration_since(now)
            }
            Err(_) => Duration::ZERO,
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let raw = match &self.backend {
            Backend::Hashed => texts.iter().map(|text| self.hash_embed(text)).collect(),
            Backend::OpenAi { client, model } => {
                self.throttle().await;
                let normalized: Vec<String> =
                    texts.iter().map(|text| normalize_text(text)).collect();
                let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(MAX_RETRIES);
                Retry::spawn(strategy, || async {
                    let request = CreateEmbeddingRequestArgs::default()
                        .model(model)
                        .dimensions(self.dimension as u32)
                        .input(normalized.clone())
                        .build()
                        .map_err(AppError::OpenAI)?;

                    let response = tokio::time::timeout(
                        self.request_timeout,
                        client.embeddings().create(request),
                    )
                    .await
                    .map_err(|_| AppError::Upstream("embedding request timed out".into()))?
                    .map_err(|e| AppError::Upstream(format!("embedding request failed: {e}")))?;

                    let mut data = response.data;
                    data.sort_by_key(|d| d.index);
                    Ok::<_, AppError>(data.into_iter().map(|d| d.embedding).collect::<Vec<_>>())
                })
                .await?
            }
        };

        raw.into_iter()
            .map(|vector| {
                if vector.len() != self.dimension {
                    return Err(AppError::Embedding(format!(
                        "embedding dimension {} does not match configured {}",
                        vector.len(),
                        self.dimension
                    )));
                }
                Ok(l2_normalize(vector))
            })
            .collect()
    }

    /// Token-bucket feature hashing. Stable, cheap, and orthogonal enough for
    /// tests and offline operation.
    fn hash_embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in normalize_text(text).split_whitespace() {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();
            let bucket = usize::from(digest[0]) << 8 | usize::from(digest[1]);
            vector[bucket % self.dimension] += 1.0;
        }
        vector
    }

    fn cache_get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        self.cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(key).cloned())
    }

    fn cache_put(&self, key: String, value: Arc<Vec<f32>>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, value);
        }
    }
}

fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cache_key(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(input).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Scale a vector to unit length. Zero vectors pass through untouched.
pub fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// Cosine similarity of two same-length vectors; 0.0 when either is empty
/// or degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_embeddings_are_deterministic_and_normalized() {
        let client = EmbeddingClient::hashed(16).expect("client");

        let a = client.embed("tokio runtime scheduling").await.expect("embed");
        let b = client.embed("tokio   runtime scheduling").await.expect("embed");
        assert_eq!(a, b, "normalization must collapse whitespace");

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "expected unit vector, norm = {norm}");
    }

    #[tokio::test]
    async fn different_texts_produce_different_vectors() {
        let client = EmbeddingClient::hashed(32).expect("client");
        let a = client.embed("vitamins and nutrition").await.expect("embed");
        let b = client.embed("quarterly revenue report").await.expect("embed");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn batch_preserves_order_and_uses_cache() {
        let client = EmbeddingClient::hashed(16).expect("client");

        let single = client.embed("alpha").await.expect("embed");
        let batch = client
            .embed_batch(&["alpha".to_string(), "beta".to_string(), "gamma".to_string()])
            .await
            .expect("batch");

        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], single, "cached entry must be identical");
        assert_ne!(batch[1], batch[2]);
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
