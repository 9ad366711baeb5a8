use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::EmbeddingError;
use crate::provider::LlmClient;
use crate::tokens::truncate_tokens;

/// Token limit of the embedding model; longer input is truncated, never
/// rejected.
const EMBED_TOKEN_LIMIT: usize = 8191;
/// Retry attempts for transient failures.
const RETRY_ATTEMPTS: usize = 3;
/// Base delay for exponential backoff between retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

struct CacheEntry {
    vector: Vec<f32>,
    stored_at: Instant,
}

/// Embedding front-end: token-level truncation, LRU+TTL memoization keyed by
/// `(model, text)`, and retry-with-backoff for transient provider failures.
pub struct Embedder {
    client: Arc<dyn LlmClient>,
    model: String,
    dim: usize,
    cache_size: usize,
    cache_ttl: Duration,
    cache: Mutex<HashMap<(String, String), CacheEntry>>,
}

impl Embedder {
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: impl Into<String>,
        dim: usize,
        cache_size: usize,
        cache_ttl_s: u64,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            dim,
            cache_size,
            cache_ttl: Duration::from_secs(cache_ttl_s),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Embed a text. Input must be non-empty; overlong input is truncated by
    /// tokens before the call so results stay deterministic.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::permanent(
                &self.model,
                text.len(),
                "cannot embed empty text",
            ));
        }

        let text = truncate_tokens(text, EMBED_TOKEN_LIMIT);

        if let Some(vector) = self.get_cached(&text) {
            return Ok(vector);
        }

        let mut last_err = None;
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * (1u32 << (attempt - 1))).await;
            }
            match self.client.embed(&text, &self.model).await {
                Ok(vector) => {
                    if vector.len() != self.dim {
                        return Err(EmbeddingError::permanent(
                            &self.model,
                            text.len(),
                            format!("expected {} dimensions, got {}", self.dim, vector.len()),
                        ));
                    }
                    self.insert_cached(&text, &vector);
                    return Ok(vector);
                }
                Err(e) if e.is_transient() => {
                    debug!(attempt, model = %self.model, "transient embedding failure, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.expect("at least one attempt ran"))
    }

    fn get_cached(&self, text: &str) -> Option<Vec<f32>> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(&(self.model.clone(), text.to_string()))?;
        if entry.stored_at.elapsed() < self.cache_ttl {
            Some(entry.vector.clone())
        } else {
            None
        }
    }

    fn insert_cached(&self, text: &str, vector: &[f32]) {
        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= self.cache_size {
            // Evict the oldest entry.
            let oldest_key = cache
                .iter()
                .min_by_key(|(_, v)| v.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest_key {
                cache.remove(&k);
            }
        }
        cache.insert(
            (self.model.clone(), text.to_string()),
            CacheEntry {
                vector: vector.to_vec(),
                stored_at: Instant::now(),
            },
        );
    }
}

/// Cosine similarity of two equal-length vectors, in [-1, 1].
/// Returns 0.0 when either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::provider::{ChatRequest, ChatResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic fake: embeds by character statistics, counts calls.
    struct CountingClient {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl CountingClient {
        fn new(fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl LlmClient for CountingClient {
        fn name(&self) -> &str {
            "counting"
        }

        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, LlmError> {
            unimplemented!("not used in embed tests")
        }

        async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, EmbeddingError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(EmbeddingError::transient(model, text.len(), "flaky"));
            }
            let mut v = vec![0.0_f32; 4];
            for (i, b) in text.bytes().enumerate() {
                v[i % 4] += b as f32;
            }
            Ok(v)
        }
    }

    fn embedder(client: Arc<CountingClient>) -> Embedder {
        Embedder::new(client, "fake-embed", 4, 2, 300)
    }

    #[tokio::test]
    async fn caches_repeated_embeds() {
        let client = Arc::new(CountingClient::new(0));
        let embedder = embedder(client.clone());

        let a = embedder.embed("hello").await.expect("embed");
        let b = embedder.embed("hello").await.expect("embed");
        assert_eq!(a, b);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1, "second call cached");
    }

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let client = Arc::new(CountingClient::new(0));
        let embedder = embedder(client.clone());

        embedder.embed("one").await.expect("embed");
        embedder.embed("two").await.expect("embed");
        embedder.embed("three").await.expect("embed"); // evicts "one"
        embedder.embed("one").await.expect("embed"); // miss again

        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let client = Arc::new(CountingClient::new(2));
        let embedder = embedder(client.clone());

        let v = embedder.embed("hello").await.expect("eventually succeeds");
        assert_eq!(v.len(), 4);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_text_is_permanent_error() {
        let client = Arc::new(CountingClient::new(0));
        let embedder = embedder(client.clone());

        let err = embedder.embed("   ").await.expect_err("empty input");
        assert!(!err.is_transient());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0, "no API call made");
    }

    #[test]
    fn cosine_similarity_basics() {
        let v = [1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
