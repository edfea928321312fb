//! Caching, retrying, concurrency-bounded embedding client.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use super::{EmbeddingError, EmbeddingProvider, EmbeddingVector, TransientKind};
use crate::config::EmbeddingConfig;
use crate::retry::{Backoff, RetryDecision, RetryPolicy};

/// Bounded insertion-ordered cache. Oldest keys are evicted first.
struct EmbeddingCache {
    map: HashMap<String, EmbeddingVector>,
    order: VecDeque<String>,
    capacity: usize,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, key: &str) -> Option<EmbeddingVector> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: &str, vector: EmbeddingVector) {
        if self.capacity == 0 {
            return;
        }
        if self.map.insert(key.to_string(), vector).is_none() {
            self.order.push_back(key.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
            }
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Counters exposed on the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbeddingStats {
    pub provider_calls: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub failures: u64,
    pub cached_vectors: usize,
    pub available_permits: usize,
}

#[derive(Default)]
struct Counters {
    provider_calls: AtomicU64,
    cache_hits: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

/// Wraps an [`EmbeddingProvider`] with a per-key cache, bounded retries, and
/// a concurrent-call budget. Callers beyond the budget wait for a permit.
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    gate: Semaphore,
    cache: Mutex<EmbeddingCache>,
    retry: RetryPolicy,
    request_timeout: Duration,
    dimension: usize,
    counters: Counters,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            gate: Semaphore::new(config.max_concurrent_calls.max(1)),
            cache: Mutex::new(EmbeddingCache::new(config.cache_capacity)),
            retry: config.retry,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            dimension: config.dimension,
            counters: Counters::default(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Embed `text`, caching the result under `key` (an entry id for log
    /// records, a text hash for queries).
    pub async fn embed(&self, key: &str, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        if let Some(hit) = self.cache.lock().await.get(key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "embedding cache hit");
            return Ok(hit);
        }

        let vector = {
            // The gate is the pipeline's backpressure point.
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| EmbeddingError::Unavailable {
                    attempts: 0,
                    last_error: "embedding gate closed".to_string(),
                })?;
            self.call_with_retry(text).await?
        };

        self.cache.lock().await.insert(key, vector.clone());
        Ok(vector)
    }

    async fn call_with_retry(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        let mut backoff = Backoff::new(self.retry);
        loop {
            let err = match self.call_once(text).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            match backoff.on_failure(err.is_transient()) {
                RetryDecision::RetryAfter(delay) => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        provider = self.provider.name(),
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying embedding call"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        provider = self.provider.name(),
                        attempts = backoff.attempts(),
                        error = %err,
                        "embedding call failed"
                    );
                    return Err(if err.is_transient() {
                        EmbeddingError::Unavailable {
                            attempts: backoff.attempts(),
                            last_error: err.to_string(),
                        }
                    } else {
                        err
                    });
                }
            }
        }
    }

    async fn call_once(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        self.counters.provider_calls.fetch_add(1, Ordering::Relaxed);
        let values = tokio::time::timeout(self.request_timeout, self.provider.embed(text))
            .await
            .map_err(|_| {
                EmbeddingError::transient(
                    TransientKind::Timeout,
                    format!("no response within {}ms", self.request_timeout.as_millis()),
                )
            })??;

        if values.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: values.len(),
            });
        }
        Ok(EmbeddingVector::new(values))
    }

    pub async fn stats(&self) -> EmbeddingStats {
        EmbeddingStats {
            provider_calls: self.counters.provider_calls.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            cached_vectors: self.cache.lock().await.len(),
            available_permits: self.gate.available_permits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Fails with the scripted errors first, then returns a constant vector.
    struct ScriptedProvider {
        failures: std::sync::Mutex<VecDeque<EmbeddingError>>,
        calls: AtomicUsize,
        dimension: usize,
    }

    impl ScriptedProvider {
        fn new(dimension: usize, failures: Vec<EmbeddingError>) -> Self {
            Self {
                failures: std::sync::Mutex::new(failures.into()),
                calls: AtomicUsize::new(0),
                dimension,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(vec![1.0; self.dimension])
        }

        async fn summarize(&self, text: &str) -> Result<String, EmbeddingError> {
            Ok(text.to_string())
        }
    }

    fn config(dimension: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dimension,
            ..EmbeddingConfig::default()
        }
    }

    fn rate_limited() -> EmbeddingError {
        EmbeddingError::transient(TransientKind::RateLimited, "429")
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(ScriptedProvider::new(4, vec![rate_limited(), rate_limited()]));
        let client = EmbeddingClient::new(provider.clone(), &config(4));

        let v = client.embed("e1", "hello").await.unwrap();
        assert_eq!(v.dimension(), 4);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.stats().await.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_unavailable() {
        let provider = Arc::new(ScriptedProvider::new(
            4,
            vec![rate_limited(), rate_limited(), rate_limited(), rate_limited()],
        ));
        let client = EmbeddingClient::new(provider.clone(), &config(4));

        let err = client.embed("e1", "hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Unavailable { attempts: 3, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_input_fails_immediately() {
        let provider = Arc::new(ScriptedProvider::new(
            4,
            vec![EmbeddingError::InvalidInput("too long".into())],
        ));
        let client = EmbeddingClient::new(provider.clone(), &config(4));

        let err = client.embed("e1", "hello").await.unwrap_err();
        assert_eq!(err, EmbeddingError::InvalidInput("too long".into()));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_avoids_duplicate_calls() {
        let provider = Arc::new(ScriptedProvider::new(4, vec![]));
        let client = EmbeddingClient::new(provider.clone(), &config(4));

        client.embed("e1", "hello").await.unwrap();
        client.embed("e1", "hello").await.unwrap();
        client.embed("e2", "hello").await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.stats().await.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected() {
        let provider = Arc::new(ScriptedProvider::new(3, vec![]));
        let client = EmbeddingClient::new(provider, &config(4));

        let err = client.embed("e1", "hello").await.unwrap_err();
        assert_eq!(err, EmbeddingError::DimensionMismatch { expected: 4, actual: 3 });
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let mut cache = EmbeddingCache::new(2);
        cache.insert("a", EmbeddingVector::new(vec![1.0]));
        cache.insert("b", EmbeddingVector::new(vec![2.0]));
        cache.insert("a", EmbeddingVector::new(vec![3.0]));
        cache.insert("c", EmbeddingVector::new(vec![4.0]));

        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").unwrap().as_slice(), &[2.0]);
        assert_eq!(cache.get("c").unwrap().as_slice(), &[4.0]);
        assert_eq!(cache.len(), 2);
    }

    /// Sleeps while tracking how many calls overlap.
    struct SlowProvider {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![0.0; 2])
        }

        async fn summarize(&self, text: &str) -> Result<String, EmbeddingError> {
            Ok(text.to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_budget_is_enforced() {
        let provider = Arc::new(SlowProvider {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let cfg = EmbeddingConfig {
            dimension: 2,
            max_concurrent_calls: 2,
            ..EmbeddingConfig::default()
        };
        let client = Arc::new(EmbeddingClient::new(provider.clone(), &cfg));

        let calls = (0..6).map(|i| {
            let client = client.clone();
            async move { client.embed(&format!("k{i}"), "text").await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(provider.peak.load(Ordering::SeqCst), 2);
    }
}
