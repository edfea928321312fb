//! End-to-end ingestion tests: queue -> normalize -> store -> score ->
//! alert -> embed -> index -> ack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use loginsight::alert::{AlertCategory, AlertIntent, Dispatcher};
use loginsight::config::{EmbeddingConfig, EmbeddingFailureMode, IngestConfig, ScorerConfig};
use loginsight::embedding::providers::HashingEmbeddingProvider;
use loginsight::embedding::{EmbeddingClient, EmbeddingError, EmbeddingProvider};
use loginsight::index::{Metric, SearchFilter, VectorIndex};
use loginsight::normalize::{EntryId, NormalizedLogEntry};
use loginsight::pipeline::{HealthState, Pipeline, PipelineError, PipelineParts, RecordOutcome, RecordState};
use loginsight::queue::{LogQueue, MemoryQueue, QueueError};
use loginsight::retry::RetryPolicy;
use loginsight::scorer::{AnomalyScorer, FeatureSource};
use loginsight::storage::{
    self, LevelCount, LogFilter, LogStore, PutOutcome, SqliteLogStore, StoreError, TimelineBucket,
};

const DIM: usize = 64;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// In-memory store that can be switched into a failing state.
#[derive(Default)]
struct FlakyStore {
    entries: Mutex<HashMap<EntryId, NormalizedLogEntry>>,
    failing: AtomicBool,
}

#[async_trait]
impl LogStore for FlakyStore {
    async fn put(&self, entry: &NormalizedLogEntry) -> Result<PutOutcome, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Task("disk unavailable".into()));
        }
        let mut entries = self.entries.lock().unwrap();
        Ok(match entries.insert(entry.id.clone(), entry.clone()) {
            None => PutOutcome::Inserted,
            Some(old) if old == *entry => PutOutcome::Unchanged,
            Some(_) => PutOutcome::Updated,
        })
    }

    async fn get(&self, id: &EntryId) -> Result<Option<NormalizedLogEntry>, StoreError> {
        Ok(self.entries.lock().unwrap().get(id).cloned())
    }

    async fn query(&self, _filter: &LogFilter) -> Result<Vec<NormalizedLogEntry>, StoreError> {
        Ok(self.entries.lock().unwrap().values().cloned().collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.entries.lock().unwrap().len() as u64)
    }

    async fn level_counts(&self) -> Result<Vec<LevelCount>, StoreError> {
        Ok(Vec::new())
    }

    async fn error_timeline(
        &self,
        _since: Option<DateTime<Utc>>,
        _interval_minutes: u32,
    ) -> Result<Vec<TimelineBucket>, StoreError> {
        Ok(Vec::new())
    }
}

/// Provider that rejects every input.
struct RejectingProvider;

#[async_trait]
impl EmbeddingProvider for RejectingProvider {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::InvalidInput("model refused input".into()))
    }

    async fn summarize(&self, _text: &str) -> Result<String, EmbeddingError> {
        Err(EmbeddingError::InvalidInput("model refused input".into()))
    }
}

/// Hashing provider with an outage switch.
struct SwitchableProvider {
    inner: HashingEmbeddingProvider,
    down: AtomicBool,
}

#[async_trait]
impl EmbeddingProvider for SwitchableProvider {
    fn name(&self) -> &str {
        "switchable"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(EmbeddingError::InvalidInput("provider offline".into()));
        }
        self.inner.embed_sync(text)
    }

    async fn summarize(&self, text: &str) -> Result<String, EmbeddingError> {
        Ok(text.to_string())
    }
}

/// Panics on the first embed call, then behaves like the hashing provider.
struct PanicOnceProvider {
    inner: HashingEmbeddingProvider,
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for PanicOnceProvider {
    fn name(&self) -> &str {
        "panic-once"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("provider crashed");
        }
        self.inner.embed_sync(text)
    }

    async fn summarize(&self, text: &str) -> Result<String, EmbeddingError> {
        Ok(text.to_string())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    queue: Arc<MemoryQueue>,
    store: Arc<dyn LogStore>,
    index: Arc<VectorIndex>,
    pipeline: Arc<Pipeline>,
    alerts: mpsc::Receiver<AlertIntent>,
    _dir: Option<TempDir>,
}

struct Setup {
    provider: Arc<dyn EmbeddingProvider>,
    store: Option<Arc<dyn LogStore>>,
    mode: EmbeddingFailureMode,
    visibility_timeout: Duration,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            provider: Arc::new(HashingEmbeddingProvider::new(DIM)),
            store: None,
            mode: EmbeddingFailureMode::Degrade,
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

fn harness(setup: Setup) -> Harness {
    let (store, dir): (Arc<dyn LogStore>, Option<TempDir>) = match setup.store {
        Some(store) => (store, None),
        None => {
            let dir = tempfile::tempdir().unwrap();
            let pool = storage::open_pool(&dir.path().join("li.db"), 4).unwrap();
            (Arc::new(SqliteLogStore::new(pool)), Some(dir))
        }
    };

    let queue = Arc::new(MemoryQueue::new(128, 5, setup.visibility_timeout));
    let index = Arc::new(VectorIndex::new(DIM, Metric::Cosine));
    let embedding = EmbeddingConfig {
        dimension: DIM,
        retry: RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        },
        ..EmbeddingConfig::default()
    };
    let scorer = ScorerConfig {
        feature: FeatureSource::Field {
            name: "latency_ms".into(),
        },
        ..ScorerConfig::default()
    };
    let (dispatcher, alerts) = Dispatcher::new(600, 16);
    let ingest = IngestConfig {
        on_embedding_failure: setup.mode,
        systemic_backoff: RetryPolicy {
            max_attempts: u32::MAX,
            base_delay_ms: 20,
            multiplier: 2,
            max_delay_ms: 200,
        },
        ..IngestConfig::default()
    };

    let parts = PipelineParts {
        queue: queue.clone(),
        store: store.clone(),
        scorer: Arc::new(AnomalyScorer::new(scorer)),
        embedder: Arc::new(EmbeddingClient::new(setup.provider, &embedding)),
        index: index.clone(),
        dispatcher: Arc::new(dispatcher),
        vector_pool: None,
    };

    Harness {
        queue,
        store,
        index,
        pipeline: Arc::new(Pipeline::new(ingest, parts)),
        alerts,
        _dir: dir,
    }
}

fn checkout_line(n: u32, latency: u64) -> Vec<u8> {
    format!(
        r#"{{"service":"checkout","level":"INFO","message":"checkout request {n} served","timestamp":"2024-05-01T10:00:{n:02}Z","latency_ms":{latency}}}"#
    )
    .into_bytes()
}

impl Harness {
    async fn push(&self, payload: Vec<u8>) {
        self.queue.enqueue("test", payload).await.unwrap();
    }

    async fn process_next(&self) -> Result<RecordOutcome, PipelineError> {
        let record = self.queue.receive().await.unwrap().expect("queue has a record");
        self.pipeline.process(record, &CancellationToken::new()).await
    }

    fn drain_alerts(&mut self) -> Vec<AlertIntent> {
        let mut out = Vec::new();
        while let Ok(intent) = self.alerts.try_recv() {
            out.push(intent);
        }
        out
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_latency_spike_alerts_once_per_cooldown() {
    let mut h = harness(Setup::default());
    let latencies = [5, 5, 5, 5, 5, 50, 500, 5_000, 50_000, 500_000];
    for (i, latency) in latencies.iter().enumerate() {
        h.push(checkout_line(i as u32 + 1, *latency)).await;
    }

    let mut outcomes = Vec::new();
    for _ in 0..latencies.len() {
        outcomes.push(h.process_next().await.unwrap());
    }

    for outcome in &outcomes[..5] {
        assert!(matches!(outcome, RecordOutcome::Indexed { alerted: false, .. }));
    }
    assert!(matches!(outcomes[5], RecordOutcome::Indexed { alerted: true, .. }));
    for outcome in &outcomes[6..] {
        assert!(matches!(outcome, RecordOutcome::Indexed { alerted: false, .. }));
    }

    let alerts = h.drain_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].service, "checkout");
    assert_eq!(alerts[0].category, AlertCategory::Statistical);
    assert_eq!(Some(&alerts[0].entry_id), outcomes[5].entry_id());

    let dispatch = h.pipeline.parts().dispatcher.stats();
    assert_eq!(dispatch.emitted, 1);
    assert_eq!(dispatch.suppressed, 4);

    assert_eq!(h.index.len(), 10);
    assert_eq!(h.store.count().await.unwrap(), 10);
    let stats = h.pipeline.stats().snapshot();
    assert_eq!(stats.acknowledged, 10);
    assert_eq!(stats.alert_candidates, 5);
}

#[tokio::test]
async fn test_stable_spike_scenario_emits_single_alert() {
    let mut h = harness(Setup::default());
    // E1..E5 baseline, E6 spike, E7..E10 stay high inside the cool-down.
    let latencies = [5, 5, 5, 5, 5, 50, 48, 52, 50, 49];
    for (i, latency) in latencies.iter().enumerate() {
        h.push(checkout_line(i as u32 + 1, *latency)).await;
    }

    for _ in 0..5 {
        let outcome = h.process_next().await.unwrap();
        assert!(matches!(outcome, RecordOutcome::Indexed { alerted: false, .. }));
    }
    assert!(h.drain_alerts().is_empty());

    let spike = h.process_next().await.unwrap();
    assert!(matches!(spike, RecordOutcome::Indexed { alerted: true, .. }));
    let alerts = h.drain_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].category, AlertCategory::Statistical);
    assert_eq!(Some(&alerts[0].entry_id), spike.entry_id());

    for _ in 0..4 {
        let outcome = h.process_next().await.unwrap();
        assert!(matches!(outcome, RecordOutcome::Indexed { alerted: false, .. }));
    }
    assert!(h.drain_alerts().is_empty());

    let dispatch = h.pipeline.parts().dispatcher.stats();
    assert_eq!(dispatch.emitted, 1);
    assert_eq!(h.pipeline.stats().snapshot().alert_candidates, 1 + dispatch.suppressed);
}

#[tokio::test]
async fn test_malformed_record_is_dead_lettered_once() {
    let h = harness(Setup::default());
    h.push(b"hello world".to_vec()).await;

    let record = h.queue.receive().await.unwrap().unwrap();
    let token = record.token.clone();
    let outcome = h.pipeline.process(record, &CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, RecordOutcome::DeadLettered { .. }));
    assert_eq!(outcome.final_state(), RecordState::DeadLettered);

    let letters = h.queue.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].payload, "hello world");
    assert!(letters[0].reason.contains("malformed"));

    // Settled: the token is gone and nothing is pending.
    assert!(matches!(h.queue.ack(&token).await, Err(QueueError::UnknownToken(_))));
    let depth = h.queue.depth().await.unwrap();
    assert_eq!((depth.ready, depth.in_flight, depth.dead_lettered), (0, 0, 1));
    assert!(h.index.is_empty());
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_redelivered_record_is_idempotent() {
    let mut h = harness(Setup::default());
    let payload = br#"{"service":"cart","level":"ERROR","message":"payment declined","timestamp":"2024-05-01T10:00:00Z"}"#;
    h.push(payload.to_vec()).await;
    h.push(payload.to_vec()).await;

    let first = h.process_next().await.unwrap();
    assert!(matches!(first, RecordOutcome::Indexed { alerted: true, .. }));
    let second = h.process_next().await.unwrap();
    assert!(matches!(second, RecordOutcome::Duplicate { .. }));
    assert_eq!(first.entry_id(), second.entry_id());

    assert_eq!(h.drain_alerts().len(), 1);
    assert_eq!(h.index.len(), 1);
    assert_eq!(h.store.count().await.unwrap(), 1);
    let stats = h.pipeline.stats().snapshot();
    assert_eq!(stats.scored, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.acknowledged, 2);
}

#[tokio::test]
async fn test_embedding_failure_degrades_but_keeps_entry() {
    let mut h = harness(Setup {
        provider: Arc::new(RejectingProvider),
        ..Setup::default()
    });
    h.push(br#"{"service":"auth","level":"FATAL","message":"token store unreachable"}"#.to_vec())
        .await;

    let outcome = h.process_next().await.unwrap();
    let RecordOutcome::Degraded { entry_id, alerted } = outcome.clone() else {
        panic!("expected degraded outcome, got {outcome:?}");
    };
    // Scoring and alerting do not depend on the embedding.
    assert!(alerted);
    assert_eq!(h.drain_alerts().len(), 1);

    assert!(h.index.is_empty());
    assert!(h.store.get(&entry_id).await.unwrap().is_some());
    assert_eq!(h.queue.depth().await.unwrap().in_flight, 0);
    assert_eq!(h.pipeline.stats().snapshot().degraded, 1);
}

#[tokio::test]
async fn test_reindex_makes_degraded_entry_searchable() {
    let provider = Arc::new(SwitchableProvider {
        inner: HashingEmbeddingProvider::new(DIM),
        down: AtomicBool::new(true),
    });
    let h = harness(Setup {
        provider: provider.clone(),
        ..Setup::default()
    });
    h.push(br#"{"service":"billing","level":"ERROR","message":"invoice export stalled"}"#.to_vec())
        .await;
    h.push(checkout_line(1, 5)).await;

    let degraded = h.process_next().await.unwrap();
    let RecordOutcome::Degraded { entry_id, .. } = degraded.clone() else {
        panic!("expected degraded outcome, got {degraded:?}");
    };
    provider.down.store(false, Ordering::SeqCst);
    assert!(matches!(h.process_next().await.unwrap(), RecordOutcome::Indexed { .. }));
    assert!(!h.index.contains(&entry_id));

    let report = h.pipeline.reindex(1, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.reindexed, 1);
    assert_eq!(report.still_missing, 0);
    assert!(h.index.contains(&entry_id));
    assert_eq!(h.pipeline.stats().snapshot().reindexed, 1);

    let query = HashingEmbeddingProvider::new(DIM)
        .embed_sync("invoice export stalled")
        .unwrap();
    let hits = h
        .index
        .search(&query, 1, &SearchFilter { service: Some("billing".into()), ..SearchFilter::default() })
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entry_id, entry_id);

    // A second sweep finds nothing left to do.
    let again = h.pipeline.reindex(10, &CancellationToken::new()).await.unwrap();
    assert_eq!((again.scanned, again.reindexed), (2, 0));
}

#[tokio::test]
async fn test_reindex_counts_entries_still_unembeddable() {
    let h = harness(Setup {
        provider: Arc::new(RejectingProvider),
        ..Setup::default()
    });
    h.push(br#"{"service":"auth","level":"INFO","message":"login ok"}"#.to_vec())
        .await;
    h.process_next().await.unwrap();

    let report = h.pipeline.reindex(50, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.still_missing, 1);
    assert!(h.index.is_empty());
}

#[tokio::test]
async fn test_embedding_failure_dead_letters_when_configured() {
    let h = harness(Setup {
        provider: Arc::new(RejectingProvider),
        mode: EmbeddingFailureMode::DeadLetter,
        ..Setup::default()
    });
    h.push(br#"{"service":"auth","level":"INFO","message":"login ok"}"#.to_vec())
        .await;

    let outcome = h.process_next().await.unwrap();
    assert!(matches!(outcome, RecordOutcome::DeadLettered { .. }));
    let letters = h.queue.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert!(letters[0].reason.contains("embedding unavailable"));
    assert!(h.index.is_empty());
}

#[tokio::test]
async fn test_store_failure_is_systemic() {
    let flaky = Arc::new(FlakyStore::default());
    flaky.failing.store(true, Ordering::SeqCst);
    let h = harness(Setup {
        store: Some(flaky.clone()),
        ..Setup::default()
    });
    h.push(checkout_line(1, 5)).await;

    let err = tokio_test::assert_err!(h.process_next().await);
    assert!(matches!(err, PipelineError::Store(_)));
    assert!(!err.is_fatal());
    // Not settled by `process`; the lease is still held.
    assert_eq!(h.queue.depth().await.unwrap().in_flight, 1);
    assert_eq!(h.pipeline.stats().snapshot().scored, 0);
}

#[tokio::test]
async fn test_worker_pool_recovers_from_store_outage() {
    let flaky = Arc::new(FlakyStore::default());
    flaky.failing.store(true, Ordering::SeqCst);
    let h = harness(Setup {
        store: Some(flaky.clone()),
        ..Setup::default()
    });
    h.push(checkout_line(1, 5)).await;

    let cancel = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&h.pipeline).run(1, cancel.clone()));

    let health = h.pipeline.health();
    wait_until("degraded health", || !health.current().is_healthy()).await;
    assert!(matches!(health.current(), HealthState::Degraded { .. }));

    flaky.failing.store(false, Ordering::SeqCst);
    let stats = h.pipeline.stats();
    wait_until("acknowledgement", || stats.snapshot().acknowledged == 1).await;
    wait_until("recovered health", || health.current().is_healthy()).await;

    let snapshot = stats.snapshot();
    assert!(snapshot.systemic_errors >= 1);
    assert!(snapshot.requeued >= 1);
    assert_eq!(h.index.len(), 1);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_worker_pool_drains_queue_and_stops() {
    let h = harness(Setup::default());
    for n in 1..=20 {
        h.push(checkout_line(n, 5)).await;
    }
    h.queue.close();

    tokio::time::timeout(Duration::from_secs(10), Arc::clone(&h.pipeline).run(3, CancellationToken::new()))
        .await
        .unwrap();

    let stats = h.pipeline.stats().snapshot();
    assert_eq!(stats.received, 20);
    assert_eq!(stats.acknowledged, 20);
    assert_eq!(h.index.len(), 20);
    assert_eq!(h.queue.depth().await.unwrap().in_flight, 0);
}

#[tokio::test]
async fn test_cancelled_pool_stops_promptly() {
    let h = harness(Setup::default());
    let cancel = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&h.pipeline).run(4, cancel.clone()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancelled_record_is_requeued_before_indexing() {
    let h = harness(Setup::default());
    h.push(checkout_line(1, 5)).await;

    let record = h.queue.receive().await.unwrap().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = h.pipeline.process(record, &cancel).await.unwrap();
    assert_eq!(outcome, RecordOutcome::Requeued);
    assert!(h.index.is_empty());
    assert_eq!(h.queue.depth().await.unwrap().ready, 1);
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
    let h = harness(Setup {
        provider: Arc::new(PanicOnceProvider {
            inner: HashingEmbeddingProvider::new(DIM),
            calls: AtomicUsize::new(0),
        }),
        visibility_timeout: Duration::from_millis(100),
        ..Setup::default()
    });
    h.push(checkout_line(1, 5)).await;

    let cancel = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&h.pipeline).run(1, cancel.clone()));

    let stats = h.pipeline.stats();
    wait_until("redelivered record to be indexed", || h.index.len() == 1).await;
    wait_until("acknowledgement", || stats.snapshot().acknowledged == 1).await;

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.worker_restarts, 1);
    // The first delivery was stored and scored before the crash.
    assert_eq!(snapshot.scored, 1);
    assert_eq!(snapshot.duplicates, 1);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
}
