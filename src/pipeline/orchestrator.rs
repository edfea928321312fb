use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stats::bump;
use super::{HealthMonitor, PipelineError, PipelineStats, RecordOutcome, RecordState};
use crate::alert::{AlertCandidate, Decision, Dispatcher};
use crate::config::{EmbeddingFailureMode, IngestConfig};
use crate::embedding::EmbeddingClient;
use crate::index::{IndexMetadata, VectorIndex};
use crate::normalize::{DeliveryToken, NormalizedLogEntry, Normalizer, RawLogRecord};
use crate::queue::{LogQueue, NackAction, QueueError};
use crate::scorer::AnomalyScorer;
use crate::storage::{self, LogFilter, LogStore, Pool, PutOutcome};

/// Collaborators the pipeline drives.
#[derive(Clone)]
pub struct PipelineParts {
    pub queue: Arc<dyn LogQueue>,
    pub store: Arc<dyn LogStore>,
    pub scorer: Arc<AnomalyScorer>,
    pub embedder: Arc<EmbeddingClient>,
    pub index: Arc<VectorIndex>,
    pub dispatcher: Arc<Dispatcher>,
    /// When set, every index insert is written through to `index_vectors`.
    pub vector_pool: Option<Pool>,
}

/// Stored entries fetched per page by a reindex sweep.
pub const REINDEX_PAGE_SIZE: usize = 500;

/// Counts from one reindex sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub scanned: u64,
    pub reindexed: u64,
    /// Entries whose embedding failed again; the next sweep retries them.
    pub still_missing: u64,
}

pub struct Pipeline {
    parts: PipelineParts,
    normalizer: Normalizer,
    config: IngestConfig,
    stats: PipelineStats,
    health: HealthMonitor,
}

fn log_state(token: &DeliveryToken, state: RecordState) {
    debug!(token = %token, state = ?state, "record state");
}

impl Pipeline {
    pub fn new(config: IngestConfig, parts: PipelineParts) -> Self {
        Self {
            normalizer: Normalizer::new(config.bucket_secs),
            health: HealthMonitor::new(config.systemic_backoff),
            stats: PipelineStats::default(),
            parts,
            config,
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn parts(&self) -> &PipelineParts {
        &self.parts
    }

    /// Drive one record to a terminal state.
    ///
    /// Per-record problems (malformed payload, embedding failure) are
    /// settled here and reported through the outcome. An `Err` means a
    /// collaborator is unhealthy and the record has not been settled.
    pub async fn process(
        &self,
        record: RawLogRecord,
        cancel: &CancellationToken,
    ) -> Result<RecordOutcome, PipelineError> {
        let token = record.token.clone();
        bump(&self.stats.received);
        log_state(&token, RecordState::Received);

        let entry = match self.normalizer.normalize(&record) {
            Ok(entry) => entry,
            Err(e) => {
                let reason = e.to_string();
                warn!(source = %record.source, token = %token, reason = %reason, "dead-lettering malformed record");
                return self.dead_letter(&token, reason).await;
            }
        };
        bump(&self.stats.normalized);
        log_state(&token, RecordState::Normalized);

        if cancel.is_cancelled() {
            return self.requeue(&token).await;
        }

        let put = self.parts.store.put(&entry).await?;
        if put != PutOutcome::Inserted {
            return self.repair_duplicate(&token, entry, put).await;
        }

        let outcome = self.parts.scorer.score(&entry);
        bump(&self.stats.scored);
        log_state(&token, RecordState::Scored);

        let mut alerted = false;
        if outcome.alert_worthy {
            bump(&self.stats.alert_candidates);
            let candidate = AlertCandidate::from_outcome(&entry.id, &outcome);
            alerted = matches!(
                self.parts.dispatcher.dispatch(candidate, Utc::now()).await,
                Decision::Emit(_)
            );
        }

        if cancel.is_cancelled() {
            return self.requeue(&token).await;
        }

        let indexed = self.embed_and_index(&token, &entry).await?;
        if !indexed && self.config.on_embedding_failure == EmbeddingFailureMode::DeadLetter {
            return self
                .dead_letter(&token, format!("embedding unavailable for entry {}", entry.id))
                .await;
        }

        self.ack(&token).await?;
        let entry_id = entry.id;
        Ok(if indexed {
            RecordOutcome::Indexed { entry_id, alerted }
        } else {
            bump(&self.stats.degraded);
            RecordOutcome::Degraded { entry_id, alerted }
        })
    }

    /// A redelivered or re-emitted entry. Scoring and alerting already
    /// happened; only make sure the index holds the latest version.
    async fn repair_duplicate(
        &self,
        token: &DeliveryToken,
        entry: NormalizedLogEntry,
        put: PutOutcome,
    ) -> Result<RecordOutcome, PipelineError> {
        bump(&self.stats.duplicates);
        let needs_index = put == PutOutcome::Updated || !self.parts.index.contains(&entry.id);
        if needs_index {
            debug!(entry_id = %entry.id, ?put, "repairing index for duplicate entry");
            self.embed_and_index(token, &entry).await?;
        }
        self.ack(token).await?;
        Ok(RecordOutcome::Duplicate { entry_id: entry.id })
    }

    /// Returns whether the entry ended up in the index. Embedding failures
    /// and rejected vectors are per-record and yield `false`; a corrupt
    /// index or a failed write-through is an error.
    async fn embed_and_index(
        &self,
        token: &DeliveryToken,
        entry: &NormalizedLogEntry,
    ) -> Result<bool, PipelineError> {
        let vector = match self
            .parts
            .embedder
            .embed(entry.id.as_str(), &entry.embedding_text())
            .await
        {
            Ok(vector) => vector,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "embedding failed, entry not searchable");
                return Ok(false);
            }
        };
        bump(&self.stats.embedded);
        log_state(token, RecordState::Embedded);

        match self
            .parts
            .index
            .insert(entry.id.clone(), vector, IndexMetadata::from(entry))
        {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "vector rejected by index");
                return Ok(false);
            }
        }

        if let Some(pool) = &self.parts.vector_pool {
            if let Some(stored) = self.parts.index.get(&entry.id) {
                if let Err(e) = storage::vectors::save(pool, &stored).await {
                    // Keep memory and disk in step; the redelivery re-inserts.
                    self.parts.index.delete(&entry.id);
                    return Err(e.into());
                }
            }
        }

        bump(&self.stats.indexed);
        log_state(token, RecordState::Indexed);
        Ok(true)
    }

    /// Re-embed every stored entry that is missing from the index, paging
    /// through the store `page_size` entries at a time. Degraded entries
    /// become searchable once the provider is back.
    ///
    /// Stops early (with the counts so far) when `cancel` fires. Store and
    /// write-through failures abort the sweep.
    pub async fn reindex(&self, page_size: usize, cancel: &CancellationToken) -> Result<ReindexReport, PipelineError> {
        let page_size = page_size.max(1);
        let mut report = ReindexReport::default();
        let mut offset = 0usize;

        loop {
            let page = self
                .parts
                .store
                .query(&LogFilter {
                    limit: Some(page_size),
                    offset: Some(offset),
                    ..LogFilter::default()
                })
                .await?;
            let fetched = page.len();

            for entry in page {
                if cancel.is_cancelled() {
                    return Ok(report);
                }
                report.scanned += 1;
                if self.parts.index.contains(&entry.id) {
                    continue;
                }
                let token = DeliveryToken(format!("reindex-{}", entry.id));
                if self.embed_and_index(&token, &entry).await? {
                    bump(&self.stats.reindexed);
                    report.reindexed += 1;
                } else {
                    report.still_missing += 1;
                }
            }

            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        if report.reindexed > 0 || report.still_missing > 0 {
            info!(
                scanned = report.scanned,
                reindexed = report.reindexed,
                still_missing = report.still_missing,
                "reindex sweep finished"
            );
        }
        Ok(report)
    }

    /// Run [`Pipeline::reindex`] every `interval` until cancelled. Sweeps
    /// are skipped while the pipeline is degraded.
    pub async fn run_reindex_sweeps(self: Arc<Self>, interval: Duration, page_size: usize, cancel: CancellationToken) {
        if interval.is_zero() {
            return;
        }
        debug!(interval_secs = interval.as_secs(), "reindex sweeps scheduled");
        while Self::pause(&cancel, interval).await {
            if !self.health.current().is_healthy() {
                debug!("pipeline degraded, skipping reindex sweep");
                continue;
            }
            if let Err(e) = self.reindex(page_size, &cancel).await {
                warn!(error = %e, "reindex sweep failed");
            }
        }
    }

    async fn ack(&self, token: &DeliveryToken) -> Result<(), PipelineError> {
        match self.parts.queue.ack(token).await {
            Ok(()) => {}
            // The lease lapsed and the record went back to the queue; the
            // redelivery is idempotent.
            Err(QueueError::UnknownToken(_)) => {
                warn!(token = %token, "ack after lease expiry");
            }
            Err(e) => return Err(e.into()),
        }
        bump(&self.stats.acknowledged);
        log_state(token, RecordState::Acknowledged);
        Ok(())
    }

    async fn dead_letter(&self, token: &DeliveryToken, reason: String) -> Result<RecordOutcome, PipelineError> {
        self.parts
            .queue
            .nack(token, NackAction::DeadLetter { reason: reason.clone() })
            .await?;
        bump(&self.stats.dead_lettered);
        log_state(token, RecordState::DeadLettered);
        Ok(RecordOutcome::DeadLettered { reason })
    }

    async fn requeue(&self, token: &DeliveryToken) -> Result<RecordOutcome, PipelineError> {
        self.parts.queue.nack(token, NackAction::Requeue).await?;
        bump(&self.stats.requeued);
        debug!(token = %token, "record requeued on cancellation");
        Ok(RecordOutcome::Requeued)
    }

    /// Sleep unless cancelled. Returns `false` on cancellation.
    async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
        if duration.is_zero() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// One worker: pull, process, settle, until the queue closes or
    /// `cancel` fires. Returns `Err` only for fatal errors.
    pub async fn run_worker(self: Arc<Self>, worker: usize, cancel: CancellationToken) -> Result<(), PipelineError> {
        debug!(worker, "pipeline worker started");
        loop {
            if !Self::pause(&cancel, self.health.pause()).await {
                break;
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.parts.queue.receive() => received,
            };
            let record = match received {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    bump(&self.stats.systemic_errors);
                    self.health.report_failure(&format!("queue receive: {e}"));
                    continue;
                }
            };

            let token = record.token.clone();
            match self.process(record, &cancel).await {
                Ok(_) => self.health.report_success(),
                Err(e) => {
                    bump(&self.stats.systemic_errors);
                    self.health.report_failure(&e.to_string());
                    if let Err(nack_err) = self.parts.queue.nack(&token, NackAction::Requeue).await {
                        warn!(token = %token, error = %nack_err, "requeue after failure did not succeed");
                    } else {
                        bump(&self.stats.requeued);
                    }
                    if e.is_fatal() {
                        error!(worker, error = %e, "pipeline worker stopping on fatal error");
                        return Err(e);
                    }
                }
            }
        }
        debug!(worker, "pipeline worker stopped");
        Ok(())
    }

    /// Run `workers` concurrent workers until cancelled or the queue closes.
    /// A worker that stops on a fatal error is replaced by a fresh one
    /// after the health backoff.
    pub async fn run(self: Arc<Self>, workers: usize, cancel: CancellationToken) {
        let workers = workers.max(1);
        info!(workers, "ingestion pipeline started");

        let mut set = JoinSet::new();
        for worker in 0..workers {
            set.spawn(Arc::clone(&self).run_worker(worker, cancel.clone()));
        }

        let mut next_id = workers;
        while let Some(joined) = set.join_next().await {
            let failed = match joined {
                Ok(Ok(())) => false,
                Ok(Err(_)) => true,
                Err(e) => {
                    error!(error = %e, "pipeline worker panicked");
                    self.health.report_failure("worker panicked");
                    true
                }
            };
            if failed && !cancel.is_cancelled() {
                if !Self::pause(&cancel, self.health.pause()).await {
                    continue;
                }
                bump(&self.stats.worker_restarts);
                warn!(worker = next_id, "restarting pipeline worker");
                set.spawn(Arc::clone(&self).run_worker(next_id, cancel.clone()));
                next_id += 1;
            }
        }
        info!("ingestion pipeline stopped");
    }
}
