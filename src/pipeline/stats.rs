use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Pipeline counters, updated lock-free by every worker.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub received: AtomicU64,
    pub normalized: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub duplicates: AtomicU64,
    pub scored: AtomicU64,
    pub alert_candidates: AtomicU64,
    pub embedded: AtomicU64,
    pub indexed: AtomicU64,
    pub degraded: AtomicU64,
    pub acknowledged: AtomicU64,
    pub requeued: AtomicU64,
    pub systemic_errors: AtomicU64,
    pub worker_restarts: AtomicU64,
    /// Entries re-embedded by a reindex sweep.
    pub reindexed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub normalized: u64,
    pub dead_lettered: u64,
    pub duplicates: u64,
    pub scored: u64,
    pub alert_candidates: u64,
    pub embedded: u64,
    pub indexed: u64,
    pub degraded: u64,
    pub acknowledged: u64,
    pub requeued: u64,
    pub systemic_errors: u64,
    pub worker_restarts: u64,
    pub reindexed: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: get(&self.received),
            normalized: get(&self.normalized),
            dead_lettered: get(&self.dead_lettered),
            duplicates: get(&self.duplicates),
            scored: get(&self.scored),
            alert_candidates: get(&self.alert_candidates),
            embedded: get(&self.embedded),
            indexed: get(&self.indexed),
            degraded: get(&self.degraded),
            acknowledged: get(&self.acknowledged),
            requeued: get(&self.requeued),
            systemic_errors: get(&self.systemic_errors),
            worker_restarts: get(&self.worker_restarts),
            reindexed: get(&self.reindexed),
        }
    }
}
