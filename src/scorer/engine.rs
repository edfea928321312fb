use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::alert::AlertCategory;
use crate::config::ScorerConfig;
use crate::normalize::{Level, NormalizedLogEntry};
use crate::scorer::feature::{DecayedRate, Extracted};
use crate::scorer::stats::RollingStats;
use crate::scorer::{mentions_failure, ScoreOutcome, ScorerError, ScorerPhase, Severity, SoftAnomaly};

/// Statistics owned by a single service key.
#[derive(Debug, Default)]
struct ServiceState {
    stats: RollingStats,
    rate: DecayedRate,
    last_alert_worthy_at: Option<DateTime<Utc>>,
    soft_anomalies: u64,
}

impl ServiceState {
    fn phase(&self, min_samples: u64) -> ScorerPhase {
        match self.stats.count() {
            0 => ScorerPhase::Cold,
            n if n < min_samples => ScorerPhase::Warming,
            _ => ScorerPhase::Active,
        }
    }
}

/// Read-only view of one service's scorer state.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub service: String,
    pub phase: ScorerPhase,
    pub samples: u64,
    pub mean: f64,
    pub std_dev: f64,
    pub last_alert_worthy_at: Option<DateTime<Utc>>,
    pub soft_anomalies: u64,
}

/// Per-service online scorer.
///
/// Each service key owns an independently locked [`ServiceState`]; scoring
/// two services never contends on the same lock.
pub struct AnomalyScorer {
    config: ScorerConfig,
    services: DashMap<String, Arc<Mutex<ServiceState>>>,
    soft_anomalies: AtomicU64,
}

impl AnomalyScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            config,
            services: DashMap::new(),
            soft_anomalies: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    fn state_for(&self, service: &str) -> Arc<Mutex<ServiceState>> {
        if let Some(state) = self.services.get(service) {
            return state.clone();
        }
        self.services.entry(service.to_string()).or_default().clone()
    }

    /// Score one entry and fold its feature into the service baseline.
    ///
    /// Never fails: an unusable feature contributes zero and is reported as
    /// a [`SoftAnomaly`].
    pub fn score(&self, entry: &NormalizedLogEntry) -> ScoreOutcome {
        let cfg = &self.config;
        let state = self.state_for(&entry.service);
        // The map guard is already released; only this service's lock is held.
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);

        let phase = state.phase(cfg.min_samples);
        let (rule_score, rule_category) = self.rule_score(entry);

        let mut z_score = None;
        let mut feature = None;
        let mut soft_anomaly = None;

        let mut rate = state.rate;
        match cfg.feature.extract(entry, &mut rate) {
            Extracted::Value(value) => {
                feature = Some(value);
                match state.stats.z_score(value, cfg.min_samples, cfg.min_std_dev) {
                    Ok(z) => z_score = Some(z),
                    Err(ScorerError::InsufficientBaseline { needed, have }) => {
                        debug!(service = %entry.service, needed, have, "baseline warming");
                    }
                }
                state.stats.update(value, cfg.alpha);
            }
            Extracted::Absent => {}
            Extracted::Malformed(reason) => {
                state.soft_anomalies += 1;
                self.soft_anomalies.fetch_add(1, Ordering::Relaxed);
                warn!(
                    service = %entry.service,
                    entry_id = %entry.id,
                    reason = %reason,
                    "soft anomaly: unusable scorer feature"
                );
                soft_anomaly = Some(SoftAnomaly {
                    service: entry.service.clone(),
                    reason,
                });
            }
        }
        state.rate = rate;

        let statistical = z_score.map(f64::abs).unwrap_or(0.0);
        let (score, category) = if statistical > rule_score {
            (statistical, AlertCategory::Statistical)
        } else {
            (rule_score, rule_category)
        };

        let alert_worthy = score >= cfg.alert_threshold;
        if alert_worthy {
            state.last_alert_worthy_at = Some(entry.timestamp);
        }

        ScoreOutcome {
            service: entry.service.clone(),
            score,
            severity: self.severity_for(score),
            alert_worthy,
            category,
            phase,
            z_score,
            feature,
            soft_anomaly,
        }
    }

    /// Rule-based contribution; applies in every phase.
    fn rule_score(&self, entry: &NormalizedLogEntry) -> (f64, AlertCategory) {
        let threshold = self.config.alert_threshold;
        match entry.level {
            Level::Fatal => (threshold * 2.0, AlertCategory::SeverityRule),
            Level::Error => (threshold, AlertCategory::SeverityRule),
            _ if mentions_failure(&entry.message) => (self.config.keyword_score, AlertCategory::Keyword),
            _ => (0.0, AlertCategory::Statistical),
        }
    }

    fn severity_for(&self, score: f64) -> Severity {
        let threshold = self.config.alert_threshold;
        if score >= threshold * 2.0 {
            Severity::Critical
        } else if score >= threshold {
            Severity::Warning
        } else {
            Severity::Info
        }
    }

    pub fn phase(&self, service: &str) -> ScorerPhase {
        match self.services.get(service) {
            Some(state) => {
                let state = state.clone();
                let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.phase(self.config.min_samples)
            }
            None => ScorerPhase::Cold,
        }
    }

    pub fn soft_anomaly_count(&self) -> u64 {
        self.soft_anomalies.load(Ordering::Relaxed)
    }

    /// Snapshot of every known service, sorted by name.
    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let handles: Vec<(String, Arc<Mutex<ServiceState>>)> = self
            .services
            .iter()
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();

        let mut out: Vec<ServiceSnapshot> = handles
            .into_iter()
            .map(|(service, state)| {
                let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                ServiceSnapshot {
                    service,
                    phase: state.phase(self.config.min_samples),
                    samples: state.stats.count(),
                    mean: state.stats.mean(),
                    std_dev: state.stats.std_dev(),
                    last_alert_worthy_at: state.last_alert_worthy_at,
                    soft_anomalies: state.soft_anomalies,
                }
            })
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }
}
