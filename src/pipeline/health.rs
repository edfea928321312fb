//! Process-level health signal shared by the worker pool.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// A systemic failure (store, broker, index) was seen; workers pause
    /// between attempts until one succeeds.
    Degraded {
        reason: String,
        since: DateTime<Utc>,
        consecutive_failures: u32,
    },
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

pub struct HealthMonitor {
    tx: watch::Sender<HealthState>,
    failures: AtomicU32,
    backoff: RetryPolicy,
}

impl HealthMonitor {
    pub fn new(backoff: RetryPolicy) -> Self {
        let (tx, _rx) = watch::channel(HealthState::Healthy);
        Self {
            tx,
            failures: AtomicU32::new(0),
            backoff,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> HealthState {
        self.tx.borrow().clone()
    }

    pub fn report_failure(&self, reason: &str) {
        let consecutive = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        error!(consecutive, reason, "systemic pipeline failure");
        self.tx.send_modify(|state| {
            let since = match state {
                HealthState::Degraded { since, .. } => *since,
                HealthState::Healthy => Utc::now(),
            };
            *state = HealthState::Degraded {
                reason: reason.to_string(),
                since,
                consecutive_failures: consecutive,
            };
        });
    }

    pub fn report_success(&self) {
        if self.failures.swap(0, Ordering::SeqCst) > 0 {
            info!("pipeline recovered");
            self.tx.send_replace(HealthState::Healthy);
        }
    }

    /// How long a worker should wait before its next attempt; zero while
    /// healthy.
    pub fn pause(&self) -> Duration {
        match self.failures.load(Ordering::SeqCst) {
            0 => Duration::ZERO,
            n => self.backoff.delay_for(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(RetryPolicy {
            max_attempts: u32::MAX,
            base_delay_ms: 100,
            multiplier: 2,
            max_delay_ms: 1_000,
        })
    }

    #[test]
    fn test_degrade_and_recover() {
        let h = monitor();
        let rx = h.subscribe();
        assert!(h.current().is_healthy());
        assert_eq!(h.pause(), Duration::ZERO);

        h.report_failure("store down");
        h.report_failure("store down");
        assert_eq!(h.pause(), Duration::from_millis(200));
        match &*rx.borrow() {
            HealthState::Degraded { consecutive_failures, .. } => assert_eq!(*consecutive_failures, 2),
            other => panic!("expected degraded, got {other:?}"),
        }

        for _ in 0..10 {
            h.report_failure("store down");
        }
        assert_eq!(h.pause(), Duration::from_millis(1_000));

        h.report_success();
        assert!(h.current().is_healthy());
        assert_eq!(h.pause(), Duration::ZERO);
    }
}
