use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{AlertCandidate, AlertCategory, AlertIntent};

/// Outcome of [`Dispatcher::consider`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Emit(AlertIntent),
    /// Inside the cool-down window; `suppressed` is the running count for
    /// this key.
    Suppress { suppressed: u64 },
}

#[derive(Debug, Default)]
struct CooldownSlot {
    until: Option<DateTime<Utc>>,
    suppressed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub emitted: u64,
    pub suppressed: u64,
    pub dropped: u64,
}

/// Turns alert-worthy candidates into [`AlertIntent`]s, at most one per
/// (service, category) per cool-down window, and appends them to a bounded
/// outbound queue. Delivery belongs to whoever drains the queue.
pub struct Dispatcher {
    cooldown: Duration,
    slots: Mutex<HashMap<(String, AlertCategory), CooldownSlot>>,
    outbound: mpsc::Sender<AlertIntent>,
    emitted: AtomicU64,
    suppressed: AtomicU64,
    dropped: AtomicU64,
}

impl Dispatcher {
    pub fn new(cooldown_secs: u64, capacity: usize) -> (Self, mpsc::Receiver<AlertIntent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dispatcher = Self {
            cooldown: Duration::seconds(cooldown_secs.min(i64::MAX as u64) as i64),
            slots: Mutex::new(HashMap::new()),
            outbound: tx,
            emitted: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (dispatcher, rx)
    }

    /// Decide whether `candidate` becomes an alert at `now`. Pure decision
    /// plus slot bookkeeping; nothing is enqueued.
    pub fn consider(&self, candidate: AlertCandidate, now: DateTime<Utc>) -> Decision {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .entry((candidate.service.clone(), candidate.category))
            .or_default();

        if slot.until.is_some_and(|until| now < until) {
            slot.suppressed += 1;
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(
                service = %candidate.service,
                category = candidate.category.as_str(),
                suppressed = slot.suppressed,
                "alert suppressed by cool-down"
            );
            return Decision::Suppress {
                suppressed: slot.suppressed,
            };
        }

        let cooldown_until = now + self.cooldown;
        let intent = AlertIntent {
            id: Uuid::new_v4(),
            service: candidate.service,
            category: candidate.category,
            severity: candidate.severity,
            entry_id: candidate.entry_id,
            score: candidate.score,
            cooldown_until,
            suppressed_count: slot.suppressed,
            created_at: now,
        };
        slot.until = Some(cooldown_until);
        slot.suppressed = 0;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Decision::Emit(intent)
    }

    /// Consider `candidate` and, if emitted, append it to the outbound queue.
    /// Waits for room when the queue is full.
    pub async fn dispatch(&self, candidate: AlertCandidate, now: DateTime<Utc>) -> Decision {
        let decision = self.consider(candidate, now);
        if let Decision::Emit(intent) = &decision {
            info!(
                alert_id = %intent.id,
                service = %intent.service,
                severity = intent.severity.as_str(),
                suppressed = intent.suppressed_count,
                "alert emitted"
            );
            if self.outbound.send(intent.clone()).await.is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(alert_id = %intent.id, "alert queue closed, alert dropped");
            }
        }
        decision
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
