use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{new_token, DeadLetter, LogQueue, NackAction, QueueDepth, QueueError, MAX_DELIVERIES_REASON};
use crate::normalize::{DeliveryToken, RawLogRecord};

#[derive(Debug, Clone)]
struct Message {
    source: String,
    payload: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug)]
struct Lease {
    message: Message,
    expires: Instant,
}

/// Dead letters kept in memory; older ones are dropped first.
const DEAD_LETTER_RETENTION: usize = 1024;

#[derive(Debug)]
struct State {
    ready: VecDeque<Message>,
    in_flight: HashMap<DeliveryToken, Lease>,
    dead: VecDeque<DeadLetter>,
    dead_limit: usize,
    next_dead_id: i64,
    closed: bool,
}

impl State {
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<DeliveryToken> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.expires <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(lease) = self.in_flight.remove(&token) {
                debug!(token = %token, "lease expired, message visible again");
                self.ready.push_back(lease.message);
            }
        }
    }

    fn dead_letter(&mut self, message: Message, reason: &str) {
        self.next_dead_id += 1;
        let id = self.next_dead_id;
        warn!(source = %message.source, deliveries = message.deliveries, reason, "message dead-lettered");
        if self.dead.len() >= self.dead_limit {
            self.dead.pop_front();
        }
        self.dead.push_back(DeadLetter {
            id,
            source: message.source,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            reason: reason.to_string(),
            deliveries: message.deliveries,
            dead_lettered_at: Utc::now(),
        });
    }
}

/// Bounded in-process queue with leases. Used when no spool database is
/// configured and in tests.
pub struct MemoryQueue {
    state: Mutex<State>,
    available: Notify,
    capacity: usize,
    max_deliveries: u32,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(capacity: usize, max_deliveries: u32, visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
                dead: VecDeque::new(),
                dead_limit: DEAD_LETTER_RETENTION,
                next_dead_id: 0,
                closed: false,
            }),
            available: Notify::new(),
            capacity: capacity.max(1),
            max_deliveries: max_deliveries.max(1),
            visibility_timeout,
        }
    }

    /// Keep at most `limit` dead letters.
    pub fn with_dead_letter_limit(self, limit: usize) -> Self {
        self.state().dead_limit = limit.max(1);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop handing out records. Pending `receive` calls return `None` once
    /// nothing is ready.
    pub fn close(&self) {
        self.state().closed = true;
        self.available.notify_waiters();
    }

    fn take_lease(&self, token: &DeliveryToken) -> Result<Lease, QueueError> {
        self.state()
            .in_flight
            .remove(token)
            .ok_or_else(|| QueueError::UnknownToken(token.to_string()))
    }
}

#[async_trait]
impl LogQueue for MemoryQueue {
    async fn receive(&self) -> Result<Option<RawLogRecord>, QueueError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = {
                let mut state = self.state();
                state.reclaim_expired(Instant::now());
                while let Some(mut message) = state.ready.pop_front() {
                    if message.deliveries >= self.max_deliveries {
                        state.dead_letter(message, MAX_DELIVERIES_REASON);
                        continue;
                    }
                    message.deliveries += 1;
                    let token = new_token();
                    let record = RawLogRecord {
                        payload: message.payload.clone(),
                        source: message.source.clone(),
                        received_at: Utc::now(),
                        token: token.clone(),
                        delivery_count: message.deliveries,
                    };
                    state.in_flight.insert(
                        token,
                        Lease {
                            message,
                            expires: Instant::now() + self.visibility_timeout,
                        },
                    );
                    return Ok(Some(record));
                }
                if state.closed {
                    return Ok(None);
                }
                state.in_flight.values().map(|lease| lease.expires).min()
            };

            match next_expiry {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, token: &DeliveryToken) -> Result<(), QueueError> {
        self.take_lease(token).map(|_| ())
    }

    async fn nack(&self, token: &DeliveryToken, action: NackAction) -> Result<(), QueueError> {
        let lease = self.take_lease(token)?;
        match action {
            NackAction::Requeue => {
                self.state().ready.push_back(lease.message);
                self.available.notify_one();
            }
            NackAction::DeadLetter { reason } => {
                self.state().dead_letter(lease.message, &reason);
            }
        }
        Ok(())
    }

    async fn enqueue(&self, source: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            if state.ready.len() + state.in_flight.len() >= self.capacity {
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }
            state.ready.push_back(Message {
                source: source.to_string(),
                payload,
                deliveries: 0,
            });
        }
        self.available.notify_one();
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.state().dead.iter().rev().take(limit).cloned().collect())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.state();
        Ok(QueueDepth {
            ready: state.ready.len() as u64,
            in_flight: state.in_flight.len() as u64,
            dead_lettered: state.dead.len() as u64,
        })
    }
}
