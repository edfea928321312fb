//! Source queue contract and its two implementations.
//!
//! Delivery is at-least-once: a received record stays leased until it is
//! acked or nacked, and an expired lease makes it visible again.

mod memory;
mod spool;

pub use self::memory::MemoryQueue;
pub use self::spool::SpoolQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::normalize::{DeliveryToken, RawLogRecord};
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({capacity} messages)")]
    Full { capacity: usize },

    #[error("unknown or expired delivery token {0}")]
    UnknownToken(String),

    #[error("queue storage: {0}")]
    Storage(#[from] StoreError),
}

/// What to do with a record that was not processed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackAction {
    /// Make the record visible again for redelivery.
    Requeue,
    /// Move the record to the dead-letter store. Terminal.
    DeadLetter { reason: String },
}

/// A record that reached the dead-letter path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub source: String,
    /// Payload as lossy UTF-8.
    pub payload: String,
    pub reason: String,
    pub deliveries: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueDepth {
    /// Visible and waiting.
    pub ready: u64,
    /// Leased to a worker.
    pub in_flight: u64,
    pub dead_lettered: u64,
}

#[async_trait]
pub trait LogQueue: Send + Sync {
    /// Wait for the next record. `None` means the queue is closed.
    async fn receive(&self) -> Result<Option<RawLogRecord>, QueueError>;
    async fn ack(&self, token: &DeliveryToken) -> Result<(), QueueError>;
    async fn nack(&self, token: &DeliveryToken, action: NackAction) -> Result<(), QueueError>;
    /// Producer side, used by the HTTP ingest endpoint and the CLI.
    async fn enqueue(&self, source: &str, payload: Vec<u8>) -> Result<(), QueueError>;
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;
    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}

pub(crate) fn new_token() -> DeliveryToken {
    DeliveryToken(uuid::Uuid::new_v4().to_string())
}

pub(crate) const MAX_DELIVERIES_REASON: &str = "delivery limit reached";
