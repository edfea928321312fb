//! Ingestion pipeline: queue -> normalize -> store -> score -> alert ->
//! embed -> index -> ack, run by a pool of workers.

mod health;
mod orchestrator;
mod stats;

pub use self::health::{HealthMonitor, HealthState};
pub use self::orchestrator::{Pipeline, PipelineParts, ReindexReport, REINDEX_PAGE_SIZE};
pub use self::stats::{PipelineStats, StatsSnapshot};

use serde::Serialize;
use thiserror::Error;

use crate::index::IndexError;
use crate::normalize::EntryId;
use crate::queue::QueueError;
use crate::storage::StoreError;

/// Errors that escape a single record. All of them are systemic: the record
/// is requeued and the pool backs off.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("queue unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("index failure: {0}")]
    Index(#[from] IndexError),
}

impl PipelineError {
    /// Fatal errors end the worker; the supervisor starts a fresh one.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Index(e) if e.is_fatal())
    }
}

/// Lifecycle of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Received,
    Normalized,
    Scored,
    Embedded,
    Indexed,
    Acknowledged,
    DeadLettered,
}

/// How one record left the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Stored, scored, and searchable.
    Indexed { entry_id: EntryId, alerted: bool },
    /// Stored and scored, but not searchable (embedding failed).
    Degraded { entry_id: EntryId, alerted: bool },
    /// Already processed; only missing index state was repaired.
    Duplicate { entry_id: EntryId },
    DeadLettered { reason: String },
    /// Cancelled before acknowledgment and handed back to the queue.
    Requeued,
}

impl RecordOutcome {
    pub fn final_state(&self) -> RecordState {
        match self {
            RecordOutcome::DeadLettered { .. } => RecordState::DeadLettered,
            RecordOutcome::Requeued => RecordState::Received,
            _ => RecordState::Acknowledged,
        }
    }

    pub fn entry_id(&self) -> Option<&EntryId> {
        match self {
            RecordOutcome::Indexed { entry_id, .. }
            | RecordOutcome::Degraded { entry_id, .. }
            | RecordOutcome::Duplicate { entry_id } => Some(entry_id),
            _ => None,
        }
    }
}
