//! Vector index for semantic search over log embeddings.

mod metric;
mod vector_index;

pub use self::metric::Metric;
pub use self::vector_index::{IndexEntry, InsertOutcome, VectorIndex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalize::{EntryId, Level, NormalizedLogEntry};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    /// Stored index data is unreadable. Fatal for the worker that hit it.
    #[error("index corrupt at entry {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("vector dimension mismatch: index is {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid vector: {0}")]
    InvalidVector(String),
}

impl IndexError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, IndexError::Corrupt { .. })
    }
}

/// Filterable metadata stored next to each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub service: String,
    pub level: Level,
    pub timestamp: DateTime<Utc>,
}

impl From<&NormalizedLogEntry> for IndexMetadata {
    fn from(entry: &NormalizedLogEntry) -> Self {
        Self {
            service: entry.service.clone(),
            level: entry.level,
            timestamp: entry.timestamp,
        }
    }
}

/// Search restrictions. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilter {
    /// Exact service name, compared case-insensitively.
    pub service: Option<String>,
    /// Only entries at or above this level.
    pub min_level: Option<Level>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl SearchFilter {
    pub fn matches(&self, meta: &IndexMetadata) -> bool {
        if let Some(service) = &self.service {
            if !meta.service.eq_ignore_ascii_case(service) {
                return false;
            }
        }
        if self.min_level.is_some_and(|min| meta.level < min) {
            return false;
        }
        if self.since.is_some_and(|since| meta.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| meta.timestamp > until) {
            return false;
        }
        true
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub entry_id: EntryId,
    pub score: f32,
    pub metadata: IndexMetadata,
}

/// A vector row as persisted, before validation.
#[derive(Debug, Clone)]
pub struct PersistedVector {
    pub id: EntryId,
    pub bytes: Vec<u8>,
    pub metadata: IndexMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta(service: &str, level: Level, hour: u32) -> IndexMetadata {
        IndexMetadata {
            service: service.into(),
            level,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_filter_matching() {
        let m = meta("Checkout", Level::Warn, 10);
        assert!(SearchFilter::default().matches(&m));
        assert!(SearchFilter { service: Some("checkout".into()), ..Default::default() }.matches(&m));
        assert!(!SearchFilter { service: Some("cart".into()), ..Default::default() }.matches(&m));
        assert!(!SearchFilter { min_level: Some(Level::Error), ..Default::default() }.matches(&m));
        assert!(SearchFilter { min_level: Some(Level::Warn), ..Default::default() }.matches(&m));

        let window = SearchFilter {
            since: Some(meta("", Level::Info, 9).timestamp),
            until: Some(meta("", Level::Info, 11).timestamp),
            ..Default::default()
        };
        assert!(window.matches(&m));
        assert!(!window.matches(&meta("Checkout", Level::Warn, 12)));
    }
}
