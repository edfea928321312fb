//! Embedding generation: the external provider contract and the caching,
//! retrying, concurrency-bounded client the pipeline talks to.

mod client;
pub mod providers;

pub use self::client::{EmbeddingClient, EmbeddingStats};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classes of failure worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Timeout,
    RateLimited,
    ServerError,
    Network,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::RateLimited => write!(f, "rate limited"),
            TransientKind::ServerError => write!(f, "server error"),
            TransientKind::Network => write!(f, "network"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("transient embedding failure ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("invalid embedding input: {0}")]
    InvalidInput(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding provider unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
}

impl EmbeddingError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        EmbeddingError::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Transient { .. })
    }
}

/// A fixed-dimension embedding. Cheap to clone; never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector(Arc<[f32]>);

impl EmbeddingVector {
    pub fn new(values: Vec<f32>) -> Self {
        EmbeddingVector(values.into())
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Little-endian f32 bytes, used for persistence.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode little-endian f32 bytes. `None` if the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect::<Vec<_>>();
        Some(EmbeddingVector::new(values))
    }
}

impl From<Vec<f32>> for EmbeddingVector {
    fn from(values: Vec<f32>) -> Self {
        EmbeddingVector::new(values)
    }
}

/// External embedding / language-model service.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Compute an embedding for `text`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Summarize `text`. Used by reporting, never by the ingestion path.
    async fn summarize(&self, text: &str) -> Result<String, EmbeddingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_bytes_roundtrip() {
        let v = EmbeddingVector::new(vec![0.5, -1.25, 3.0]);
        let bytes = v.to_le_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(EmbeddingVector::from_le_bytes(&bytes), Some(v));
        assert_eq!(EmbeddingVector::from_le_bytes(&bytes[..7]), None);
    }

    #[test]
    fn test_transient_classification() {
        assert!(EmbeddingError::transient(TransientKind::RateLimited, "429").is_transient());
        assert!(!EmbeddingError::InvalidInput("empty".into()).is_transient());
        assert!(!EmbeddingError::Unavailable { attempts: 3, last_error: "x".into() }.is_transient());
    }
}
