//! Semantic search: embed the query text, search the vector index.
//!
//! Read-only with respect to the index and the scorer. The only state kept
//! here is a short history of recent queries.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::embedding::{EmbeddingClient, EmbeddingError};
use crate::index::{IndexError, SearchFilter, SearchHit, VectorIndex};
use crate::normalize::Level;
use crate::scorer::mentions_failure;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query text is empty")]
    EmptyQuery,

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Options for one query.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub k: Option<usize>,
    pub filter: SearchFilter,
    /// Restrict failure-worded queries to ERROR and above when no level
    /// filter is given. Falls back to the service default.
    pub prioritize_failures: Option<bool>,
}

/// One entry of the query history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRecord {
    pub text: String,
    pub k: usize,
    pub hits: usize,
    pub failure_intent: bool,
    pub at: DateTime<Utc>,
}

pub struct SemanticQueryService {
    embedder: Arc<EmbeddingClient>,
    index: Arc<VectorIndex>,
    history: Mutex<VecDeque<QueryRecord>>,
    history_len: usize,
    default_k: usize,
    max_k: usize,
    prioritize_failures: bool,
}

/// Cache key for query embeddings; kept apart from entry ids.
fn query_key(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("query:{hex}")
}

/// Tighten `filter` to ERROR and above when `text` reads like a failure
/// search. Returns whether the filter changed.
pub fn apply_failure_intent(text: &str, filter: &mut SearchFilter) -> bool {
    if filter.min_level.is_none() && mentions_failure(text) {
        filter.min_level = Some(Level::Error);
        return true;
    }
    false
}

impl SemanticQueryService {
    pub fn new(
        embedder: Arc<EmbeddingClient>,
        index: Arc<VectorIndex>,
        history_len: usize,
        default_k: usize,
        max_k: usize,
        prioritize_failures: bool,
    ) -> Self {
        Self {
            embedder,
            index,
            history: Mutex::new(VecDeque::with_capacity(history_len)),
            history_len,
            default_k: default_k.max(1),
            max_k: max_k.max(1),
            prioritize_failures,
        }
    }

    /// Matches for `text`, best first. `k` is clamped to the configured
    /// maximum.
    pub async fn query(&self, text: &str, options: QueryOptions) -> Result<Vec<SearchHit>, QueryError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QueryError::EmptyQuery);
        }
        let k = options.k.unwrap_or(self.default_k).min(self.max_k);

        let mut filter = options.filter;
        let failure_intent = options.prioritize_failures.unwrap_or(self.prioritize_failures)
            && apply_failure_intent(text, &mut filter);

        let vector = self.embedder.embed(&query_key(text), text).await?;
        let hits = self.index.search(vector.as_slice(), k, &filter)?;
        info!(k, hits = hits.len(), failure_intent, "semantic query");

        self.remember(QueryRecord {
            text: text.to_string(),
            k,
            hits: hits.len(),
            failure_intent,
            at: Utc::now(),
        })
        .await;
        Ok(hits)
    }

    async fn remember(&self, record: QueryRecord) {
        if self.history_len == 0 {
            return;
        }
        let mut history = self.history.lock().await;
        if history.len() == self.history_len {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Recent queries, newest first.
    pub async fn history(&self) -> Vec<QueryRecord> {
        self.history.lock().await.iter().rev().cloned().collect()
    }
}
