use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::alert::AlertLedger;
use crate::pipeline::Pipeline;
use crate::query::SemanticQueryService;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub query: Arc<SemanticQueryService>,
    pub ledger: Option<AlertLedger>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, query: Arc<SemanticQueryService>, ledger: Option<AlertLedger>) -> Self {
        Self {
            pipeline,
            query,
            ledger,
            started_at: Utc::now(),
        }
    }
}
