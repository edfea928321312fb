//! Alert intents: cool-down de-duplication, outbound queue, delivery.

mod dispatcher;
mod ledger;
mod transport;

pub use self::dispatcher::{Decision, DispatchStats, Dispatcher};
pub use self::ledger::AlertLedger;
pub use self::transport::{run_delivery, AlertTransport, LogTransport, TransportError, WebhookTransport};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::normalize::EntryId;
use crate::scorer::{ScoreOutcome, Severity};

/// Which scorer contributor made an entry alert-worthy. Cool-down is keyed
/// per (service, category).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Statistical,
    SeverityRule,
    Keyword,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::Statistical => "statistical",
            AlertCategory::SeverityRule => "severity_rule",
            AlertCategory::Keyword => "keyword",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "statistical" => Some(AlertCategory::Statistical),
            "severity_rule" => Some(AlertCategory::SeverityRule),
            "keyword" => Some(AlertCategory::Keyword),
            _ => None,
        }
    }
}

/// An alert-worthy observation offered to the [`Dispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub service: String,
    pub category: AlertCategory,
    pub severity: Severity,
    pub entry_id: EntryId,
    pub score: f64,
}

impl AlertCandidate {
    pub fn from_outcome(entry_id: &EntryId, outcome: &ScoreOutcome) -> Self {
        Self {
            service: outcome.service.clone(),
            category: outcome.category,
            severity: outcome.severity,
            entry_id: entry_id.clone(),
            score: outcome.score,
        }
    }
}

/// An emitted alert, handed to the delivery collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertIntent {
    pub id: Uuid,
    pub service: String,
    pub category: AlertCategory,
    pub severity: Severity,
    pub entry_id: EntryId,
    pub score: f64,
    /// No further alert for this (service, category) before this instant.
    pub cooldown_until: DateTime<Utc>,
    /// Candidates suppressed since the previous alert for this key.
    pub suppressed_count: u64,
    pub created_at: DateTime<Utc>,
}

impl AlertIntent {
    pub fn summary(&self) -> String {
        let mut text = format!(
            "[{}] {} {} anomaly (score {:.2}) on entry {}",
            self.severity.as_str(),
            self.service,
            self.category.as_str(),
            self.score,
            self.entry_id
        );
        if self.suppressed_count > 0 {
            text.push_str(&format!(" ({} similar alerts suppressed)", self.suppressed_count));
        }
        text
    }
}
