//! Online anomaly scoring: per-service rolling statistics combined with
//! rule-based flags.

mod engine;
mod feature;
mod stats;

pub use self::engine::{AnomalyScorer, ServiceSnapshot};
pub use self::feature::{DecayedRate, Extracted, FeatureSource};
pub use self::stats::RollingStats;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alert::AlertCategory;

/// Words that mark a message as describing a failure.
pub const FAILURE_KEYWORDS: &[&str] = &["fail", "failed", "failure", "error", "critical", "issue", "crash"];

pub fn mentions_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| FAILURE_KEYWORDS.contains(&word))
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScorerError {
    #[error("insufficient baseline data: need {needed} samples, have {have}")]
    InsufficientBaseline { needed: u64, have: u64 },
}

/// Severity of a scored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Warning => "Warning",
            Severity::Critical => "Critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Info" => Some(Severity::Info),
            "Warning" => Some(Severity::Warning),
            "Critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Baseline maturity of one service key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerPhase {
    /// No samples yet.
    Cold,
    /// Fewer than `min_samples`; only rules apply.
    Warming,
    /// Baseline is stable; z-scores apply.
    Active,
}

/// A malformed numeric feature. Reported, never returned as an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoftAnomaly {
    pub service: String,
    pub reason: String,
}

/// Result of scoring one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreOutcome {
    pub service: String,
    pub score: f64,
    pub severity: Severity,
    pub alert_worthy: bool,
    /// Contributor that produced `score`.
    pub category: AlertCategory,
    /// Phase the service was in when the entry arrived.
    pub phase: ScorerPhase,
    pub z_score: Option<f64>,
    pub feature: Option<f64>,
    pub soft_anomaly: Option<SoftAnomaly>,
}
