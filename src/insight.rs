//! Error-rate insight over stored entries, for the reporting endpoints.
//!
//! Built from per-(service, level) counts aggregated by the store, so the
//! cost does not depend on how many entries are stored.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::normalize::Level;
use crate::storage::LevelCount;

const CRITICAL_ERROR_RATE: f64 = 30.0;
const WARNING_ERROR_RATE: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsightStatus {
    Critical,
    Warning,
    Stable,
}

impl InsightStatus {
    fn for_rate(error_rate_pct: f64) -> Self {
        if error_rate_pct > CRITICAL_ERROR_RATE {
            InsightStatus::Critical
        } else if error_rate_pct > WARNING_ERROR_RATE {
            InsightStatus::Warning
        } else {
            InsightStatus::Stable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceErrors {
    pub service: String,
    pub errors: u64,
    /// Share of all errors, in percent.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightSummary {
    pub total: u64,
    /// ERROR and FATAL.
    pub errors: u64,
    pub warnings: u64,
    /// Everything below WARN.
    pub info: u64,
    pub error_rate_pct: f64,
    pub status: InsightStatus,
    pub top_error_service: Option<String>,
    /// Services with at least one error, most errors first.
    pub error_services: Vec<ServiceErrors>,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

impl InsightSummary {
    pub fn from_counts<'a>(counts: impl IntoIterator<Item = &'a LevelCount>) -> Self {
        let mut total = 0u64;
        let mut errors = 0u64;
        let mut warnings = 0u64;
        let mut per_service: BTreeMap<&str, u64> = BTreeMap::new();

        for row in counts {
            total += row.count;
            match row.level {
                Level::Error | Level::Fatal => {
                    errors += row.count;
                    *per_service.entry(row.service.as_str()).or_default() += row.count;
                }
                Level::Warn => warnings += row.count,
                _ => {}
            }
        }
        per_service.retain(|_, n| *n > 0);

        let error_rate_pct = if total == 0 {
            0.0
        } else {
            round2(errors as f64 * 100.0 / total as f64)
        };

        let mut error_services: Vec<ServiceErrors> = per_service
            .into_iter()
            .map(|(service, count)| ServiceErrors {
                service: service.to_string(),
                errors: count,
                percentage: round2(count as f64 * 100.0 / errors as f64),
            })
            .collect();
        // Stable order for equal counts: name ascending (BTreeMap order).
        error_services.sort_by(|a, b| b.errors.cmp(&a.errors));

        Self {
            total,
            errors,
            warnings,
            info: total - errors - warnings,
            error_rate_pct,
            status: InsightStatus::for_rate(error_rate_pct),
            top_error_service: error_services.first().map(|s| s.service.clone()),
            error_services,
        }
    }
}
