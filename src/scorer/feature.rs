//! Numeric feature extraction for the statistical part of the scorer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::normalize::{NormalizedLogEntry, NumericLookup};

/// Where the scorer's numeric feature comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureSource {
    /// An explicit numeric field, e.g. `latency_ms`.
    Field { name: String },
    /// Per-service log rate: an exponentially decayed event count whose
    /// decay constant is `window_secs`.
    LogRate { window_secs: u64 },
}

impl Default for FeatureSource {
    fn default() -> Self {
        FeatureSource::LogRate { window_secs: 60 }
    }
}

/// Outcome of extracting the feature from one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Value(f64),
    /// The entry does not carry the feature.
    Absent,
    /// The feature is present but unusable; the string says why.
    Malformed(String),
}

/// Decayed event counter: `value = value * exp(-dt / tau) + 1` per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecayedRate {
    value: f64,
    last: Option<DateTime<Utc>>,
}

impl DecayedRate {
    /// Record one event at `at` and return the updated rate. Out-of-order
    /// timestamps decay by zero rather than growing the counter.
    pub fn observe(&mut self, at: DateTime<Utc>, tau_secs: f64) -> f64 {
        let decay = match self.last {
            Some(last) => {
                let dt = (at - last).num_milliseconds().max(0) as f64 / 1000.0;
                (-dt / tau_secs.max(1e-3)).exp()
            }
            None => 0.0,
        };
        self.value = self.value * decay + 1.0;
        if self.last.map_or(true, |last| at > last) {
            self.last = Some(at);
        }
        self.value
    }
}

impl FeatureSource {
    pub fn extract(&self, entry: &NormalizedLogEntry, rate: &mut DecayedRate) -> Extracted {
        match self {
            FeatureSource::Field { name } => match entry.fields.numeric(name) {
                NumericLookup::Value(v) => Extracted::Value(v),
                NumericLookup::Missing => Extracted::Absent,
                NumericLookup::NotNumeric => Extracted::Malformed(format!(
                    "field '{}' is not numeric: {}",
                    name,
                    entry.fields.get(name).map(|v| v.to_string()).unwrap_or_default()
                )),
            },
            FeatureSource::LogRate { window_secs } => {
                Extracted::Value(rate.observe(entry.timestamp, *window_secs as f64))
            }
        }
    }
}
