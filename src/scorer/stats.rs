use serde::Serialize;

use super::ScorerError;

/// Exponentially weighted running mean and variance.
///
/// Only sufficient statistics are kept; recent samples dominate according to
/// `alpha` (weight of the newest sample).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RollingStats {
    count: u64,
    mean: f64,
    variance: f64,
}

impl RollingStats {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    pub fn update(&mut self, value: f64, alpha: f64) {
        self.count += 1;
        if self.count == 1 {
            self.mean = value;
            self.variance = 0.0;
            return;
        }
        let diff = value - self.mean;
        let incr = alpha * diff;
        self.mean += incr;
        self.variance = (1.0 - alpha) * (self.variance + diff * incr);
    }

    /// Standardized deviation of `value` from the running mean.
    /// The standard deviation is floored at `min_std_dev` so a perfectly
    /// flat baseline still yields a finite score.
    pub fn z_score(&self, value: f64, min_samples: u64, min_std_dev: f64) -> Result<f64, ScorerError> {
        if self.count < min_samples {
            return Err(ScorerError::InsufficientBaseline {
                needed: min_samples,
                have: self.count,
            });
        }
        let std = self.std_dev().max(min_std_dev).max(f64::EPSILON);
        Ok((value - self.mean) / std)
    }
}
