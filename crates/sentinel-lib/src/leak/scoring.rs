//! Leak probability scoring
//!
//! Each signal contributes its full weight once it crosses its threshold and
//! nothing below it. The total is capped at 1.0, so raising any signal never
//! lowers the score.

use crate::config::{LeakConfig, LeakWeights};
use serde::Serialize;

/// Raw inputs for one resource type
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LeakSignals {
    /// Live allocations over total allocations
    pub unreleased_ratio: f64,
    pub average_lifetime_ms: f64,
    pub growth_rate_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakScoring {
    pub weights: LeakWeights,
    pub unreleased_ratio_threshold: f64,
    pub lifetime_threshold_ms: f64,
    pub growth_threshold_percent: f64,
}

impl LeakScoring {
    pub fn from_config(config: &LeakConfig) -> Self {
        Self {
            weights: config.weights,
            unreleased_ratio_threshold: config.unreleased_ratio_threshold,
            lifetime_threshold_ms: config.lifetime_threshold_ms as f64,
            growth_threshold_percent: config.growth_threshold_percent,
        }
    }

    pub fn score(&self, signals: &LeakSignals) -> f64 {
        let mut probability = 0.0;
        if signals.unreleased_ratio > self.unreleased_ratio_threshold {
            probability += self.weights.unreleased.max(0.0);
        }
        if signals.average_lifetime_ms > self.lifetime_threshold_ms {
            probability += self.weights.lifetime.max(0.0);
        }
        if signals.growth_rate_percent > self.growth_threshold_percent {
            probability += self.weights.growth.max(0.0);
        }
        probability.min(1.0)
    }
}

impl Default for LeakScoring {
    fn default() -> Self {
        Self::from_config(&LeakConfig::default())
    }
}
