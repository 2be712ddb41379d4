//! Memory growth detection
//!
//! Fits a least-squares line over memory samples and requires a
//! consistently increasing pattern before reporting growth.

use crate::trend::stats;
use serde::Serialize;
use std::time::Duration;

/// Minimum samples required for growth detection
const MIN_SAMPLES_FOR_DETECTION: usize = 5;

/// Fraction of sample pairs that must not decrease
const MONOTONICITY_THRESHOLD: f64 = 0.8;

/// Detected growth pattern
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowthTrend {
    pub slope_bytes_per_sec: f64,
    pub monotonicity: f64,
    pub r_squared: f64,
    /// R² scaled by monotonicity, in [0, 1]
    pub confidence: f64,
    pub current_bytes: u64,
    pub samples_analyzed: usize,
}

/// Detects sustained memory growth over a sample window
#[derive(Debug, Clone)]
pub struct GrowthAnalyzer {
    /// Time window for analysis
    pub window_size: Duration,
    /// Minimum slope (bytes/sec) to consider growth
    pub slope_threshold: f64,
}

impl GrowthAnalyzer {
    pub fn new(window_size: Duration, slope_threshold: f64) -> Self {
        Self {
            window_size,
            slope_threshold,
        }
    }

    /// Detect growth in `(timestamp_secs, bytes)` samples sorted by time
    pub fn detect(&self, samples: &[(i64, u64)]) -> Option<GrowthTrend> {
        let latest_ts = samples.last().map(|(ts, _)| *ts)?;
        let window_start = latest_ts - self.window_size.as_secs() as i64;
        let window: Vec<(f64, f64)> = samples
            .iter()
            .filter(|(ts, _)| *ts >= window_start)
            .map(|(ts, bytes)| (*ts as f64, *bytes as f64))
            .collect();
        if window.len() < MIN_SAMPLES_FOR_DETECTION {
            return None;
        }

        let slope = stats::least_squares_slope(&window);
        if slope <= self.slope_threshold {
            return None;
        }

        let monotonicity = Self::monotonicity(&window);
        if monotonicity < MONOTONICITY_THRESHOLD {
            return None;
        }

        let r_squared = stats::r_squared(&window, slope);
        Some(GrowthTrend {
            slope_bytes_per_sec: slope,
            monotonicity,
            r_squared,
            confidence: (r_squared * monotonicity).clamp(0.0, 1.0),
            current_bytes: samples.last().map(|(_, b)| *b).unwrap_or(0),
            samples_analyzed: window.len(),
        })
    }

    fn monotonicity(samples: &[(f64, f64)]) -> f64 {
        if samples.len() < 2 {
            return 0.0;
        }
        let increasing = samples.windows(2).filter(|w| w[1].1 >= w[0].1).count();
        increasing as f64 / (samples.len() - 1) as f64
    }
}

impl Default for GrowthAnalyzer {
    fn default() -> Self {
        Self {
            window_size: Duration::from_secs(3600),
            slope_threshold: 0.0,
        }
    }
}
