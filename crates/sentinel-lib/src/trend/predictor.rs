//! Resource need prediction from usage history

use super::analyzer::TrendAnalyzer;
use crate::config::TrendConfig;
use crate::models::{Priority, ResourcePrediction, ValidationRequest};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Confidence reported for every fallback prediction
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Weight of the consistency term in the confidence blend
const CONSISTENCY_WEIGHT: f64 = 0.7;

/// Weight of the history-size term in the confidence blend
const HISTORY_WEIGHT: f64 = 0.3;

/// Trait for prediction implementations
pub trait Predictor: Send + Sync {
    /// Predict the resources a validation request will need
    fn predict(&self, request: &ValidationRequest) -> ResourcePrediction;
}

/// Priority from the explicit flag, then from estimated complexity
pub fn derive_priority(request: &ValidationRequest) -> Priority {
    if request.high_priority || request.estimated_complexity > 100 {
        Priority::High
    } else if request.estimated_complexity > 50 {
        Priority::Normal
    } else {
        Priority::Low
    }
}

/// Conservative prediction used while history is insufficient
pub struct FallbackPredictor;

impl FallbackPredictor {
    pub fn predict(request: &ValidationRequest, config: &TrendConfig) -> ResourcePrediction {
        ResourcePrediction {
            context_key: request.context_key(),
            memory_bytes: request
                .source_size_bytes
                .saturating_mul(config.fallback_memory_multiplier),
            file_handles: config.fallback_file_handles,
            duration: Duration::from_secs(config.fallback_duration_secs),
            priority: derive_priority(request),
            confidence: FALLBACK_CONFIDENCE,
            fallback: true,
        }
    }
}

/// Prediction statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictorStats {
    pub total_predictions: u64,
    pub fallback_predictions: u64,
}

/// Predictor built on the recent history of the request's context key
pub struct StatisticalPredictor {
    trend: Arc<TrendAnalyzer>,
    prediction_count: AtomicU64,
    fallback_count: AtomicU64,
}

impl StatisticalPredictor {
    pub fn new(trend: Arc<TrendAnalyzer>) -> Self {
        Self {
            trend,
            prediction_count: AtomicU64::new(0),
            fallback_count: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> PredictorStats {
        PredictorStats {
            total_predictions: self.prediction_count.load(Ordering::Relaxed),
            fallback_predictions: self.fallback_count.load(Ordering::Relaxed),
        }
    }
}

impl Predictor for StatisticalPredictor {
    fn predict(&self, request: &ValidationRequest) -> ResourcePrediction {
        self.prediction_count.fetch_add(1, Ordering::Relaxed);
        let config = self.trend.config();
        let key = request.context_key();
        let history_len = self.trend.history_len(&key);

        let summary = if history_len < config.min_records {
            None
        } else {
            self.trend.recent_stats(&key, config.recent_window)
        };

        let Some(summary) = summary else {
            self.fallback_count.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, history_len, "Insufficient history, using fallback prediction");
            return FallbackPredictor::predict(request, config);
        };

        let consistency = 1.0 / (1.0 + summary.mean_variation);
        let history_factor = if config.min_records == 0 {
            1.0
        } else {
            (history_len as f64 / config.min_records as f64).min(1.0)
        };
        let confidence =
            (CONSISTENCY_WEIGHT * consistency + HISTORY_WEIGHT * history_factor).clamp(0.0, 1.0);

        let memory = (summary.mean_memory_bytes + summary.std_memory_bytes).round();
        let prediction = ResourcePrediction {
            context_key: key,
            memory_bytes: memory.max(0.0) as u64,
            file_handles: summary.mean_file_handles.ceil().max(1.0) as u32,
            duration: Duration::from_secs_f64(summary.mean_duration_secs.max(0.0)),
            priority: derive_priority(request),
            confidence,
            fallback: false,
        };

        debug!(
            key = %prediction.context_key,
            memory_bytes = prediction.memory_bytes,
            confidence = prediction.confidence,
            "Prediction generated"
        );
        prediction
    }
}
