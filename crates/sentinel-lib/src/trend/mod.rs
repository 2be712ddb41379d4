//! Usage trends and resource prediction

mod analyzer;
mod predictor;
pub mod stats;

pub use analyzer::{LifetimeStats, LoadTrend, TrendAnalyzer, UsageSummary};
pub use predictor::{
    derive_priority, FallbackPredictor, Predictor, PredictorStats, StatisticalPredictor,
    FALLBACK_CONFIDENCE,
};
