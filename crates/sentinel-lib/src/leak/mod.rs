//! Leak detection and prevention

mod detector;
mod growth;
mod prevention;
mod scoring;

pub use detector::{
    LeakAnalysis, LeakDetector, LivenessReport, RecoveryFailure, ResourceTypeMetrics,
    ScanCycleReport,
};
pub use growth::{GrowthAnalyzer, GrowthTrend};
pub use prevention::{PreventionReport, PreventionSystem, ThresholdBreach};
pub use scoring::{LeakScoring, LeakSignals};
