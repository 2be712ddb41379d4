//! Pool size computation

use crate::config::PoolConfig;
use crate::models::{Priority, ResourcePrediction};
use serde::Serialize;
use std::time::Duration;

/// Memory and handle counts a pool should be created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSize {
    pub memory_bytes: u64,
    pub file_handles: u32,
}

/// Scale applied to predicted memory by expected task duration
pub fn duration_factor(duration: Duration) -> f64 {
    if duration < Duration::from_secs(1) {
        0.5
    } else if duration < Duration::from_secs(10) {
        0.75
    } else {
        1.0
    }
}

/// Size a pool from a prediction, clamped to the configured bounds
pub fn compute_pool_size(prediction: &ResourcePrediction, config: &PoolConfig) -> PoolSize {
    let mut memory = prediction.memory_bytes as f64 * duration_factor(prediction.duration);
    if prediction.priority == Priority::High {
        memory *= 1.0 + config.high_priority_headroom_percent as f64 / 100.0;
    }

    let memory_bytes = (memory.round().max(0.0) as u64).clamp(config.min_pool_bytes, config.max_pool_bytes);
    let file_handles = prediction
        .file_handles
        .clamp(config.min_file_handles, config.max_file_handles);

    PoolSize {
        memory_bytes,
        file_handles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContextKey;

    const MB: u64 = 1024 * 1024;

    fn prediction(memory_bytes: u64, secs: f64, priority: Priority) -> ResourcePrediction {
        ResourcePrediction {
            context_key: ContextKey::new("rust:large"),
            memory_bytes,
            file_handles: 8,
            duration: Duration::from_secs_f64(secs),
            priority,
            confidence: 0.9,
            fallback: false,
        }
    }

    #[test]
    fn test_duration_factor_steps() {
        assert_eq!(duration_factor(Duration::from_millis(500)), 0.5);
        assert_eq!(duration_factor(Duration::from_secs(1)), 0.75);
        assert_eq!(duration_factor(Duration::from_secs(9)), 0.75);
        assert_eq!(duration_factor(Duration::from_secs(10)), 1.0);
    }

    #[test]
    fn test_short_tasks_get_smaller_pools() {
        let config = PoolConfig::default();
        let short = compute_pool_size(&prediction(100 * MB, 0.2, Priority::Normal), &config);
        let long = compute_pool_size(&prediction(100 * MB, 60.0, Priority::Normal), &config);
        assert_eq!(short.memory_bytes, 50 * MB);
        assert_eq!(long.memory_bytes, 100 * MB);
    }

    #[test]
    fn test_high_priority_headroom() {
        let config = PoolConfig::default();
        let size = compute_pool_size(&prediction(100 * MB, 60.0, Priority::High), &config);
        assert_eq!(size.memory_bytes, 120 * MB);
    }

    #[test]
    fn test_clamped_to_bounds() {
        let config = PoolConfig::default();
        let tiny = compute_pool_size(&prediction(10, 60.0, Priority::Low), &config);
        assert_eq!(tiny.memory_bytes, config.min_pool_bytes);

        let huge = compute_pool_size(&prediction(4096 * MB, 60.0, Priority::High), &config);
        assert_eq!(huge.memory_bytes, config.max_pool_bytes);

        let mut many = prediction(MB, 60.0, Priority::Low);
        many.file_handles = 10_000;
        assert_eq!(compute_pool_size(&many, &config).file_handles, 256);
        many.file_handles = 0;
        assert_eq!(compute_pool_size(&many, &config).file_handles, 1);
    }
}
