//! Usage history per context key

use super::stats::{self, RollingStats};
use crate::config::TrendConfig;
use crate::ledger::ReleaseEvent;
use crate::models::{ContextKey, ResourceType, UsageRecord, UsageStats};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// Summary statistics over the most recent records of one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub samples: usize,
    pub mean_memory_bytes: f64,
    pub std_memory_bytes: f64,
    pub mean_duration_secs: f64,
    pub std_duration_secs: f64,
    pub mean_file_handles: f64,
    /// Mean of the memory and duration coefficients of variation
    pub mean_variation: f64,
}

/// Direction of system-wide memory usage over the trend window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadTrend {
    pub increasing: bool,
    pub slope_bytes_per_sec: f64,
    pub samples: usize,
}

impl LoadTrend {
    fn flat(samples: usize) -> Self {
        Self {
            increasing: false,
            slope_bytes_per_sec: 0.0,
            samples,
        }
    }
}

/// Rolling lifetime statistics for released resources of one type
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LifetimeStats {
    pub count: u64,
    pub mean_ms: f64,
    pub std_ms: f64,
}

/// Owner of all usage history
pub struct TrendAnalyzer {
    history: DashMap<ContextKey, VecDeque<UsageRecord>>,
    lifetimes: DashMap<ResourceType, RollingStats>,
    config: TrendConfig,
}

impl TrendAnalyzer {
    pub fn new(config: TrendConfig) -> Self {
        Self {
            history: DashMap::new(),
            lifetimes: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &TrendConfig {
        &self.config
    }

    pub fn record_usage(&self, key: ContextKey, usage: UsageStats) {
        self.record_usage_at(key, usage, Utc::now());
    }

    /// Append a usage sample observed at `now`, evicting expired samples
    pub fn record_usage_at(&self, key: ContextKey, usage: UsageStats, now: DateTime<Utc>) {
        let record = UsageRecord {
            timestamp: now,
            context_key: key.clone(),
            memory_bytes: usage.memory_bytes,
            file_handles: usage.file_handles,
            duration: usage.duration,
        };

        let cutoff = self.cutoff(now);
        let cap = self.config.max_samples_per_key.max(1);
        let mut entry = self.history.entry(key.clone()).or_default();
        entry.push_back(record);
        while entry.front().is_some_and(|r| r.timestamp < cutoff) {
            entry.pop_front();
        }
        while entry.len() > cap {
            entry.pop_front();
        }
        debug!(key = %key, samples = entry.len(), "Recorded usage sample");
    }

    /// Feed a completed release into the per-type lifetime statistics
    pub fn record_release(&self, event: &ReleaseEvent) {
        let window = self.config.retention();
        let mut stats = self
            .lifetimes
            .entry(event.resource_type)
            .or_insert_with(|| RollingStats::new(window));
        stats.add_sample(
            event.released_at.timestamp(),
            event.lifetime.as_millis() as f64,
        );
    }

    pub fn lifetime_stats(&self, resource_type: ResourceType) -> Option<LifetimeStats> {
        self.lifetimes.get(&resource_type).map(|s| LifetimeStats {
            count: s.count,
            mean_ms: s.mean,
            std_ms: s.std_dev,
        })
    }

    /// Copy of the history for a key, oldest first
    pub fn history(&self, key: &ContextKey) -> Vec<UsageRecord> {
        self.history
            .get(key)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn history_len(&self, key: &ContextKey) -> usize {
        self.history.get(key).map(|h| h.len()).unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<ContextKey> {
        let mut keys: Vec<ContextKey> = self.history.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Statistics over the `n` most recent records of a key
    pub fn recent_stats(&self, key: &ContextKey, n: usize) -> Option<UsageSummary> {
        let history = self.history.get(key)?;
        let skip = history.len().saturating_sub(n);
        let recent: Vec<&UsageRecord> = history.iter().skip(skip).collect();
        if recent.is_empty() {
            return None;
        }

        let memory: Vec<f64> = recent.iter().map(|r| r.memory_bytes as f64).collect();
        let durations: Vec<f64> = recent.iter().map(|r| r.duration.as_secs_f64()).collect();
        let handles: Vec<f64> = recent.iter().map(|r| r.file_handles as f64).collect();

        let mean_variation = (stats::coefficient_of_variation(&memory)
            + stats::coefficient_of_variation(&durations))
            / 2.0;

        Some(UsageSummary {
            samples: recent.len(),
            mean_memory_bytes: stats::mean(&memory),
            std_memory_bytes: stats::population_std_dev(&memory),
            mean_duration_secs: stats::mean(&durations),
            std_duration_secs: stats::population_std_dev(&durations),
            mean_file_handles: stats::mean(&handles),
            mean_variation,
        })
    }

    pub fn load_trend(&self) -> LoadTrend {
        self.load_trend_at(Utc::now())
    }

    /// System-wide memory trend over the load window ending at `now`
    ///
    /// Uses the slope between the first and last sample in the window.
    pub fn load_trend_at(&self, now: DateTime<Utc>) -> LoadTrend {
        let window = chrono::Duration::from_std(self.config.load_trend_window())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let start = now - window;

        let mut samples: Vec<(DateTime<Utc>, u64)> = self
            .history
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|r| r.timestamp >= start && r.timestamp <= now)
                    .map(|r| (r.timestamp, r.memory_bytes))
                    .collect::<Vec<_>>()
            })
            .collect();

        if samples.len() < 2 {
            return LoadTrend::flat(samples.len());
        }
        samples.sort_by_key(|(ts, _)| *ts);

        let (first_ts, first_mem) = samples[0];
        let (last_ts, last_mem) = samples[samples.len() - 1];
        let elapsed = (last_ts - first_ts).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return LoadTrend::flat(samples.len());
        }

        let slope = (last_mem as f64 - first_mem as f64) / elapsed;
        LoadTrend {
            increasing: slope > 0.0,
            slope_bytes_per_sec: slope,
            samples: samples.len(),
        }
    }

    /// Drop samples past retention and keys left empty; returns samples dropped
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        let mut dropped = 0;
        for mut entry in self.history.iter_mut() {
            let before = entry.len();
            entry.retain(|r| r.timestamp >= cutoff);
            dropped += before - entry.len();
        }
        self.history.retain(|_, h| !h.is_empty());
        if dropped > 0 {
            debug!(dropped, "Evicted expired usage samples");
        }
        dropped
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let retention = chrono::Duration::from_std(self.config.retention())
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        now - retention
    }
}

impl Default for TrendAnalyzer {
    fn default() -> Self {
        Self::new(TrendConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MB: u64 = 1024 * 1024;

    fn usage(memory_bytes: u64, file_handles: u32, duration: Duration) -> UsageStats {
        UsageStats::new(memory_bytes, file_handles, duration)
    }

    fn key() -> ContextKey {
        ContextKey::new("rust:large")
    }

    #[test]
    fn test_retention_evicts_old_samples() {
        let analyzer = TrendAnalyzer::default();
        let start = Utc::now();
        analyzer.record_usage_at(key(), usage(MB, 1, Duration::from_secs(1)), start);
        analyzer.record_usage_at(
            key(),
            usage(MB, 1, Duration::from_secs(1)),
            start + chrono::Duration::minutes(61),
        );
        assert_eq!(analyzer.history_len(&key()), 1);
    }

    #[test]
    fn test_history_is_capped() {
        let analyzer = TrendAnalyzer::default();
        let start = Utc::now();
        for i in 0..150 {
            analyzer.record_usage_at(
                key(),
                usage(i, 1, Duration::from_secs(1)),
                start + chrono::Duration::seconds(i as i64),
            );
        }
        let history = analyzer.history(&key());
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].memory_bytes, 50);
    }

    #[test]
    fn test_recent_stats_uses_last_n() {
        let analyzer = TrendAnalyzer::default();
        let start = Utc::now();
        for (i, mem) in [900, 900, 100, 100, 100, 100, 400].iter().enumerate() {
            analyzer.record_usage_at(
                key(),
                usage(mem * MB, 2, Duration::from_secs(10)),
                start + chrono::Duration::seconds(i as i64),
            );
        }
        let summary = analyzer.recent_stats(&key(), 5).unwrap();
        assert_eq!(summary.samples, 5);
        assert!((summary.mean_memory_bytes - 160.0 * MB as f64).abs() < 1.0);
        assert!((summary.std_memory_bytes - 120.0 * MB as f64).abs() < 1.0);
        assert!((summary.mean_variation - 0.375).abs() < 1e-9);
        assert!(analyzer.recent_stats(&ContextKey::new("missing"), 5).is_none());
    }

    #[test]
    fn test_load_trend_needs_two_samples() {
        let analyzer = TrendAnalyzer::default();
        let now = Utc::now();
        assert!(!analyzer.load_trend_at(now).increasing);

        analyzer.record_usage_at(key(), usage(MB, 1, Duration::from_secs(1)), now);
        let trend = analyzer.load_trend_at(now);
        assert_eq!(trend.samples, 1);
        assert!(!trend.increasing);
    }

    #[test]
    fn test_load_trend_direction() {
        let analyzer = TrendAnalyzer::default();
        let now = Utc::now();
        analyzer.record_usage_at(
            ContextKey::new("a:small"),
            usage(MB, 1, Duration::from_secs(1)),
            now - chrono::Duration::seconds(120),
        );
        analyzer.record_usage_at(
            ContextKey::new("b:small"),
            usage(3 * MB, 1, Duration::from_secs(1)),
            now - chrono::Duration::seconds(20),
        );
        let trend = analyzer.load_trend_at(now);
        assert!(trend.increasing);
        assert_eq!(trend.samples, 2);

        // Samples outside the 5 minute window are ignored
        analyzer.record_usage_at(
            ContextKey::new("c:small"),
            usage(10 * MB, 1, Duration::from_secs(1)),
            now - chrono::Duration::seconds(400),
        );
        assert_eq!(analyzer.load_trend_at(now).samples, 2);

        analyzer.record_usage_at(ContextKey::new("d:small"), usage(0, 1, Duration::from_secs(1)), now);
        assert!(!analyzer.load_trend_at(now).increasing);
    }

    #[test]
    fn test_evict_expired_drops_empty_keys() {
        let analyzer = TrendAnalyzer::default();
        let start = Utc::now();
        analyzer.record_usage_at(key(), usage(MB, 1, Duration::from_secs(1)), start);
        let dropped = analyzer.evict_expired(start + chrono::Duration::hours(2));
        assert_eq!(dropped, 1);
        assert!(analyzer.keys().is_empty());
    }

    #[test]
    fn test_release_lifetimes() {
        let analyzer = TrendAnalyzer::default();
        let now = Utc::now();
        for secs in [10, 30] {
            analyzer.record_release(&ReleaseEvent {
                id: format!("r{}", secs),
                resource_type: ResourceType::FileHandle,
                owner: "plugin".to_string(),
                lifetime: Duration::from_secs(secs),
                released_at: now,
            });
        }
        let stats = analyzer.lifetime_stats(ResourceType::FileHandle).unwrap();
        assert_eq!(stats.count, 2);
        assert!((stats.mean_ms - 20_000.0).abs() < 1e-9);
        assert!(analyzer.lifetime_stats(ResourceType::Memory).is_none());
    }
}
