//! Statistics helpers
//!
//! All variance figures are population variance so repeated runs over the
//! same samples give identical confidence scores.

use std::collections::VecDeque;
use std::time::Duration;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let sum_sq: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (sum_sq / values.len() as f64).sqrt()
}

/// Standard deviation relative to the mean, 0 for a zero mean
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m.abs() < f64::EPSILON {
        return 0.0;
    }
    population_std_dev(values) / m.abs()
}

/// Least-squares slope of y over x
pub fn least_squares_slope(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let x0 = points[0].0;

    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    for (x, y) in points {
        // Shift x to keep the sums well conditioned
        let x = x - x0;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}

/// Coefficient of determination of a linear fit with the given slope
pub fn r_squared(points: &[(f64, f64)], slope: f64) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let x0 = points[0].0;
    let mean_x = points.iter().map(|(x, _)| x - x0).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| *y).sum::<f64>() / n;
    let intercept = mean_y - slope * mean_x;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (x, y) in points {
        let predicted = slope * (x - x0) + intercept;
        ss_res += (y - predicted).powi(2);
        ss_tot += (y - mean_y).powi(2);
    }

    if ss_tot.abs() < f64::EPSILON {
        return 0.0;
    }
    (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
}

/// Time-windowed mean and standard deviation of a value stream
#[derive(Debug, Clone)]
pub struct RollingStats {
    pub mean: f64,
    pub std_dev: f64,
    pub count: u64,
    samples: VecDeque<(i64, f64)>,
    window_secs: i64,
}

impl RollingStats {
    pub fn new(window: Duration) -> Self {
        Self {
            mean: 0.0,
            std_dev: 0.0,
            count: 0,
            samples: VecDeque::new(),
            window_secs: window.as_secs() as i64,
        }
    }

    /// Add a sample taken at `timestamp` (unix seconds)
    pub fn add_sample(&mut self, timestamp: i64, value: f64) {
        let cutoff = timestamp - self.window_secs;
        while let Some((ts, _)) = self.samples.front() {
            if *ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((timestamp, value));
        self.recalculate();
    }

    fn recalculate(&mut self) {
        let values: Vec<f64> = self.samples.iter().map(|(_, v)| *v).collect();
        self.count = values.len() as u64;
        self.mean = mean(&values);
        self.std_dev = population_std_dev(&values);
    }

    pub fn max(&self) -> Option<f64> {
        self.samples
            .iter()
            .map(|(_, v)| *v)
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_population_std_dev() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&values) - 5.0).abs() < 1e-9);
        assert!((population_std_dev(&values) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_coefficient_of_variation() {
        let values = [100.0, 100.0, 100.0, 100.0, 400.0];
        assert!((coefficient_of_variation(&values) - 0.75).abs() < 1e-9);
        assert_eq!(coefficient_of_variation(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_slope_and_fit() {
        let points: Vec<(f64, f64)> = (0..10).map(|i| (i as f64 * 60.0, 1000.0 + i as f64 * 120.0)).collect();
        let slope = least_squares_slope(&points);
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((r_squared(&points, slope) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_values() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(population_std_dev(&[]), 0.0);
        assert_eq!(least_squares_slope(&[]), 0.0);
        assert_eq!(r_squared(&[], 1.0), 0.0);
    }

    #[test]
    fn test_rolling_stats_window() {
        let mut stats = RollingStats::new(Duration::from_secs(100));
        stats.add_sample(0, 10.0);
        stats.add_sample(50, 20.0);
        assert_eq!(stats.count, 2);
        assert!((stats.mean - 15.0).abs() < 1e-9);

        stats.add_sample(200, 30.0);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.max(), Some(30.0));
    }
}
