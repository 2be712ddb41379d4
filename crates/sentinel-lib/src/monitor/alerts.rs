//! Operator alerts with deduplication
//!
//! Each alert is keyed by type and subject (resource id, plugin id or
//! resource type). A key that fired within the dedup window is suppressed.
//! Emitted alerts are logged at a level matching their severity and kept in
//! a bounded ring for health reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default deduplication window (15 minutes)
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 15 * 60;

const DEFAULT_HISTORY: usize = 200;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Alert type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    StuckAllocation,
    OrphanedResource,
    ReleaseRetryExhausted,
    ThresholdBreach,
    LeakSuspected,
    RecoveryFailed,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::StuckAllocation => write!(f, "StuckAllocation"),
            AlertType::OrphanedResource => write!(f, "OrphanedResource"),
            AlertType::ReleaseRetryExhausted => write!(f, "ReleaseRetryExhausted"),
            AlertType::ThresholdBreach => write!(f, "ThresholdBreach"),
            AlertType::LeakSuspected => write!(f, "LeakSuspected"),
            AlertType::RecoveryFailed => write!(f, "RecoveryFailed"),
        }
    }
}

/// One emitted alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    /// What the alert is about
    pub subject: String,
    pub message: String,
    pub labels: BTreeMap<String, String>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            alert_type,
            severity,
            subject: subject.into(),
            message: message.into(),
            labels: BTreeMap::new(),
            raised_at: Utc::now(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.labels.insert(key.into(), value.to_string());
        self
    }

    pub fn at(mut self, raised_at: DateTime<Utc>) -> Self {
        self.raised_at = raised_at;
        self
    }
}

/// Key for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    alert_type: AlertType,
    subject: String,
}

/// Alert emitter with deduplication
pub struct AlertManager {
    dedup_window: chrono::Duration,
    /// Last emission time per key
    recent: RwLock<HashMap<DedupKey, DateTime<Utc>>>,
    history: RwLock<VecDeque<Alert>>,
    history_limit: usize,
}

impl AlertManager {
    /// Create an alert manager with the default 15-minute deduplication window
    pub fn new() -> Self {
        Self::with_settings(Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS), DEFAULT_HISTORY)
    }

    pub fn with_settings(dedup_window: Duration, history_limit: usize) -> Self {
        Self {
            dedup_window: chrono::Duration::from_std(dedup_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_DEDUP_WINDOW_SECS as i64)),
            recent: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            history_limit: history_limit.max(1),
        }
    }

    /// Check if an alert would be suppressed at `now`
    pub fn should_suppress(&self, alert_type: AlertType, subject: &str, now: DateTime<Utc>) -> bool {
        let key = DedupKey {
            alert_type,
            subject: subject.to_string(),
        };
        let recent = self.recent.read().unwrap_or_else(|e| e.into_inner());
        recent
            .get(&key)
            .is_some_and(|last| now - *last < self.dedup_window)
    }

    /// Emit an alert unless it is a duplicate; returns whether it was emitted
    pub fn raise(&self, alert: Alert) -> bool {
        let now = alert.raised_at;
        if self.should_suppress(alert.alert_type, &alert.subject, now) {
            return false;
        }

        {
            let mut recent = self.recent.write().unwrap_or_else(|e| e.into_inner());
            recent.insert(
                DedupKey {
                    alert_type: alert.alert_type,
                    subject: alert.subject.clone(),
                },
                now,
            );
            let window = self.dedup_window;
            recent.retain(|_, last| now - *last < window);
        }

        match alert.severity {
            AlertSeverity::Info => info!(
                event = "alert",
                alert_type = %alert.alert_type,
                subject = %alert.subject,
                "{}", alert.message
            ),
            AlertSeverity::Warning => warn!(
                event = "alert",
                alert_type = %alert.alert_type,
                subject = %alert.subject,
                "{}", alert.message
            ),
            AlertSeverity::Critical => error!(
                event = "alert",
                alert_type = %alert.alert_type,
                subject = %alert.subject,
                "{}", alert.message
            ),
        }

        let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
        history.push_back(alert);
        while history.len() > self.history_limit {
            history.pop_front();
        }
        true
    }

    /// Most recent alerts, oldest first
    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.history
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Alerts raised within `window` before `now`
    pub fn alerts_since(&self, now: DateTime<Utc>, window: Duration) -> Vec<Alert> {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        self.history
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|a| now - a.raised_at <= window)
            .cloned()
            .collect()
    }

    pub fn count_by_severity(&self, alerts: &[Alert], severity: AlertSeverity) -> usize {
        alerts.iter().filter(|a| a.severity == severity).count()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}
