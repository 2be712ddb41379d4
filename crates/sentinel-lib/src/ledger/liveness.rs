//! Owner-held liveness tokens
//!
//! The owner of a resource keeps a [`LivenessGuard`]; the ledger keeps the
//! matching [`LivenessProbe`], which never keeps the guard alive. Once the
//! guard is dropped the probe reports the backing object as unreachable.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug)]
struct LivenessCell {
    resource_id: String,
    last_heartbeat_ms: AtomicI64,
}

/// Owning side of a liveness token
#[derive(Debug)]
pub struct LivenessGuard {
    cell: Arc<LivenessCell>,
}

impl LivenessGuard {
    /// Create a guard and its non-owning probe
    pub fn new(resource_id: impl Into<String>) -> (Self, LivenessProbe) {
        let cell = Arc::new(LivenessCell {
            resource_id: resource_id.into(),
            last_heartbeat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        });
        let probe = LivenessProbe {
            cell: Arc::downgrade(&cell),
        };
        (Self { cell }, probe)
    }

    pub fn resource_id(&self) -> &str {
        &self.cell.resource_id
    }

    /// Confirm the owner is still using the resource
    pub fn heartbeat(&self) {
        self.cell
            .last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Non-owning, checkable side of a liveness token
#[derive(Debug, Clone)]
pub struct LivenessProbe {
    cell: Weak<LivenessCell>,
}

impl LivenessProbe {
    /// Whether the owner still holds its guard
    pub fn is_alive(&self) -> bool {
        self.cell.strong_count() > 0
    }

    /// Last heartbeat, or `None` once the guard is gone
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        let cell = self.cell.upgrade()?;
        let ms = cell.last_heartbeat_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_follows_guard() {
        let (guard, probe) = LivenessGuard::new("r1");
        assert!(probe.is_alive());
        assert!(probe.last_heartbeat().is_some());
        assert_eq!(guard.resource_id(), "r1");

        drop(guard);
        assert!(!probe.is_alive());
        assert!(probe.last_heartbeat().is_none());
    }

    #[test]
    fn test_probe_does_not_keep_guard_alive() {
        let (guard, probe) = LivenessGuard::new("r1");
        let second = probe.clone();
        drop(guard);
        assert!(!second.is_alive());
    }

    #[test]
    fn test_heartbeat_moves_forward() {
        let (guard, probe) = LivenessGuard::new("r1");
        let before = probe.last_heartbeat().unwrap();
        guard.heartbeat();
        let after = probe.last_heartbeat().unwrap();
        assert!(after >= before);
    }
}
