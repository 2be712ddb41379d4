//! Recovery eligibility
//!
//! A plugin may be recovered while its attempt count is below the maximum
//! and the cooldown since its last attempt has elapsed. Every attempt is
//! counted and timestamped whatever its outcome; only an explicit reset
//! clears the count.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub count: u32,
    pub last_attempt: DateTime<Utc>,
}

/// Why an attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Ineligible {
    AttemptsExhausted { attempts: u32 },
    CoolingDown { remaining_secs: i64 },
}

pub struct RecoveryPolicy {
    max_attempts: u32,
    cooldown: chrono::Duration,
    attempts: DashMap<String, AttemptRecord>,
}

impl RecoveryPolicy {
    pub fn new(max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            max_attempts,
            cooldown: chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            attempts: DashMap::new(),
        }
    }

    fn check(&self, record: &AttemptRecord, now: DateTime<Utc>) -> Result<(), Ineligible> {
        if record.count >= self.max_attempts {
            return Err(Ineligible::AttemptsExhausted {
                attempts: record.count,
            });
        }
        let elapsed = now - record.last_attempt;
        if elapsed < self.cooldown {
            return Err(Ineligible::CoolingDown {
                remaining_secs: (self.cooldown - elapsed).num_seconds(),
            });
        }
        Ok(())
    }

    pub fn is_eligible(&self, plugin_id: &str, now: DateTime<Utc>) -> bool {
        self.attempts
            .get(plugin_id)
            .map(|r| self.check(&r, now).is_ok())
            .unwrap_or(true)
    }

    /// Check eligibility and record the attempt in one step; returns the
    /// attempt number
    pub fn try_begin(&self, plugin_id: &str, now: DateTime<Utc>) -> Result<u32, Ineligible> {
        match self.attempts.entry(plugin_id.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(AttemptRecord {
                    count: 1,
                    last_attempt: now,
                });
                Ok(1)
            }
            Entry::Occupied(mut entry) => {
                self.check(entry.get(), now)?;
                let record = entry.get_mut();
                record.count += 1;
                record.last_attempt = now;
                Ok(record.count)
            }
        }
    }

    pub fn attempts(&self, plugin_id: &str) -> u32 {
        self.attempts.get(plugin_id).map(|r| r.count).unwrap_or(0)
    }

    pub fn record(&self, plugin_id: &str) -> Option<AttemptRecord> {
        self.attempts.get(plugin_id).map(|r| *r)
    }

    /// Operator reset of a plugin's attempt history
    pub fn reset(&self, plugin_id: &str) -> bool {
        self.attempts.remove(plugin_id).is_some()
    }
}
