//! Core data models shared by every sentinel component

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind of resource a plugin can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Memory,
    FileHandle,
    DatabaseConnection,
    NetworkSocket,
    ThreadPool,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Memory,
        ResourceType::FileHandle,
        ResourceType::DatabaseConnection,
        ResourceType::NetworkSocket,
        ResourceType::ThreadPool,
    ];

    /// Label used for metrics and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Memory => "memory",
            ResourceType::FileHandle => "file_handle",
            ResourceType::DatabaseConnection => "database_connection",
            ResourceType::NetworkSocket => "network_socket",
            ResourceType::ThreadPool => "thread_pool",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a tracked allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationState {
    Active,
    Released,
    Orphaned,
}

/// One live resource grant
///
/// Released and orphaned records always carry `released_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: String,
    pub resource_type: ResourceType,
    pub owner: String,
    pub allocated_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub state: AllocationState,
    /// Estimated size in bytes, 0 when unknown
    pub estimated_bytes: u64,
}

impl ResourceAllocation {
    pub fn new(
        id: impl Into<String>,
        resource_type: ResourceType,
        owner: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type,
            owner: owner.into(),
            allocated_at: now,
            last_access: now,
            released_at: None,
            state: AllocationState::Active,
            estimated_bytes: 0,
        }
    }

    pub fn with_estimated_bytes(mut self, bytes: u64) -> Self {
        self.estimated_bytes = bytes;
        self
    }

    pub fn is_active(&self) -> bool {
        self.state == AllocationState::Active
    }

    /// Time since the allocation was granted
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.allocated_at).to_std().unwrap_or_default()
    }

    /// Time since the owner last touched the allocation
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_access).to_std().unwrap_or_default()
    }

    /// Lifetime from grant to release (or to `now` while still active)
    pub fn lifetime(&self, now: DateTime<Utc>) -> Duration {
        let end = self.released_at.unwrap_or(now);
        (end - self.allocated_at).to_std().unwrap_or_default()
    }
}

/// Key grouping usage history: validation type plus a size bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey(String);

impl ContextKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the key for a validation request of the given source size
    pub fn for_request(validation_type: &str, size_bytes: u64) -> Self {
        let bucket = match size_bytes {
            0..=4_095 => "tiny",
            4_096..=65_535 => "small",
            65_536..=1_048_575 => "medium",
            _ => "large",
        };
        Self(format!("{}:{}", validation_type, bucket))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observed resource consumption of one validation run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub memory_bytes: u64,
    pub file_handles: u32,
    pub duration: Duration,
}

impl UsageStats {
    pub fn new(memory_bytes: u64, file_handles: u32, duration: Duration) -> Self {
        Self {
            memory_bytes,
            file_handles,
            duration,
        }
    }
}

/// Immutable usage sample stored by the trend analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub context_key: ContextKey,
    pub memory_bytes: u64,
    pub file_handles: u32,
    pub duration: Duration,
}

/// A validation request as seen by the predictor and pool manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub validation_type: String,
    pub source_size_bytes: u64,
    pub estimated_complexity: u32,
    pub high_priority: bool,
}

impl ValidationRequest {
    pub fn new(validation_type: impl Into<String>, source_size_bytes: u64) -> Self {
        Self {
            validation_type: validation_type.into(),
            source_size_bytes,
            estimated_complexity: 0,
            high_priority: false,
        }
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.estimated_complexity = complexity;
        self
    }

    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }

    pub fn context_key(&self) -> ContextKey {
        ContextKey::for_request(&self.validation_type, self.source_size_bytes)
    }
}

/// Scheduling priority attached to a prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Predicted resource needs for a validation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePrediction {
    pub context_key: ContextKey,
    pub memory_bytes: u64,
    pub file_handles: u32,
    pub duration: Duration,
    pub priority: Priority,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// True when produced without enough history
    pub fallback: bool,
}

/// Point-in-time resource usage of a plugin
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub file_handles: u32,
    pub network_connections: u32,
}
