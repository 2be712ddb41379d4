//! Resource lifecycle and leak management for dynamically loaded plugins
//!
//! This crate provides the core functionality for:
//! - Allocation tracking with liveness probes
//! - Usage trend analysis and demand prediction
//! - Adaptive pre-allocated resource pools
//! - Leak scoring, prevention and release monitoring
//! - Plugin recovery and isolation
//! - Health reporting and observability

pub mod config;
pub mod error;
pub mod health;
pub mod leak;
pub mod ledger;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod pool;
pub mod recovery;
pub mod releaser;
pub mod runtime;
pub mod scheduler;
pub mod trend;

pub use config::{Environment, FeatureToggle, SentinelConfig};
pub use error::{AllocationError, ConfigError, MonitorError, RecoveryError, ReleaseError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthReport, HealthResponse, ReadinessResponse,
};
pub use ledger::AllocationLedger;
pub use models::*;
pub use observability::{MetricEvent, SentinelMetrics, StructuredLogger};
pub use runtime::{RunningSentinel, Sentinel, SentinelBuilder};
