//! Plugin recovery: health signals, eligibility, configuration rollback and
//! isolation

mod config_history;
mod host;
mod isolation;
mod orchestrator;
mod policy;
mod signal;

pub use config_history::{hash_configuration, ConfigChangeReason, ConfigurationHistory, ConfigurationVersion};
pub use host::{
    ConfigurationStore, InMemoryConfigurationStore, InMemoryPluginHost, PluginDescriptor, PluginHost,
    ResourceQuota,
};
pub use isolation::{isolation_quota, IsolationContext, IsolationReason};
pub use orchestrator::{RecoveryEvent, RecoveryOrchestrator, RecoveryOutcome, RecoveryStrategy};
pub use policy::{AttemptRecord, Ineligible, RecoveryPolicy};
pub use signal::{HealthSignal, PluginCondition};
