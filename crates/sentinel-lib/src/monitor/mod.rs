//! Release monitoring and alerting

mod alerts;
mod release;

pub use alerts::{Alert, AlertManager, AlertSeverity, AlertType};
pub use release::{ReleaseMonitor, SweepReport};
