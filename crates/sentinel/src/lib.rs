//! Standalone resource sentinel service: configuration loading and the
//! probe/metrics HTTP surface

pub mod api;
pub mod config;
