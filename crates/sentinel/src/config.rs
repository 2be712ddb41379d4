//! Service configuration
//!
//! Sources, later ones overriding earlier ones:
//! 1. defaults compiled into [`SentinelConfig`]
//! 2. an optional file named by `SENTINEL_CONFIG`
//! 3. environment variables prefixed `SENTINEL__`, nested with `__`
//!    (for example `SENTINEL__LEAK__AUTO_RECOVERY_THRESHOLD=0.8`)

use anyhow::{Context, Result};
use sentinel_lib::config::{validate, SentinelConfig};

/// Environment variable naming the optional configuration file
pub const CONFIG_PATH_ENV: &str = "SENTINEL_CONFIG";

pub const DEFAULT_API_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Port for the probe and metrics server
    pub api_port: u16,
    pub sentinel: SentinelConfig,
}

impl ServiceConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(std::env::var(CONFIG_PATH_ENV).ok().as_deref())
    }

    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("SENTINEL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration sources")?;

        let api_port = match settings.get::<u16>("api_port") {
            Ok(port) => port,
            Err(config::ConfigError::NotFound(_)) => DEFAULT_API_PORT,
            Err(e) => return Err(e).context("invalid api_port"),
        };
        let sentinel: SentinelConfig = settings
            .try_deserialize()
            .context("failed to parse sentinel configuration")?;
        validate(&sentinel)?;

        Ok(Self { api_port, sentinel })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_lib::Environment;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let config = ServiceConfig::load_from(None).unwrap();
        assert_eq!(config.api_port, DEFAULT_API_PORT);
        assert_eq!(config.sentinel.monitor.orphan_timeout_secs, 3600);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = write_config(
            r#"
api_port = 9100
environment = "staging"

[monitor]
sweep_interval_secs = 60

[recovery]
max_attempts = 5
"#,
        );
        let config = ServiceConfig::load_from(file.path().to_str()).unwrap();

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.sentinel.environment, Environment::Staging);
        assert_eq!(config.sentinel.monitor.sweep_interval_secs, 60);
        assert_eq!(config.sentinel.recovery.max_attempts, 5);
        // Untouched sections keep their defaults
        assert_eq!(config.sentinel.recovery.cooldown_secs, 300);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let file = write_config(
            r#"
environment = "production"

[leak.emergency_cleanup]
enabled = true
allowed_environments = ["development"]
"#,
        );
        let err = ServiceConfig::load_from(file.path().to_str()).unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }

    #[test]
    fn test_malformed_api_port_is_rejected() {
        for bad in [r#"api_port = "abc""#, "api_port = 70000"] {
            let file = write_config(bad);
            let err = ServiceConfig::load_from(file.path().to_str()).unwrap_err();
            assert!(err.to_string().contains("invalid api_port"), "{}", bad);
        }
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ServiceConfig::load_from(Some("/nonexistent/sentinel.toml")).is_err());
    }
}
