//! Configuration loader with layered sources.

use crate::settings::ConveyorConfig;
use config::{Config, Environment, File, FileFormat};
use conveyor_core::{ConveyorError, ConveyorResult};
use std::path::Path;
use tracing::{debug, info};

/// Environment variable prefix for overrides, e.g.
/// `CONVEYOR__RETRY_POLICY__MAX_RETRIES=5`.
const ENV_PREFIX: &str = "CONVEYOR";

/// Loads and validates configuration from a file plus environment overrides.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from the default location (`./conveyor.toml`).
    pub fn from_default_location() -> ConveyorResult<ConveyorConfig> {
        Self::from_file("conveyor.toml")
    }

    /// Loads configuration from the given file, layered under environment
    /// variable overrides. The file may be absent; the environment alone must
    /// then supply a complete configuration.
    pub fn from_file(path: impl AsRef<Path>) -> ConveyorResult<ConveyorConfig> {
        let path = path.as_ref();
        if path.exists() {
            debug!(path = %path.display(), "Loading configuration file");
        }

        let builder = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );

        Self::finish(builder)
    }

    /// Parses configuration from an inline TOML string (tests and embedders).
    pub fn from_toml_str(toml: &str) -> ConveyorResult<ConveyorConfig> {
        let builder = Config::builder().add_source(File::from_str(toml, FileFormat::Toml));
        Self::finish(builder)
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> ConveyorResult<ConveyorConfig> {
        let raw = builder
            .build()
            .map_err(|e| ConveyorError::configuration(e.to_string()))?;

        let config: ConveyorConfig = raw
            .try_deserialize()
            .map_err(|e| ConveyorError::configuration(e.to_string()))?;

        config.validate()?;

        info!(
            providers = config.providers.len(),
            queues = config.queues.len(),
            "Configuration loaded"
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        default_provider = "memory"

        [[providers]]
        name = "memory"
        type = "memory"

        [[providers]]
        name = "cache"
        type = "redis"
        config = { url = "redis://localhost:6379", pool_size = 4 }

        [queues.default]
        provider = "memory"

        [queues.events]
        provider = "cache"
        options = { durable = false }

        [retry_policy]
        max_retries = 5
        retry_delay_ms = 250
        exponential_backoff = false

        [monitoring]
        metrics_interval_ms = 2000
        health_check_interval_ms = 3000
    "#;

    #[test]
    fn test_load_from_toml() {
        let config = ConfigLoader::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.default_provider, "memory");
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.retry_policy.max_retries, 5);
        assert!(!config.retry_policy.exponential_backoff);
        assert_eq!(config.monitoring.metrics_interval_ms, 2000);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let result = ConfigLoader::from_toml_str("default_provider = ");
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_runs_on_load() {
        let toml = r#"
            default_provider = "ghost"

            [[providers]]
            name = "memory"
            type = "memory"
        "#;
        let err = ConfigLoader::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_unknown_queue_option_rejected() {
        let toml = r#"
            default_provider = "memory"

            [[providers]]
            name = "memory"
            type = "memory"

            [queues.default]
            provider = "memory"
            options = { bogus = true }
        "#;
        assert!(ConfigLoader::from_toml_str(toml).is_err());
    }
}
