//! Configuration schema.
//!
//! Every struct that accepts user input denies unknown fields, so a typo in a
//! config file aborts startup instead of being silently ignored.

use conveyor_core::{ConveyorError, ConveyorResult, ProviderKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use validator::Validate;

/// Top-level configuration accepted by the queue manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConveyorConfig {
    /// Provider used when a queue binding does not name one.
    pub default_provider: String,

    /// Declared transport providers.
    pub providers: Vec<ProviderConfig>,

    /// Declared queues: name -> binding.
    #[serde(default)]
    pub queues: HashMap<String, QueueBinding>,

    /// Global retry policy defaults.
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,

    /// Periodic metrics and health-check settings.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl ConveyorConfig {
    /// Minimal configuration: a single in-memory provider and no queues.
    pub fn in_memory() -> Self {
        Self {
            default_provider: "memory".to_string(),
            providers: vec![ProviderConfig {
                name: "memory".to_string(),
                kind: ProviderKind::Memory,
                settings: ProviderSettings::default(),
            }],
            queues: HashMap::new(),
            retry_policy: RetryPolicyConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }

    /// Declares a queue on the default provider.
    #[must_use]
    pub fn with_queue(mut self, name: impl Into<String>) -> Self {
        self.queues.insert(
            name.into(),
            QueueBinding {
                provider: self.default_provider.clone(),
                options: QueueOptions::default(),
            },
        );
        self
    }

    /// Validates the whole configuration. Any violation aborts startup.
    pub fn validate(&self) -> ConveyorResult<()> {
        if self.providers.is_empty() {
            return Err(ConveyorError::configuration(
                "at least one provider must be declared",
            ));
        }

        let mut names = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(ConveyorError::configuration("provider name must be non-empty"));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(ConveyorError::configuration(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
            provider.settings.validate_for(provider.kind, &provider.name)?;
        }

        if !names.contains(self.default_provider.as_str()) {
            return Err(ConveyorError::configuration(format!(
                "default provider is not declared: {}",
                self.default_provider
            )));
        }

        for (queue, binding) in &self.queues {
            if queue.trim().is_empty() {
                return Err(ConveyorError::configuration("queue name must be non-empty"));
            }
            if !names.contains(binding.provider.as_str()) {
                return Err(ConveyorError::configuration(format!(
                    "queue {queue} references undeclared provider: {}",
                    binding.provider
                )));
            }
        }

        self.monitoring
            .validate()
            .map_err(|e| ConveyorError::configuration(format!("monitoring: {e}")))?;
        self.retry_policy
            .validate()
            .map_err(|e| ConveyorError::configuration(format!("retry_policy: {e}")))?;

        Ok(())
    }
}

/// A declared transport provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Provider name referenced by queue bindings.
    pub name: String,

    /// Backend kind. Unknown kinds are rejected at deserialization.
    #[serde(rename = "type")]
    pub kind: ProviderKind,

    /// Backend-specific settings.
    #[serde(default, rename = "config")]
    pub settings: ProviderSettings,
}

/// Backend-specific provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    /// Connection URL: Redis URL, AMQP URI, Kafka bootstrap servers, or an
    /// SQS endpoint override.
    pub url: Option<String>,

    /// Connection pool size (Redis).
    pub pool_size: Option<usize>,

    /// Key prefix for backend keys (Redis).
    pub key_prefix: Option<String>,

    /// Consumer group id (Kafka).
    pub consumer_group: Option<String>,

    /// Region (SQS).
    pub region: Option<String>,

    /// Per-consumer prefetch count (AMQP).
    pub prefetch: Option<u16>,

    /// Maximum messages held per queue (in-memory).
    pub max_queue_length: Option<usize>,

    /// Maximum accepted payload size in bytes.
    pub max_payload_bytes: Option<usize>,
}

impl ProviderSettings {
    fn validate_for(&self, kind: ProviderKind, name: &str) -> ConveyorResult<()> {
        let requires_url = matches!(
            kind,
            ProviderKind::Redis | ProviderKind::Amqp | ProviderKind::Kafka
        );
        if requires_url && self.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
            return Err(ConveyorError::configuration(format!(
                "provider {name} ({kind}) requires a url"
            )));
        }
        if let Some(0) = self.pool_size {
            return Err(ConveyorError::configuration(format!(
                "provider {name}: pool_size must be positive"
            )));
        }
        Ok(())
    }
}

/// Binds a queue name to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueBinding {
    /// Declared provider name.
    pub provider: String,

    /// Queue options passed through to the backend.
    #[serde(default)]
    pub options: QueueOptions,
}

/// Per-queue options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueOptions {
    /// Survive broker restarts where the backend supports it.
    #[serde(default = "default_durable")]
    pub durable: bool,

    /// Maximum queue length, where the backend supports it.
    #[serde(default)]
    pub max_length: Option<u64>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: default_durable(),
            max_length: None,
        }
    }
}

fn default_durable() -> bool {
    true
}

/// Global retry policy defaults applied to jobs that do not override them.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicyConfig {
    /// Maximum retry attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Double the delay on every retry.
    #[serde(default = "default_exponential_backoff")]
    pub exponential_backoff: bool,

    /// Cap on the computed delay in milliseconds.
    #[serde(default = "default_max_retry_delay_ms")]
    #[validate(range(min = 1))]
    pub max_retry_delay_ms: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            exponential_backoff: default_exponential_backoff(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

impl RetryPolicyConfig {
    /// Base retry delay as a Duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Delay cap as a Duration.
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_exponential_backoff() -> bool {
    true
}

fn default_max_retry_delay_ms() -> u64 {
    30000
}

/// Periodic metrics-collection and health-check settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    /// Run the periodic tasks at all.
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,

    /// Metrics collection interval in milliseconds.
    #[serde(default = "default_metrics_interval_ms")]
    #[validate(range(min = 1000))]
    pub metrics_interval_ms: u64,

    /// Provider health-check interval in milliseconds.
    #[serde(default = "default_health_check_interval_ms")]
    #[validate(range(min = 1000))]
    pub health_check_interval_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitoring_enabled(),
            metrics_interval_ms: default_metrics_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }
}

impl MonitoringConfig {
    /// Metrics interval as a Duration.
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    /// Health-check interval as a Duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

fn default_monitoring_enabled() -> bool {
    true
}

fn default_metrics_interval_ms() -> u64 {
    30000
}

fn default_health_check_interval_ms() -> u64 {
    60000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_config_is_valid() {
        let config = ConveyorConfig::in_memory().with_queue("default");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let retry = RetryPolicyConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.retry_delay(), Duration::from_millis(1000));
        assert!(retry.exponential_backoff);
        assert_eq!(retry.max_retry_delay(), Duration::from_millis(30000));

        let monitoring = MonitoringConfig::default();
        assert!(monitoring.enabled);
        assert_eq!(monitoring.metrics_interval(), Duration::from_secs(30));
        assert_eq!(monitoring.health_check_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let parsed: Result<MonitoringConfig, _> = serde_json::from_value(serde_json::json!({
            "enabled": true,
            "metrics_interval_ms": 5000,
            "surprise": 1
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_undeclared_default_provider_rejected() {
        let mut config = ConveyorConfig::in_memory();
        config.default_provider = "ghost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_referencing_unknown_provider_rejected() {
        let mut config = ConveyorConfig::in_memory();
        config.queues.insert(
            "orders".to_string(),
            QueueBinding {
                provider: "ghost".to_string(),
                options: QueueOptions::default(),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let mut config = ConveyorConfig::in_memory();
        config.providers.push(ProviderConfig {
            name: "memory".to_string(),
            kind: ProviderKind::Memory,
            settings: ProviderSettings::default(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_requires_url() {
        let mut config = ConveyorConfig::in_memory();
        config.providers.push(ProviderConfig {
            name: "cache".to_string(),
            kind: ProviderKind::Redis,
            settings: ProviderSettings::default(),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn test_interval_minimum_enforced() {
        let mut config = ConveyorConfig::in_memory();
        config.monitoring.metrics_interval_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_provider_kind_rejected_at_parse() {
        let parsed: Result<ProviderConfig, _> = serde_json::from_value(serde_json::json!({
            "name": "x",
            "type": "carrier-pigeon"
        }));
        assert!(parsed.is_err());
    }
}
