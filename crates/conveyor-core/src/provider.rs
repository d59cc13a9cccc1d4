//! Provider descriptors shared between configuration and transport.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Supported transport backend kinds.
///
/// Deserialization rejects unknown kinds, so a misconfigured provider type
/// fails at startup rather than falling back to a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Process-local FIFO/priority queues.
    Memory,
    /// Redis list push/pop.
    Redis,
    /// AMQP broker (RabbitMQ-style).
    Amqp,
    /// Kafka record log.
    Kafka,
    /// SQS cloud queue.
    Sqs,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
            Self::Amqp => write!(f, "amqp"),
            Self::Kafka => write!(f, "kafka"),
            Self::Sqs => write!(f, "sqs"),
        }
    }
}

/// Provider health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Operating with elevated latency or error rate.
    Degraded,
    /// Not usable.
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health report returned by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    /// Overall verdict.
    pub status: HealthStatus,

    /// Round-trip latency of the probe.
    pub latency: Duration,

    /// Error rate observed by the provider, 0.0-1.0.
    pub error_rate: f64,

    /// Free-form diagnostic detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ProviderHealth {
    /// A healthy report with the given probe latency.
    #[must_use]
    pub fn healthy(latency: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency,
            error_rate: 0.0,
            details: None,
        }
    }

    /// An unhealthy report with diagnostic detail.
    #[must_use]
    pub fn unhealthy(details: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency: Duration::ZERO,
            error_rate: 1.0,
            details: Some(details.into()),
        }
    }
}

/// Best-effort queue statistics from a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueInfo {
    /// Queue name.
    pub name: String,

    /// Messages waiting for delivery.
    pub message_count: u64,

    /// Attached consumers, where the backend reports them.
    pub consumer_count: u64,
}
