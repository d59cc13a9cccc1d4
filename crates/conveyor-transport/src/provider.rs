//! Transport provider contract.

use async_trait::async_trait;
use conveyor_config::{ProviderConfig, QueueOptions};
use conveyor_core::{
    ConveyorError, ConveyorResult, EventBus, Message, ProviderHealth, ProviderKind, QueueInfo,
};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Callback invoked for push-delivery backends (Kafka-like).
pub type MessageCallback =
    Arc<dyn Fn(Message) -> BoxFuture<'static, ConveyorResult<()>> + Send + Sync>;

/// Uniform transport operations over a backend.
///
/// Implementations verify their own connectivity on every operation and
/// surface `BackendUnavailable` when the backend cannot be reached; any
/// `is_connected`-style flag is a hint, never a gate.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name from configuration.
    fn name(&self) -> &str;

    /// Backend kind.
    fn kind(&self) -> ProviderKind;

    /// Establishes the backend connection. Idempotent.
    async fn connect(&self) -> ConveyorResult<()>;

    /// Tears the connection down. Idempotent.
    async fn disconnect(&self) -> ConveyorResult<()>;

    /// Delivers a message to the backend. Returns once accepted.
    async fn send_message(&self, queue: &str, message: &Message) -> ConveyorResult<()>;

    /// Pulls the next available message, or `None` when the queue is empty.
    ///
    /// Record-log backends always return `None` here; consumption is
    /// event-driven through [`Provider::subscribe`].
    async fn receive_message(&self, queue: &str) -> ConveyorResult<Option<Message>>;

    /// Registers a push-delivery callback. Pull backends reject this.
    async fn subscribe(&self, queue: &str, _callback: MessageCallback) -> ConveyorResult<()> {
        Err(ConveyorError::configuration(format!(
            "provider {} ({}) does not support push subscriptions for queue {queue}",
            self.name(),
            self.kind()
        )))
    }

    /// Removes the message from redelivery. No-op on backends whose receive
    /// already consumes.
    async fn acknowledge(&self, queue: &str, message: &Message) -> ConveyorResult<()>;

    /// Returns the message to the queue (`requeue`) or drops it per backend
    /// semantics.
    async fn reject(&self, queue: &str, message: &Message, requeue: bool) -> ConveyorResult<()>;

    /// Creates a queue. Backends with implicit queues validate the name and
    /// no-op.
    async fn create_queue(&self, queue: &str, options: &QueueOptions) -> ConveyorResult<()>;

    /// Deletes a queue, best-effort.
    async fn delete_queue(&self, queue: &str) -> ConveyorResult<()>;

    /// Drops all waiting messages, returning how many were removed where the
    /// backend can tell.
    async fn purge_queue(&self, queue: &str) -> ConveyorResult<u64>;

    /// Best-effort queue statistics.
    async fn queue_info(&self, queue: &str) -> ConveyorResult<QueueInfo>;

    /// Probes the backend and reports health.
    async fn health(&self) -> ProviderHealth;
}

/// Validates a queue name. All backends apply this, including those with
/// implicit queues.
pub fn validate_queue_name(queue: &str) -> ConveyorResult<()> {
    if queue.is_empty() {
        return Err(ConveyorError::validation("queue name must be non-empty"));
    }
    if queue.len() > 255 {
        return Err(ConveyorError::validation("queue name exceeds 255 characters"));
    }
    if !queue
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ConveyorError::validation(format!(
            "queue name contains illegal characters: {queue}"
        )));
    }
    Ok(())
}

/// Constructs a provider from its configuration entry.
///
/// Unknown provider kinds never reach this point: `ProviderKind` rejects them
/// at deserialization, so a misconfigured type aborts startup.
pub fn build_provider(
    config: &ProviderConfig,
    events: Arc<EventBus>,
) -> ConveyorResult<Arc<dyn Provider>> {
    let provider: Arc<dyn Provider> = match config.kind {
        ProviderKind::Memory => Arc::new(crate::memory::MemoryProvider::new(config, events)),
        ProviderKind::Redis => Arc::new(crate::redis::RedisProvider::new(config, events)?),
        ProviderKind::Amqp => Arc::new(crate::amqp::AmqpProvider::new(config, events)?),
        ProviderKind::Kafka => Arc::new(crate::kafka::KafkaProvider::new(config, events)?),
        ProviderKind::Sqs => Arc::new(crate::sqs::SqsProvider::new(config, events)),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_config::ProviderSettings;

    #[test]
    fn test_queue_name_validation() {
        assert!(validate_queue_name("jobs-email").is_ok());
        assert!(validate_queue_name("queue.with.dots_and-dashes").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("spaces not allowed").is_err());
        assert!(validate_queue_name("no/slashes").is_err());
        assert!(validate_queue_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_build_memory_provider() {
        let config = ProviderConfig {
            name: "mem".to_string(),
            kind: ProviderKind::Memory,
            settings: ProviderSettings::default(),
        };
        let provider = build_provider(&config, Arc::new(EventBus::new())).unwrap();
        assert_eq!(provider.name(), "mem");
        assert_eq!(provider.kind(), ProviderKind::Memory);
    }

    #[test]
    fn test_build_redis_provider_requires_url() {
        let config = ProviderConfig {
            name: "cache".to_string(),
            kind: ProviderKind::Redis,
            settings: ProviderSettings::default(),
        };
        assert!(build_provider(&config, Arc::new(EventBus::new())).is_err());
    }
}
