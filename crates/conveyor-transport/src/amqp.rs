//! AMQP provider (RabbitMQ-style broker).
//!
//! Queues are asserted durable on first use. Receive pulls one message in
//! manual-ack mode and acks it immediately on a successful parse, so
//! acknowledge is a no-op and a reject-with-requeue re-publishes.

use crate::provider::{validate_queue_name, Provider};
use async_trait::async_trait;
use chrono::Utc;
use conveyor_config::{ProviderConfig, QueueOptions};
use conveyor_core::{
    ConveyorError, ConveyorResult, Event, EventBus, Message, ProviderHealth, ProviderKind,
    QueueInfo,
};
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
    QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

const DEFAULT_PREFETCH: u16 = 10;

/// AMQP broker provider.
pub struct AmqpProvider {
    name: String,
    url: String,
    prefetch: u16,
    connection: tokio::sync::Mutex<Option<Connection>>,
    channel: tokio::sync::Mutex<Option<Channel>>,
    declared: Mutex<HashSet<String>>,
    events: Arc<EventBus>,
}

impl AmqpProvider {
    /// Creates the provider from its configuration entry.
    pub fn new(config: &ProviderConfig, events: Arc<EventBus>) -> ConveyorResult<Self> {
        let url = config
            .settings
            .url
            .clone()
            .ok_or_else(|| ConveyorError::configuration(format!(
                "provider {}: amqp requires a url",
                config.name
            )))?;

        Ok(Self {
            name: config.name.clone(),
            url,
            prefetch: config.settings.prefetch.unwrap_or(DEFAULT_PREFETCH),
            connection: tokio::sync::Mutex::new(None),
            channel: tokio::sync::Mutex::new(None),
            declared: Mutex::new(HashSet::new()),
            events,
        })
    }

    async fn channel(&self) -> ConveyorResult<Channel> {
        self.channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| ConveyorError::unavailable(&self.name, "provider not connected"))
    }

    fn backend_err<E: ToString>(&self, error: E) -> ConveyorError {
        ConveyorError::backend(&self.name, error.to_string())
    }

    /// Asserts a durable queue once per queue name.
    async fn ensure_queue(&self, channel: &Channel, queue: &str, durable: bool) -> ConveyorResult<()> {
        validate_queue_name(queue)?;
        if self.declared.lock().contains(queue) {
            return Ok(());
        }

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.backend_err(e))?;

        self.declared.lock().insert(queue.to_string());
        Ok(())
    }
}

#[async_trait]
impl Provider for AmqpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Amqp
    }

    async fn connect(&self) -> ConveyorResult<()> {
        let mut connection = self.connection.lock().await;
        if connection.as_ref().is_some_and(|c| c.status().connected()) {
            return Ok(());
        }

        let conn = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| ConveyorError::unavailable(&self.name, e))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| ConveyorError::unavailable(&self.name, e))?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| self.backend_err(e))?;

        *connection = Some(conn);
        *self.channel.lock().await = Some(channel);

        self.events.publish(&Event::ProviderConnected {
            provider: self.name.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> ConveyorResult<()> {
        let channel = self.channel.lock().await.take();
        let connection = self.connection.lock().await.take();

        if let Some(channel) = channel {
            if let Err(e) = channel.close(200, "shutdown").await {
                warn!(provider = %self.name, error = %e, "Channel close failed");
            }
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close(200, "shutdown").await {
                warn!(provider = %self.name, error = %e, "Connection close failed");
            }
            self.events.publish(&Event::ProviderDisconnected {
                provider: self.name.clone(),
            });
        }
        Ok(())
    }

    async fn send_message(&self, queue: &str, message: &Message) -> ConveyorResult<()> {
        let channel = self.channel().await?;
        self.ensure_queue(&channel, queue, true).await?;

        let payload = message.to_json()?.into_bytes();
        let properties = BasicProperties::default()
            .with_priority(message.metadata.priority)
            .with_message_id(message.id.to_string().into());

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| self.backend_err(e))?
            .await
            .map_err(|e| self.backend_err(e))?;

        self.events.publish(&Event::MessageSent {
            queue: queue.to_string(),
            message_id: message.id.to_string(),
        });
        Ok(())
    }

    async fn receive_message(&self, queue: &str) -> ConveyorResult<Option<Message>> {
        let channel = self.channel().await?;
        self.ensure_queue(&channel, queue, true).await?;

        let delivery = channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| self.backend_err(e))?;

        let Some(delivery) = delivery else {
            return Ok(None);
        };

        let parsed = std::str::from_utf8(&delivery.delivery.data)
            .map_err(|e| self.backend_err(e))
            .and_then(|json| Message::from_json(json));

        let message = match parsed {
            Ok(message) => message,
            Err(e) => {
                // Unparseable payload goes to the broker's dead path.
                if let Err(reject_err) = delivery
                    .delivery
                    .acker
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                {
                    warn!(provider = %self.name, error = %reject_err, "Reject failed");
                }
                return Err(e);
            }
        };

        delivery
            .delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| self.backend_err(e))?;

        if message.is_expired(Utc::now()) {
            self.events.publish(&Event::MessageDropped {
                queue: queue.to_string(),
                message_id: message.id.to_string(),
                reason: "ttl expired".to_string(),
            });
            return Ok(None);
        }

        self.events.publish(&Event::MessageReceived {
            queue: queue.to_string(),
            message_id: message.id.to_string(),
        });
        Ok(Some(message))
    }

    async fn acknowledge(&self, _queue: &str, _message: &Message) -> ConveyorResult<()> {
        // Already acked at receive time.
        Ok(())
    }

    async fn reject(&self, queue: &str, message: &Message, requeue: bool) -> ConveyorResult<()> {
        if !requeue {
            return Ok(());
        }

        if !message.can_redeliver() {
            self.events.publish(&Event::MessageDropped {
                queue: queue.to_string(),
                message_id: message.id.to_string(),
                reason: "max redeliveries exceeded".to_string(),
            });
            return Ok(());
        }

        let mut redelivery = message.clone();
        redelivery.metadata.retry_count += 1;
        self.send_message(queue, &redelivery).await
    }

    async fn create_queue(&self, queue: &str, options: &QueueOptions) -> ConveyorResult<()> {
        let channel = self.channel().await?;
        self.ensure_queue(&channel, queue, options.durable).await
    }

    async fn delete_queue(&self, queue: &str) -> ConveyorResult<()> {
        let channel = self.channel().await?;
        channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| self.backend_err(e))?;
        self.declared.lock().remove(queue);
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> ConveyorResult<u64> {
        let channel = self.channel().await?;
        let purged = channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| self.backend_err(e))?;
        Ok(u64::from(purged))
    }

    async fn queue_info(&self, queue: &str) -> ConveyorResult<QueueInfo> {
        let channel = self.channel().await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.backend_err(e))?;

        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: u64::from(declared.message_count()),
            consumer_count: u64::from(declared.consumer_count()),
        })
    }

    async fn health(&self) -> ProviderHealth {
        let started = Instant::now();
        let connection = self.connection.lock().await;
        match connection.as_ref() {
            Some(conn) if conn.status().connected() => ProviderHealth::healthy(started.elapsed()),
            Some(_) => ProviderHealth::unhealthy("connection lost"),
            None => ProviderHealth::unhealthy("provider not connected"),
        }
    }
}
