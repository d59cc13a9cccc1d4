//! SQS provider (cloud queue).
//!
//! Receive captures the delivery's receipt handle on the message so a later
//! acknowledge can delete by receipt; reject-with-requeue zeroes the
//! visibility timeout for prompt redelivery.

use crate::provider::{validate_queue_name, Provider};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use chrono::Utc;
use conveyor_config::{ProviderConfig, QueueOptions};
use conveyor_core::{
    ConveyorError, ConveyorResult, Event, EventBus, Message, ProviderHealth, ProviderKind,
    QueueInfo,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Maximum delay SQS accepts on a send, in seconds.
const MAX_DELAY_SECS: u64 = 900;

/// SQS cloud-queue provider.
pub struct SqsProvider {
    name: String,
    region: Option<String>,
    endpoint_url: Option<String>,
    client: RwLock<Option<Client>>,
    queue_urls: RwLock<HashMap<String, String>>,
    events: Arc<EventBus>,
}

impl SqsProvider {
    /// Creates the provider from its configuration entry.
    pub fn new(config: &ProviderConfig, events: Arc<EventBus>) -> Self {
        Self {
            name: config.name.clone(),
            region: config.settings.region.clone(),
            endpoint_url: config.settings.url.clone(),
            client: RwLock::new(None),
            queue_urls: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn client(&self) -> ConveyorResult<Client> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| ConveyorError::unavailable(&self.name, "provider not connected"))
    }

    fn backend_err<E: ToString>(&self, error: E) -> ConveyorError {
        ConveyorError::backend(&self.name, error.to_string())
    }

    async fn queue_url(&self, queue: &str) -> ConveyorResult<String> {
        if let Some(url) = self.queue_urls.read().get(queue) {
            return Ok(url.clone());
        }

        let client = self.client()?;
        let resolved = client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|_| ConveyorError::QueueUnknown(queue.to_string()))?;

        let url = resolved
            .queue_url()
            .ok_or_else(|| ConveyorError::QueueUnknown(queue.to_string()))?
            .to_string();

        self.queue_urls.write().insert(queue.to_string(), url.clone());
        Ok(url)
    }
}

#[async_trait]
impl Provider for SqsProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Sqs
    }

    async fn connect(&self) -> ConveyorResult<()> {
        if self.client.read().is_some() {
            return Ok(());
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &self.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_sqs::config::Builder::from(&shared);
        if let Some(endpoint) = &self.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        *self.client.write() = Some(Client::from_conf(builder.build()));
        self.events.publish(&Event::ProviderConnected {
            provider: self.name.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> ConveyorResult<()> {
        if self.client.write().take().is_some() {
            self.queue_urls.write().clear();
            self.events.publish(&Event::ProviderDisconnected {
                provider: self.name.clone(),
            });
        }
        Ok(())
    }

    async fn send_message(&self, queue: &str, message: &Message) -> ConveyorResult<()> {
        validate_queue_name(queue)?;
        let client = self.client()?;
        let url = self.queue_url(queue).await?;
        let body = message.to_json()?;

        let mut request = client.send_message().queue_url(url).message_body(body);
        if let Some(delay) = message.metadata.delay {
            let secs = delay.as_secs().min(MAX_DELAY_SECS);
            request = request.delay_seconds(secs as i32);
        }

        request.send().await.map_err(|e| self.backend_err(e))?;

        self.events.publish(&Event::MessageSent {
            queue: queue.to_string(),
            message_id: message.id.to_string(),
        });
        Ok(())
    }

    async fn receive_message(&self, queue: &str) -> ConveyorResult<Option<Message>> {
        let client = self.client()?;
        let url = self.queue_url(queue).await?;

        let response = client
            .receive_message()
            .queue_url(&url)
            .max_number_of_messages(1)
            .send()
            .await
            .map_err(|e| self.backend_err(e))?;

        let Some(delivery) = response.messages().first() else {
            return Ok(None);
        };

        let body = delivery
            .body()
            .ok_or_else(|| self.backend_err("received message with empty body"))?;
        let mut message = Message::from_json(body)?;
        message.receipt_handle = delivery.receipt_handle().map(str::to_string);

        if message.is_expired(Utc::now()) {
            // Expired in flight: delete rather than redeliver.
            if let Some(receipt) = &message.receipt_handle {
                let _ = client
                    .delete_message()
                    .queue_url(&url)
                    .receipt_handle(receipt)
                    .send()
                    .await;
            }
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

    async fn acknowledge(&self, queue: &str, message: &Message) -> ConveyorResult<()> {
        let receipt = message.receipt_handle.as_ref().ok_or_else(|| {
            ConveyorError::validation(format!(
                "message {} has no receipt handle; was it received from this provider?",
                message.id
            ))
        })?;

        let client = self.client()?;
        let url = self.queue_url(queue).await?;
        client
            .delete_message()
            .queue_url(url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| self.backend_err(e))?;
        Ok(())
    }

    async fn reject(&self, queue: &str, message: &Message, requeue: bool) -> ConveyorResult<()> {
        let receipt = message.receipt_handle.as_ref().ok_or_else(|| {
            ConveyorError::validation(format!("message {} has no receipt handle", message.id))
        })?;

        let client = self.client()?;
        let url = self.queue_url(queue).await?;

        if requeue {
            client
                .change_message_visibility()
                .queue_url(url)
                .receipt_handle(receipt)
                .visibility_timeout(0)
                .send()
                .await
                .map_err(|e| self.backend_err(e))?;
        } else {
            client
                .delete_message()
                .queue_url(url)
                .receipt_handle(receipt)
                .send()
                .await
                .map_err(|e| self.backend_err(e))?;
        }
        Ok(())
    }

    async fn create_queue(&self, queue: &str, _options: &QueueOptions) -> ConveyorResult<()> {
        validate_queue_name(queue)?;
        let client = self.client()?;

        let created = client
            .create_queue()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| self.backend_err(e))?;

        if let Some(url) = created.queue_url() {
            self.queue_urls
                .write()
                .insert(queue.to_string(), url.to_string());
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> ConveyorResult<()> {
        let client = self.client()?;
        let url = self.queue_url(queue).await?;
        client
            .delete_queue()
            .queue_url(url)
            .send()
            .await
            .map_err(|e| self.backend_err(e))?;
        self.queue_urls.write().remove(queue);
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> ConveyorResult<u64> {
        let info = self.queue_info(queue).await?;
        let client = self.client()?;
        let url = self.queue_url(queue).await?;
        client
            .purge_queue()
            .queue_url(url)
            .send()
            .await
            .map_err(|e| self.backend_err(e))?;
        debug!(queue, purged = info.message_count, "Purged queue");
        Ok(info.message_count)
    }

    async fn queue_info(&self, queue: &str) -> ConveyorResult<QueueInfo> {
        let client = self.client()?;
        let url = self.queue_url(queue).await?;

        let attributes = client
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| self.backend_err(e))?;

        let message_count = attributes
            .attributes()
            .and_then(|map| map.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(QueueInfo {
            name: queue.to_string(),
            message_count,
            consumer_count: 0,
        })
    }

    async fn health(&self) -> ProviderHealth {
        let started = Instant::now();
        let Ok(client) = self.client() else {
            return ProviderHealth::unhealthy("provider not connected");
        };

        match client.list_queues().max_results(1).send().await {
            Ok(_) => ProviderHealth::healthy(started.elapsed()),
            Err(e) => ProviderHealth::unhealthy(e.to_string()),
        }
    }
}
