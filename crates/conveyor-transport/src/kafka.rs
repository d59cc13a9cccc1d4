//! Kafka provider: topic-per-queue over a record log.
//!
//! Sends go through a producer; consumption is push-based via `subscribe`,
//! so `receive_message` always reports empty. Delete relies on retention and
//! purge is unsupported.

use crate::provider::{validate_queue_name, MessageCallback, Provider};
use async_trait::async_trait;
use conveyor_config::{ProviderConfig, QueueOptions};
use conveyor_core::{
    ConveyorError, ConveyorResult, Event, EventBus, Message, ProviderHealth, ProviderKind,
    QueueInfo,
};
use parking_lot::{Mutex, RwLock};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, warn};

const DEFAULT_CONSUMER_GROUP: &str = "conveyor-workers";
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka record-log provider.
pub struct KafkaProvider {
    name: String,
    brokers: String,
    group_id: String,
    producer: RwLock<Option<FutureProducer>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    events: Arc<EventBus>,
}

impl KafkaProvider {
    /// Creates the provider from its configuration entry.
    pub fn new(config: &ProviderConfig, events: Arc<EventBus>) -> ConveyorResult<Self> {
        let brokers = config
            .settings
            .url
            .clone()
            .ok_or_else(|| ConveyorError::configuration(format!(
                "provider {}: kafka requires a url (bootstrap servers)",
                config.name
            )))?;

        Ok(Self {
            name: config.name.clone(),
            brokers,
            group_id: config
                .settings
                .consumer_group
                .clone()
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            producer: RwLock::new(None),
            consumers: Mutex::new(Vec::new()),
            events,
        })
    }

    fn producer(&self) -> ConveyorResult<FutureProducer> {
        self.producer
            .read()
            .clone()
            .ok_or_else(|| ConveyorError::unavailable(&self.name, "provider not connected"))
    }

    fn backend_err<E: ToString>(&self, error: E) -> ConveyorError {
        ConveyorError::backend(&self.name, error.to_string())
    }
}

#[async_trait]
impl Provider for KafkaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Kafka
    }

    async fn connect(&self) -> ConveyorResult<()> {
        if self.producer.read().is_some() {
            return Ok(());
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| ConveyorError::unavailable(&self.name, e))?;

        *self.producer.write() = Some(producer);
        self.events.publish(&Event::ProviderConnected {
            provider: self.name.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> ConveyorResult<()> {
        for handle in self.consumers.lock().drain(..) {
            handle.abort();
        }
        if self.producer.write().take().is_some() {
            self.events.publish(&Event::ProviderDisconnected {
                provider: self.name.clone(),
            });
        }
        Ok(())
    }

    async fn send_message(&self, queue: &str, message: &Message) -> ConveyorResult<()> {
        validate_queue_name(queue)?;
        let producer = self.producer()?;
        let json = message.to_json()?;
        let key = message.id.to_string();

        let record = FutureRecord::to(queue).key(&key).payload(&json);
        producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| self.backend_err(e))?;

        self.events.publish(&Event::MessageSent {
            queue: queue.to_string(),
            message_id: message.id.to_string(),
        });
        Ok(())
    }

    async fn receive_message(&self, _queue: &str) -> ConveyorResult<Option<Message>> {
        // Consumption is push-based; callers treat this as "empty".
        Ok(None)
    }

    async fn subscribe(&self, queue: &str, callback: MessageCallback) -> ConveyorResult<()> {
        validate_queue_name(queue)?;
        self.producer()?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| ConveyorError::unavailable(&self.name, e))?;

        consumer
            .subscribe(&[queue])
            .map_err(|e| self.backend_err(e))?;

        let provider_name = self.name.clone();
        let queue_name = queue.to_string();
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            loop {
                match consumer.recv().await {
                    Ok(record) => {
                        let Some(payload) = record.payload() else {
                            continue;
                        };
                        let parsed = std::str::from_utf8(payload)
                            .map_err(|e| e.to_string())
                            .and_then(|json| {
                                Message::from_json(json).map_err(|e| e.to_string())
                            });

                        match parsed {
                            Ok(message) => {
                                let message_id = message.id.to_string();
                                events.publish(&Event::MessageReceived {
                                    queue: queue_name.clone(),
                                    message_id: message_id.clone(),
                                });
                                if let Err(e) = callback(message).await {
                                    warn!(
                                        provider = %provider_name,
                                        queue = %queue_name,
                                        message_id = %message_id,
                                        error = %e,
                                        "Subscriber callback failed"
                                    );
                                }
                            }
                            Err(e) => {
                                warn!(
                                    provider = %provider_name,
                                    queue = %queue_name,
                                    error = %e,
                                    "Skipping unparseable record"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        error!(provider = %provider_name, queue = %queue_name, error = %e, "Consumer error");
                        events.publish(&Event::ProviderError {
                            provider: provider_name.clone(),
                            message: e.to_string(),
                        });
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        self.consumers.lock().push(handle);
        Ok(())
    }

    async fn acknowledge(&self, _queue: &str, _message: &Message) -> ConveyorResult<()> {
        // Offsets auto-commit; the log keeps the record either way.
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

    async fn create_queue(&self, queue: &str, _options: &QueueOptions) -> ConveyorResult<()> {
        // Topics are auto-created by the cluster; only the name is checked.
        validate_queue_name(queue)?;
        self.producer().map(|_| ())
    }

    async fn delete_queue(&self, queue: &str) -> ConveyorResult<()> {
        // Records age out through retention.
        validate_queue_name(queue)?;
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> ConveyorResult<u64> {
        self.events.publish(&Event::QueuePurgeUnsupported {
            queue: queue.to_string(),
            provider: self.name.clone(),
        });
        Ok(0)
    }

    async fn queue_info(&self, queue: &str) -> ConveyorResult<QueueInfo> {
        // Log depth is not cheaply observable; report zeros.
        self.producer()?;
        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: 0,
            consumer_count: self.consumers.lock().len() as u64,
        })
    }

    async fn health(&self) -> ProviderHealth {
        let started = Instant::now();
        let Ok(producer) = self.producer() else {
            return ProviderHealth::unhealthy("provider not connected");
        };

        let probe = tokio::task::spawn_blocking(move || {
            use rdkafka::producer::Producer;
            producer
                .client()
                .fetch_metadata(None, Timeout::After(Duration::from_secs(2)))
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .await;

        match probe {
            Ok(Ok(())) => ProviderHealth::healthy(started.elapsed()),
            Ok(Err(e)) => ProviderHealth::unhealthy(e),
            Err(e) => ProviderHealth::unhealthy(e.to_string()),
        }
    }
}
