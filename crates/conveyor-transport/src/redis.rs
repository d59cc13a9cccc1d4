//! Redis-backed provider: list push/pop semantics.
//!
//! Receive pops and therefore consumes; acknowledge is a no-op. Delayed
//! messages are best-effort on this backend: a popped message that is not yet
//! due goes back to the end of the list.

use crate::provider::{validate_queue_name, Provider};
use async_trait::async_trait;
use chrono::Utc;
use conveyor_config::{ProviderConfig, QueueOptions};
use conveyor_core::{
    ConveyorError, ConveyorResult, Event, EventBus, Message, ProviderHealth, ProviderKind,
    QueueInfo,
};
use deadpool_redis::{Pool, Runtime};
use parking_lot::RwLock;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const DEFAULT_POOL_SIZE: usize = 10;
const DEFAULT_KEY_PREFIX: &str = "conveyor:queue";

/// Redis list provider.
pub struct RedisProvider {
    name: String,
    url: String,
    key_prefix: String,
    pool_size: usize,
    pool: RwLock<Option<Pool>>,
    events: Arc<EventBus>,
}

impl RedisProvider {
    /// Creates the provider from its configuration entry.
    pub fn new(config: &ProviderConfig, events: Arc<EventBus>) -> ConveyorResult<Self> {
        let url = config
            .settings
            .url
            .clone()
            .ok_or_else(|| ConveyorError::configuration(format!(
                "provider {}: redis requires a url",
                config.name
            )))?;

        Ok(Self {
            name: config.name.clone(),
            url,
            key_prefix: config
                .settings
                .key_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            pool_size: config.settings.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            pool: RwLock::new(None),
            events,
        })
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:{}", self.key_prefix, queue)
    }

    async fn conn(&self) -> ConveyorResult<deadpool_redis::Connection> {
        let pool = self
            .pool
            .read()
            .clone()
            .ok_or_else(|| ConveyorError::unavailable(&self.name, "provider not connected"))?;
        pool.get()
            .await
            .map_err(|e| ConveyorError::unavailable(&self.name, e))
    }

    fn backend_err<E: ToString>(&self, error: E) -> ConveyorError {
        ConveyorError::backend(&self.name, error.to_string())
    }
}

#[async_trait]
impl Provider for RedisProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Redis
    }

    async fn connect(&self) -> ConveyorResult<()> {
        if self.pool.read().is_some() {
            return Ok(());
        }

        let mut cfg = deadpool_redis::Config::from_url(self.url.clone());
        cfg.pool = Some(deadpool_redis::PoolConfig::new(self.pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ConveyorError::unavailable(&self.name, e))?;

        // Round-trip once so a bad URL fails at startup, not first send.
        let mut conn = pool
            .get()
            .await
            .map_err(|e| ConveyorError::unavailable(&self.name, e))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ConveyorError::unavailable(&self.name, e))?;

        *self.pool.write() = Some(pool);
        self.events.publish(&Event::ProviderConnected {
            provider: self.name.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> ConveyorResult<()> {
        if self.pool.write().take().is_some() {
            self.events.publish(&Event::ProviderDisconnected {
                provider: self.name.clone(),
            });
        }
        Ok(())
    }

    async fn send_message(&self, queue: &str, message: &Message) -> ConveyorResult<()> {
        validate_queue_name(queue)?;
        let json = message.to_json()?;
        let mut conn = self.conn().await?;

        let _: () = conn
            .lpush(self.queue_key(queue), json)
            .await
            .map_err(|e| self.backend_err(e))?;

        self.events.publish(&Event::MessageSent {
            queue: queue.to_string(),
            message_id: message.id.to_string(),
        });
        Ok(())
    }

    async fn receive_message(&self, queue: &str) -> ConveyorResult<Option<Message>> {
        let key = self.queue_key(queue);
        let mut conn = self.conn().await?;
        let now = Utc::now();

        loop {
            let popped: Option<String> = conn
                .rpop(&key, None)
                .await
                .map_err(|e| self.backend_err(e))?;

            let Some(json) = popped else {
                return Ok(None);
            };

            let message = Message::from_json(&json)?;

            if message.is_expired(now) {
                self.events.publish(&Event::MessageDropped {
                    queue: queue.to_string(),
                    message_id: message.id.to_string(),
                    reason: "ttl expired".to_string(),
                });
                continue;
            }

            if !message.is_due(now) {
                // Not yet due: back of the list, try again later.
                let _: () = conn
                    .lpush(&key, json)
                    .await
                    .map_err(|e| self.backend_err(e))?;
                return Ok(None);
            }

            self.events.publish(&Event::MessageReceived {
                queue: queue.to_string(),
                message_id: message.id.to_string(),
            });
            return Ok(Some(message));
        }
    }

    async fn acknowledge(&self, _queue: &str, _message: &Message) -> ConveyorResult<()> {
        // Pop already consumed the message.
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
        let json = redelivery.to_json()?;

        let mut conn = self.conn().await?;
        // RPUSH puts it at the pop end for prompt redelivery.
        let _: () = conn
            .rpush(self.queue_key(queue), json)
            .await
            .map_err(|e| self.backend_err(e))?;
        Ok(())
    }

    async fn create_queue(&self, queue: &str, _options: &QueueOptions) -> ConveyorResult<()> {
        // Lists are implicit; the name still has to be legal.
        validate_queue_name(queue)?;
        self.conn().await.map(|_| ())
    }

    async fn delete_queue(&self, queue: &str) -> ConveyorResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(self.queue_key(queue))
            .await
            .map_err(|e| self.backend_err(e))?;
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> ConveyorResult<u64> {
        let key = self.queue_key(queue);
        let mut conn = self.conn().await?;
        let count: u64 = conn.llen(&key).await.map_err(|e| self.backend_err(e))?;
        let _: () = conn.del(&key).await.map_err(|e| self.backend_err(e))?;
        debug!(queue, purged = count, "Purged queue");
        Ok(count)
    }

    async fn queue_info(&self, queue: &str) -> ConveyorResult<QueueInfo> {
        let mut conn = self.conn().await?;
        let count: u64 = conn
            .llen(self.queue_key(queue))
            .await
            .map_err(|e| self.backend_err(e))?;
        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: count,
            consumer_count: 0,
        })
    }

    async fn health(&self) -> ProviderHealth {
        let started = Instant::now();
        match self.conn().await {
            Ok(mut conn) => {
                let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                match pong {
                    Ok(_) => ProviderHealth::healthy(started.elapsed()),
                    Err(e) => ProviderHealth::unhealthy(e.to_string()),
                }
            }
            Err(e) => ProviderHealth::unhealthy(e.to_string()),
        }
    }
}
