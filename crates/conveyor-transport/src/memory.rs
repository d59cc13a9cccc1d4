//! In-memory provider: process-local queues for tests and embedders.

use crate::provider::{validate_queue_name, Provider};
use async_trait::async_trait;
use chrono::Utc;
use conveyor_config::{ProviderConfig, QueueOptions};
use conveyor_core::{
    ConveyorError, ConveyorResult, Event, EventBus, Message, MessageId, ProviderHealth,
    ProviderKind, QueueInfo,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

struct StoredMessage {
    message: Message,
    seq: u64,
}

#[derive(Default)]
struct MemoryQueue {
    entries: Vec<StoredMessage>,
    in_flight: HashMap<MessageId, Message>,
    max_length: Option<u64>,
}

/// Process-local provider. Extraction is strict max-priority with FIFO
/// tiebreak; delay and TTL are honoured at extraction time.
pub struct MemoryProvider {
    name: String,
    connected: AtomicBool,
    seq: AtomicU64,
    max_payload_bytes: Option<usize>,
    default_max_length: Option<usize>,
    queues: Mutex<HashMap<String, MemoryQueue>>,
    events: Arc<EventBus>,
}

impl MemoryProvider {
    /// Creates the provider from its configuration entry.
    pub fn new(config: &ProviderConfig, events: Arc<EventBus>) -> Self {
        Self {
            name: config.name.clone(),
            connected: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            max_payload_bytes: config.settings.max_payload_bytes,
            default_max_length: config.settings.max_queue_length,
            queues: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn ensure_connected(&self) -> ConveyorResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConveyorError::unavailable(&self.name, "provider not connected"));
        }
        Ok(())
    }

    fn drop_message(&self, queue: &str, message: &Message, reason: &str) {
        debug!(queue, message_id = %message.id, reason, "Dropping message");
        self.events.publish(&Event::MessageDropped {
            queue: queue.to_string(),
            message_id: message.id.to_string(),
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    async fn connect(&self) -> ConveyorResult<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.events.publish(&Event::ProviderConnected {
                provider: self.name.clone(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> ConveyorResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.events.publish(&Event::ProviderDisconnected {
                provider: self.name.clone(),
            });
        }
        Ok(())
    }

    async fn send_message(&self, queue: &str, message: &Message) -> ConveyorResult<()> {
        self.ensure_connected()?;
        validate_queue_name(queue)?;

        if let Some(limit) = self.max_payload_bytes {
            let size = serde_json::to_vec(&message.payload)?.len();
            if size > limit {
                return Err(ConveyorError::PayloadTooLarge { size, limit });
            }
        }

        let mut queues = self.queues.lock();
        let stored = queues
            .get_mut(queue)
            .ok_or_else(|| ConveyorError::QueueUnknown(queue.to_string()))?;

        let limit = stored
            .max_length
            .or(self.default_max_length.map(|v| v as u64));
        if let Some(limit) = limit {
            if stored.entries.len() as u64 >= limit {
                return Err(ConveyorError::Conflict(format!(
                    "queue {queue} is full ({limit} messages)"
                )));
            }
        }

        stored.entries.push(StoredMessage {
            message: message.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        });
        drop(queues);

        self.events.publish(&Event::MessageSent {
            queue: queue.to_string(),
            message_id: message.id.to_string(),
        });
        Ok(())
    }

    async fn receive_message(&self, queue: &str) -> ConveyorResult<Option<Message>> {
        self.ensure_connected()?;

        let now = Utc::now();
        let (message, expired) = {
            let mut queues = self.queues.lock();
            let stored = queues
                .get_mut(queue)
                .ok_or_else(|| ConveyorError::QueueUnknown(queue.to_string()))?;

            let mut expired = Vec::new();
            stored.entries.retain(|entry| {
                if entry.message.is_expired(now) {
                    expired.push(entry.message.clone());
                    false
                } else {
                    true
                }
            });

            // Strict max-priority, FIFO within a priority level.
            let mut best: Option<usize> = None;
            for (idx, entry) in stored.entries.iter().enumerate() {
                if !entry.message.is_due(now) {
                    continue;
                }
                match best {
                    None => best = Some(idx),
                    Some(current) => {
                        let chosen = &stored.entries[current];
                        let better = entry.message.metadata.priority
                            > chosen.message.metadata.priority
                            || (entry.message.metadata.priority == chosen.message.metadata.priority
                                && entry.seq < chosen.seq);
                        if better {
                            best = Some(idx);
                        }
                    }
                }
            }

            let message = best.map(|idx| {
                let entry = stored.entries.remove(idx);
                stored
                    .in_flight
                    .insert(entry.message.id.clone(), entry.message.clone());
                entry.message
            });
            (message, expired)
        };

        for dropped in &expired {
            self.drop_message(queue, dropped, "ttl expired");
        }

        if let Some(ref message) = message {
            self.events.publish(&Event::MessageReceived {
                queue: queue.to_string(),
                message_id: message.id.to_string(),
            });
        }
        Ok(message)
    }

    async fn acknowledge(&self, queue: &str, message: &Message) -> ConveyorResult<()> {
        self.ensure_connected()?;
        let mut queues = self.queues.lock();
        if let Some(stored) = queues.get_mut(queue) {
            stored.in_flight.remove(&message.id);
        }
        Ok(())
    }

    async fn reject(&self, queue: &str, message: &Message, requeue: bool) -> ConveyorResult<()> {
        self.ensure_connected()?;

        let taken = {
            let mut queues = self.queues.lock();
            let stored = queues
                .get_mut(queue)
                .ok_or_else(|| ConveyorError::QueueUnknown(queue.to_string()))?;
            stored.in_flight.remove(&message.id)
        };

        let Some(mut taken) = taken else {
            return Ok(());
        };

        if requeue && taken.can_redeliver() {
            taken.metadata.retry_count += 1;
            let mut queues = self.queues.lock();
            if let Some(stored) = queues.get_mut(queue) {
                stored.entries.push(StoredMessage {
                    message: taken,
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                });
            }
        } else if requeue {
            self.drop_message(queue, &taken, "max redeliveries exceeded");
        } else {
            self.drop_message(queue, &taken, "rejected");
        }
        Ok(())
    }

    async fn create_queue(&self, queue: &str, options: &QueueOptions) -> ConveyorResult<()> {
        self.ensure_connected()?;
        validate_queue_name(queue)?;

        let mut queues = self.queues.lock();
        queues.entry(queue.to_string()).or_insert_with(|| MemoryQueue {
            max_length: options.max_length,
            ..MemoryQueue::default()
        });
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> ConveyorResult<()> {
        self.ensure_connected()?;
        self.queues.lock().remove(queue);
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> ConveyorResult<u64> {
        self.ensure_connected()?;
        let mut queues = self.queues.lock();
        let stored = queues
            .get_mut(queue)
            .ok_or_else(|| ConveyorError::QueueUnknown(queue.to_string()))?;
        let purged = stored.entries.len() as u64;
        stored.entries.clear();
        Ok(purged)
    }

    async fn queue_info(&self, queue: &str) -> ConveyorResult<QueueInfo> {
        self.ensure_connected()?;
        let queues = self.queues.lock();
        let stored = queues
            .get(queue)
            .ok_or_else(|| ConveyorError::QueueUnknown(queue.to_string()))?;
        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: stored.entries.len() as u64,
            consumer_count: 0,
        })
    }

    async fn health(&self) -> ProviderHealth {
        let started = Instant::now();
        if self.connected.load(Ordering::SeqCst) {
            ProviderHealth::healthy(started.elapsed())
        } else {
            ProviderHealth::unhealthy("provider not connected")
        }
    }
}
