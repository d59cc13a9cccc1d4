//! Pub/sub pattern: broadcast a topic's messages to every active subscriber.
//!
//! Each message is delivered to all active subscribers concurrently and
//! acknowledged exactly once after every delivery settles. A subscriber whose
//! callback fails is deactivated until explicitly reactivated.

use crate::manager::QueueManager;
use conveyor_core::{ConveyorError, ConveyorResult, Event, Message};
use conveyor_worker::MessageSource;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Subscriber callback, invoked once per delivered message.
pub type SubscriberCallback =
    Arc<dyn Fn(Message) -> BoxFuture<'static, ConveyorResult<()>> + Send + Sync>;

struct Subscriber {
    callback: SubscriberCallback,
    active: Arc<AtomicBool>,
}

/// Pub/sub configuration.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Topic (queue) to broadcast.
    pub topic: String,

    /// Idle sleep when the topic is empty.
    pub poll_interval: Duration,
}

impl PubSubConfig {
    /// Default 100 ms idle poll.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Broadcasts one topic to registered subscribers.
pub struct PubSub {
    config: PubSubConfig,
    manager: Arc<QueueManager>,
    subscribers: Arc<RwLock<HashMap<String, Subscriber>>>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PubSub {
    /// Creates a stopped pub/sub bound to a manager.
    pub fn new(config: PubSubConfig, manager: Arc<QueueManager>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            manager,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Registers an active subscriber, replacing any existing registration.
    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        callback: impl Fn(Message) -> BoxFuture<'static, ConveyorResult<()>> + Send + Sync + 'static,
    ) {
        let subscriber_id = subscriber_id.into();
        self.subscribers.write().insert(
            subscriber_id.clone(),
            Subscriber {
                callback: Arc::new(callback),
                active: Arc::new(AtomicBool::new(true)),
            },
        );
        info!(topic = %self.config.topic, subscriber_id = %subscriber_id, "Subscriber registered");
    }

    /// Removes a subscriber entirely. Returns false if unknown.
    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.subscribers.write().remove(subscriber_id).is_some()
    }

    /// Reactivates a subscriber that was deactivated after a failure.
    /// Returns false if unknown.
    pub fn reactivate(&self, subscriber_id: &str) -> bool {
        match self.subscribers.read().get(subscriber_id) {
            Some(subscriber) => {
                subscriber.active.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// True if the subscriber exists and is active.
    pub fn is_active(&self, subscriber_id: &str) -> bool {
        self.subscribers
            .read()
            .get(subscriber_id)
            .is_some_and(|s| s.active.load(Ordering::SeqCst))
    }

    /// Number of active subscribers.
    pub fn active_count(&self) -> usize {
        self.subscribers
            .read()
            .values()
            .filter(|s| s.active.load(Ordering::SeqCst))
            .count()
    }

    /// Starts the broadcast loop.
    pub fn start(&self) -> ConveyorResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConveyorError::Conflict("pub/sub already running".to_string()));
        }

        let topic = self.config.topic.clone();
        let poll_interval = self.config.poll_interval;
        let manager = self.manager.clone();
        let subscribers = self.subscribers.clone();
        let running = self.running.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            info!(topic = %topic, "Pub/sub started");
            while running.load(Ordering::SeqCst) {
                let message = match manager.receive(&topic).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        tokio::select! {
                            _ = tokio::time::sleep(poll_interval) => continue,
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Receive failed");
                        tokio::time::sleep(poll_interval).await;
                        continue;
                    }
                };

                let active: Vec<(String, SubscriberCallback, Arc<AtomicBool>)> = {
                    let registry = subscribers.read();
                    registry
                        .iter()
                        .filter(|(_, s)| s.active.load(Ordering::SeqCst))
                        .map(|(id, s)| (id.clone(), s.callback.clone(), s.active.clone()))
                        .collect()
                };

                if active.is_empty() {
                    // Ack anyway: an empty audience must not block the topic.
                    manager.events().publish(&Event::NoActiveSubscribers {
                        topic: topic.clone(),
                    });
                    if let Err(e) = manager.acknowledge(&topic, &message).await {
                        warn!(topic = %topic, error = %e, "Acknowledge failed");
                    }
                    continue;
                }

                let deliveries = active.iter().map(|(id, callback, active_flag)| {
                    let message = message.clone();
                    let id = id.clone();
                    let callback = callback.clone();
                    let active_flag = active_flag.clone();
                    async move {
                        let outcome = AssertUnwindSafe(callback(message)).catch_unwind().await;
                        let failed = !matches!(outcome, Ok(Ok(())));
                        if failed {
                            active_flag.store(false, Ordering::SeqCst);
                        }
                        (id, failed)
                    }
                });

                for (subscriber_id, failed) in futures::future::join_all(deliveries).await {
                    if failed {
                        warn!(topic = %topic, subscriber_id = %subscriber_id, "Subscriber deactivated after failure");
                        manager.events().publish(&Event::SubscriberDeactivated {
                            topic: topic.clone(),
                            subscriber_id,
                        });
                    }
                }

                // Exactly one ack, after every delivery has settled.
                if let Err(e) = manager.acknowledge(&topic, &message).await {
                    warn!(topic = %topic, error = %e, "Acknowledge failed");
                }
                debug!(topic = %topic, message_id = %message.id, "Broadcast complete");
            }
            info!(topic = %topic, "Pub/sub stopped");
        });

        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Stops the broadcast loop.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.lock().take() {
            let _ = task.await;
        }
    }
}
