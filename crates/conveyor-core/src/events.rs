//! Process-wide event bus.
//!
//! Named, typed-payload fan-out used by every component for observability.
//! Delivery is synchronous in the publisher's context; listener lists are
//! copy-on-write so subscription changes during dispatch are safe. Correctness
//! of the system never depends on a listener being attached.

use crate::provider::HealthStatus;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Per-queue metrics snapshot published on each collection tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Queue name.
    pub queue: String,

    /// Messages waiting for delivery.
    pub message_count: u64,

    /// Attached consumers.
    pub consumer_count: u64,

    /// Jobs completed per second since the previous tick.
    pub processing_rate: f64,

    /// Failed attempts per second since the previous tick.
    pub error_rate: f64,

    /// Exponentially weighted average processing time.
    pub avg_processing_time: Duration,

    /// Collection instant.
    pub timestamp: DateTime<Utc>,
}

/// Events published across the framework.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    MessageSent { queue: String, message_id: String },
    MessageReceived { queue: String, message_id: String },
    MessageDeleted { queue: String, message_id: String },
    MessageDropped { queue: String, message_id: String, reason: String },
    ProviderConnected { provider: String },
    ProviderDisconnected { provider: String },
    ProviderError { provider: String, message: String },
    QueueCreated { queue: String, provider: String },
    QueueDeleted { queue: String, provider: String },
    QueuePurgeUnsupported { queue: String, provider: String },
    JobSubmitted { job_id: String, job_type: String },
    JobCreated { job_id: String, job_type: String },
    JobStarted { job_id: String },
    JobCompleted { job_id: String },
    JobFailed { job_id: String, message: String },
    JobRetryScheduled { job_id: String, attempt: u32, delay: Duration },
    JobRetryStarted { job_id: String },
    JobCancelled { job_id: String },
    SchedulerShutdown,
    JobProcessingCompleted { job_id: String, duration: Duration },
    JobProcessingFailed { job_id: String, message: String },
    NoWorkersAvailable { queue: String },
    NoActiveSubscribers { topic: String },
    SubscriberDeactivated { topic: String, subscriber_id: String },
    WorkerAdded { worker_id: String },
    WorkerRemoved { worker_id: String },
    MetricsCollected { queues: Vec<QueueMetrics> },
    HealthCheckCompleted { provider: String, status: HealthStatus },
}

impl Event {
    /// Wire name of the event, used for named subscriptions.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MessageSent { .. } => "message-sent",
            Self::MessageReceived { .. } => "message-received",
            Self::MessageDeleted { .. } => "message-deleted",
            Self::MessageDropped { .. } => "message-dropped",
            Self::ProviderConnected { .. } => "provider-connected",
            Self::ProviderDisconnected { .. } => "provider-disconnected",
            Self::ProviderError { .. } => "provider-error",
            Self::QueueCreated { .. } => "queue-created",
            Self::QueueDeleted { .. } => "queue-deleted",
            Self::QueuePurgeUnsupported { .. } => "queue-purge-unsupported",
            Self::JobSubmitted { .. } => "job-submitted",
            Self::JobCreated { .. } => "job-created",
            Self::JobStarted { .. } => "job-started",
            Self::JobCompleted { .. } => "job-completed",
            Self::JobFailed { .. } => "job-failed",
            Self::JobRetryScheduled { .. } => "job-retry-scheduled",
            Self::JobRetryStarted { .. } => "job-retry-started",
            Self::JobCancelled { .. } => "job-cancelled",
            Self::SchedulerShutdown => "scheduler-shutdown",
            Self::JobProcessingCompleted { .. } => "job-processing-completed",
            Self::JobProcessingFailed { .. } => "job-processing-failed",
            Self::NoWorkersAvailable { .. } => "no-workers-available",
            Self::NoActiveSubscribers { .. } => "no-active-subscribers",
            Self::SubscriberDeactivated { .. } => "subscriber-deactivated",
            Self::WorkerAdded { .. } => "worker-added",
            Self::WorkerRemoved { .. } => "worker-removed",
            Self::MetricsCollected { .. } => "metrics-collected",
            Self::HealthCheckCompleted { .. } => "health-check-completed",
        }
    }
}

/// Listener callback. Must not block indefinitely.
pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    event: String,
}

#[derive(Clone)]
struct ListenerEntry {
    id: u64,
    listener: EventListener,
}

/// Wildcard subscription key matching every event.
pub const ALL_EVENTS: &str = "*";

/// In-process publish/subscribe primitive.
pub struct EventBus {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<String, Arc<Vec<ListenerEntry>>>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes to a named event (or `ALL_EVENTS`).
    pub fn subscribe(
        &self,
        event: impl Into<String>,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let event = event.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ListenerEntry {
            id,
            listener: Arc::new(listener),
        };

        let mut map = self.listeners.write();
        let current = map.entry(event.clone()).or_insert_with(|| Arc::new(Vec::new()));
        let mut next = current.as_ref().clone();
        next.push(entry);
        *current = Arc::new(next);

        Subscription { id, event }
    }

    /// Subscribes to every event.
    pub fn subscribe_all(
        &self,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(ALL_EVENTS, listener)
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut map = self.listeners.write();
        let Some(current) = map.get_mut(&subscription.event) else {
            return false;
        };
        let before = current.len();
        let next: Vec<ListenerEntry> = current
            .iter()
            .filter(|entry| entry.id != subscription.id)
            .cloned()
            .collect();
        let removed = next.len() < before;
        *current = Arc::new(next);
        removed
    }

    /// Publishes an event to named and wildcard listeners, synchronously.
    ///
    /// Listener panics are caught and logged; they never affect the caller.
    pub fn publish(&self, event: &Event) {
        let (named, wildcard) = {
            let map = self.listeners.read();
            (
                map.get(event.name()).cloned(),
                map.get(ALL_EVENTS).cloned(),
            )
        };

        for batch in [named, wildcard].into_iter().flatten() {
            for entry in batch.iter() {
                let listener = &entry.listener;
                if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                    error!(event = event.name(), "Event listener panicked");
                }
            }
        }
    }

    /// Number of listeners registered for a name.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, |v| v.len())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
