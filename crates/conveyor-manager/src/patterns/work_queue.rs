//! Work-queue pattern: competing consumers over one queue.
//!
//! A receive loop pulls one message per iteration and hands it to one
//! registered worker, selected by the pool's load-balancing strategy. The
//! worker settles the delivery through exactly one of `acknowledge`,
//! `complete`, or `fail`.

use crate::manager::QueueManager;
use conveyor_core::{ConveyorError, ConveyorResult, Event, Job, Message};
use conveyor_worker::{select_index, JobLifecycle, LoadBalancingStrategy, MessageSource};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Worker callback: receives one delivery and must settle it.
pub type WorkerCallback = Arc<dyn Fn(WorkerDelivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// One message handed to a worker, with its settlement operations.
///
/// Exactly one of `acknowledge`, `complete`, or `fail` may succeed; later
/// calls return `Conflict` so the underlying delivery is never acknowledged
/// twice.
pub struct WorkerDelivery {
    /// The raw message.
    pub message: Message,

    /// The job envelope, when the payload parses as one.
    pub job: Option<Job>,

    queue: String,
    manager: Arc<QueueManager>,
    settled: Arc<AtomicBool>,
}

impl WorkerDelivery {
    fn settle(&self) -> ConveyorResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(ConveyorError::Conflict(format!(
                "delivery {} already settled",
                self.message.id
            )));
        }
        Ok(())
    }

    /// Acknowledges and drops the message.
    pub async fn acknowledge(&self) -> ConveyorResult<()> {
        self.settle()?;
        self.manager.acknowledge(&self.queue, &self.message).await
    }

    /// Acknowledges the message and completes the job with a result.
    pub async fn complete(&self, result: Value) -> ConveyorResult<()> {
        self.settle()?;
        if let Some(job) = &self.job {
            self.manager.complete_job(&job.id, Some(result)).await?;
        }
        self.manager.acknowledge(&self.queue, &self.message).await
    }

    /// Acknowledges the message and fails the job, triggering retry policy.
    pub async fn fail(&self, error: ConveyorError) -> ConveyorResult<()> {
        self.settle()?;
        if let Some(job) = &self.job {
            self.manager.fail_job(&job.id, &error).await?;
        }
        self.manager.acknowledge(&self.queue, &self.message).await
    }
}

struct RegisteredWorker {
    callback: WorkerCallback,
    load: Arc<AtomicUsize>,
}

/// Work-queue configuration.
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Queue to consume.
    pub queue: String,

    /// Worker selection strategy.
    pub strategy: LoadBalancingStrategy,

    /// Idle sleep when the queue is empty.
    pub poll_interval: Duration,
}

impl WorkQueueConfig {
    /// Round-robin dispatch with a 100 ms idle poll.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            strategy: LoadBalancingStrategy::RoundRobin,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Dispatches one queue's messages across registered workers.
pub struct WorkQueue {
    config: WorkQueueConfig,
    manager: Arc<QueueManager>,
    workers: Arc<RwLock<HashMap<String, RegisteredWorker>>>,
    cursor: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Creates a stopped work queue bound to a manager.
    pub fn new(config: WorkQueueConfig, manager: Arc<QueueManager>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            manager,
            workers: Arc::new(RwLock::new(HashMap::new())),
            cursor: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Registers a worker callback under an id, replacing any existing one.
    pub fn register_worker(
        &self,
        worker_id: impl Into<String>,
        callback: impl Fn(WorkerDelivery) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) {
        let worker_id = worker_id.into();
        self.workers.write().insert(
            worker_id.clone(),
            RegisteredWorker {
                callback: Arc::new(callback),
                load: Arc::new(AtomicUsize::new(0)),
            },
        );
        info!(queue = %self.config.queue, worker_id = %worker_id, "Registered worker");
    }

    /// Removes a worker. Returns false if it was not registered.
    pub fn unregister_worker(&self, worker_id: &str) -> bool {
        self.workers.write().remove(worker_id).is_some()
    }

    /// Number of registered workers.
    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Starts the receive loop.
    pub fn start(&self) -> ConveyorResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConveyorError::Conflict("work queue already running".to_string()));
        }

        let queue = self.config.queue.clone();
        let strategy = self.config.strategy;
        let poll_interval = self.config.poll_interval;
        let manager = self.manager.clone();
        let workers = self.workers.clone();
        let cursor = self.cursor.clone();
        let running = self.running.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            info!(queue = %queue, "Work queue started");
            while running.load(Ordering::SeqCst) {
                let message = match manager.receive(&queue).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        tokio::select! {
                            _ = tokio::time::sleep(poll_interval) => continue,
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Receive failed");
                        tokio::time::sleep(poll_interval).await;
                        continue;
                    }
                };

                let selected = {
                    let registry = workers.read();
                    let mut entries: Vec<(&String, &RegisteredWorker)> = registry.iter().collect();
                    entries.sort_by(|a, b| a.0.cmp(b.0));
                    let loads: Vec<usize> = entries
                        .iter()
                        .map(|(_, w)| w.load.load(Ordering::SeqCst))
                        .collect();
                    select_index(strategy, &loads, &cursor).map(|idx| {
                        let (id, worker) = entries[idx];
                        (id.clone(), worker.callback.clone(), worker.load.clone())
                    })
                };

                let Some((worker_id, callback, load)) = selected else {
                    // Nobody to hand it to: back to the queue for redelivery.
                    manager.events().publish(&Event::NoWorkersAvailable {
                        queue: queue.clone(),
                    });
                    if let Err(e) = manager.reject(&queue, &message, true).await {
                        warn!(queue = %queue, error = %e, "Requeue failed");
                    }
                    tokio::time::sleep(poll_interval).await;
                    continue;
                };

                let job = Job::from_envelope(&message.payload).ok();
                if let Some(job) = &job {
                    // Mark the job Running before the worker sees it; a job
                    // that moved on (cancelled) is dropped here.
                    if let Err(e) = manager.start_job(&job.id).await {
                        debug!(job_id = %job.id, error = %e, "Skipping stale job envelope");
                        if let Err(e) = manager.acknowledge(&queue, &message).await {
                            warn!(queue = %queue, error = %e, "Acknowledge failed");
                        }
                        continue;
                    }
                }

                let delivery = WorkerDelivery {
                    message,
                    job,
                    queue: queue.clone(),
                    manager: manager.clone(),
                    settled: Arc::new(AtomicBool::new(false)),
                };

                debug!(queue = %queue, worker_id = %worker_id, "Dispatching to worker");
                load.fetch_add(1, Ordering::SeqCst);
                callback(delivery).await;
                load.fetch_sub(1, Ordering::SeqCst);
            }
            info!(queue = %queue, "Work queue stopped");
        });

        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Stops the receive loop.
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

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_config::ConveyorConfig;
    use conveyor_core::{JobOptions, JobStatus, SendOptions};
    use serde_json::json;

    async fn manager() -> Arc<QueueManager> {
        let config = ConveyorConfig::in_memory().with_queue("work");
        let manager = QueueManager::new(config).unwrap();
        manager.start().await.unwrap();
        manager
    }

    fn fast_config() -> WorkQueueConfig {
        WorkQueueConfig {
            queue: "work".to_string(),
            strategy: LoadBalancingStrategy::RoundRobin,
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_dispatch_and_acknowledge() {
        let manager = manager().await;
        let work_queue = WorkQueue::new(fast_config(), manager.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        work_queue.register_worker("w1", move |delivery| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push(delivery.message.payload.clone());
                delivery.acknowledge().await.unwrap();
            })
        });

        work_queue.start().unwrap();
        manager
            .send_message("work", json!("task-1"), SendOptions::default())
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().is_empty() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.lock()[0], json!("task-1"));

        work_queue.stop().await;
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_workers_requeues_message() {
        let manager = manager().await;
        let work_queue = WorkQueue::new(fast_config(), manager.clone());

        let starved = Arc::new(AtomicBool::new(false));
        let flag = starved.clone();
        manager.events().subscribe("no-workers-available", move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        work_queue.start().unwrap();
        // Generous redelivery allowance: the message cycles while no worker exists.
        manager
            .send_message(
                "work",
                json!("orphan"),
                SendOptions { max_retries: Some(1000), ..Default::default() },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(starved.load(Ordering::SeqCst));

        // Registering a worker picks the redelivered message up.
        let seen = Arc::new(AtomicBool::new(false));
        let sink = seen.clone();
        work_queue.register_worker("late", move |delivery| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.store(true, Ordering::SeqCst);
                delivery.acknowledge().await.unwrap();
            })
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !seen.load(Ordering::SeqCst) {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        work_queue.stop().await;
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_callback_finishes_job() {
        let manager = manager().await;
        let id = manager
            .submit_job("sum", json!({"a": 1, "b": 2}), JobOptions::default())
            .await
            .unwrap();

        let work_queue = WorkQueue::new(
            WorkQueueConfig {
                queue: "jobs-sum".to_string(),
                ..fast_config()
            },
            manager.clone(),
        );
        work_queue.register_worker("w1", |delivery| {
            Box::pin(async move {
                delivery.complete(json!(3)).await.unwrap();
            })
        });
        work_queue.start().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let job = manager.get_job_status(&id).unwrap();
            if job.status == JobStatus::Completed {
                assert_eq!(job.result, Some(json!(3)));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        work_queue.stop().await;
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_settlement_rejected() {
        let manager = manager().await;
        let work_queue = WorkQueue::new(fast_config(), manager.clone());

        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        work_queue.register_worker("w1", move |delivery| {
            let sink = sink.clone();
            Box::pin(async move {
                delivery.acknowledge().await.unwrap();
                *sink.lock() = Some(delivery.acknowledge().await.is_err());
            })
        });

        work_queue.start().unwrap();
        manager
            .send_message("work", json!(1), SendOptions::default())
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while outcome.lock().is_none() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*outcome.lock(), Some(true));

        work_queue.stop().await;
        manager.stop().await.unwrap();
    }
}
