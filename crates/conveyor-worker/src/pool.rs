//! Worker pool: long-running consumers that pull job envelopes off queues
//! and drive them through the processor.

use crate::processor::{JobProcessor, ProcessOutcome};
use async_trait::async_trait;
use conveyor_core::{ConveyorError, ConveyorResult, Event, EventBus, Job, Message};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Message operations a worker needs from the queue manager.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Pulls one message, or `None` when the queue is empty.
    async fn receive(&self, queue: &str) -> ConveyorResult<Option<Message>>;

    /// Confirms a delivery so the backend will not redeliver it.
    async fn acknowledge(&self, queue: &str, message: &Message) -> ConveyorResult<()>;

    /// Returns a delivery to the backend, optionally for redelivery.
    async fn reject(&self, queue: &str, message: &Message, requeue: bool) -> ConveyorResult<()>;
}

/// Worker selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    /// Cycle through live workers.
    #[default]
    RoundRobin,
    /// Pick the worker with the smallest current load.
    LeastLoaded,
    /// Pick uniformly at random.
    Random,
}

/// Auto-scaling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoScaleConfig {
    /// Enable the scaling ticker.
    #[serde(default)]
    pub enabled: bool,

    /// How often utilisation is evaluated.
    #[serde(default = "default_check_interval")]
    pub check_interval: Duration,

    /// Utilisation above which one worker is added.
    #[serde(default = "default_scale_up")]
    pub scale_up_threshold: f64,

    /// Utilisation below which one worker is removed.
    #[serde(default = "default_scale_down")]
    pub scale_down_threshold: f64,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: default_check_interval(),
            scale_up_threshold: default_scale_up(),
            scale_down_threshold: default_scale_down(),
        }
    }
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_scale_up() -> f64 {
    0.75
}

fn default_scale_down() -> f64 {
    0.25
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Lower bound on pool size.
    pub min_workers: usize,

    /// Upper bound on pool size.
    pub max_workers: usize,

    /// Workers spawned at start, clamped to the bounds.
    pub initial_workers: usize,

    /// Queues each worker polls, in order.
    pub queues: Vec<String>,

    /// Idle sleep between empty sweeps.
    pub poll_interval: Duration,

    /// Selection strategy for `next_worker`.
    pub strategy: LoadBalancingStrategy,

    /// Auto-scaling settings.
    pub autoscale: AutoScaleConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            initial_workers: 4,
            queues: Vec::new(),
            poll_interval: Duration::from_millis(100),
            strategy: LoadBalancingStrategy::RoundRobin,
            autoscale: AutoScaleConfig::default(),
        }
    }
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolStats {
    pub worker_count: usize,
    pub total_load: usize,
    pub utilisation: f64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub running: bool,
}

/// Per-worker detail.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub load: usize,
    pub active: bool,
}

struct WorkerHandle {
    load: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

/// Maintains N worker loops over a shared message source.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    source: Arc<dyn MessageSource>,
    processor: Arc<JobProcessor>,
    events: Arc<EventBus>,
    workers: Arc<Mutex<HashMap<String, WorkerHandle>>>,
    rr_cursor: AtomicUsize,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    autoscale_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a stopped pool.
    pub fn new(
        config: WorkerPoolConfig,
        source: Arc<dyn MessageSource>,
        processor: Arc<JobProcessor>,
        events: Arc<EventBus>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            source,
            processor,
            events,
            workers: Arc::new(Mutex::new(HashMap::new())),
            rr_cursor: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            shutdown_tx,
            autoscale_task: Mutex::new(None),
        }
    }

    /// Spawns the initial workers and, if configured, the auto-scaler.
    pub fn start(self: &Arc<Self>) -> ConveyorResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConveyorError::Conflict("worker pool already running".to_string()));
        }

        let initial = self
            .config
            .initial_workers
            .clamp(self.config.min_workers, self.config.max_workers);
        for _ in 0..initial {
            self.spawn_worker();
        }

        if self.config.autoscale.enabled {
            let pool = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(pool.config.autoscale.check_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => pool.autoscale_tick(),
                    }
                }
            });
            *self.autoscale_task.lock() = Some(handle);
        }

        info!(workers = initial, queues = ?self.config.queues, "Worker pool started");
        Ok(())
    }

    /// Stops accepting work and lets in-flight jobs finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        if let Some(task) = self.autoscale_task.lock().take() {
            task.abort();
        }

        for handle in self.workers.lock().values() {
            handle.active.store(false, Ordering::SeqCst);
        }

        // Workers deregister themselves once their current job is done.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !self.workers.lock().is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!("Worker pool stop timed out with workers still draining");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        info!("Worker pool stopped");
    }

    /// Scales to `n` workers, clamped to `[min_workers, max_workers]`.
    /// Surplus workers finish their current job before exiting.
    pub fn scale_to(self: &Arc<Self>, n: usize) -> usize {
        let target = n.clamp(self.config.min_workers, self.config.max_workers);
        let current = self.live_workers().len();

        if target > current {
            for _ in current..target {
                self.spawn_worker();
            }
        } else if target < current {
            let mut live = self.live_workers();
            // Retire the least-loaded first.
            live.sort_by_key(|(_, load)| *load);
            let workers = self.workers.lock();
            for (id, _) in live.iter().take(current - target) {
                if let Some(handle) = workers.get(id) {
                    handle.active.store(false, Ordering::SeqCst);
                }
            }
        }
        target
    }

    /// Picks a worker id by the configured strategy.
    pub fn next_worker(&self) -> Option<String> {
        let live = self.live_workers();
        let loads: Vec<usize> = live.iter().map(|(_, load)| *load).collect();
        select_index(self.config.strategy, &loads, &self.rr_cursor)
            .map(|idx| live[idx].0.clone())
    }

    /// Pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        let live = self.live_workers();
        let total_load: usize = live.iter().map(|(_, load)| *load).sum();
        let count = live.len();
        WorkerPoolStats {
            worker_count: count,
            total_load,
            utilisation: if count == 0 {
                0.0
            } else {
                total_load as f64 / count as f64
            },
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// Per-worker details, including workers that are draining.
    pub fn worker_details(&self) -> Vec<WorkerInfo> {
        self.workers
            .lock()
            .iter()
            .map(|(id, handle)| WorkerInfo {
                id: id.clone(),
                load: handle.load.load(Ordering::SeqCst),
                active: handle.active.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// True while the pool accepts work.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn live_workers(&self) -> Vec<(String, usize)> {
        let mut live: Vec<(String, usize)> = self
            .workers
            .lock()
            .iter()
            .filter(|(_, handle)| handle.active.load(Ordering::SeqCst))
            .map(|(id, handle)| (id.clone(), handle.load.load(Ordering::SeqCst)))
            .collect();
        // Stable order so the round-robin cursor cycles deterministically.
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }

    fn autoscale_tick(self: &Arc<Self>) {
        let stats = self.stats();
        if stats.worker_count == 0 {
            return;
        }
        let config = &self.config.autoscale;

        if stats.utilisation > config.scale_up_threshold
            && stats.worker_count < self.config.max_workers
        {
            debug!(utilisation = stats.utilisation, "Scaling up by one worker");
            self.scale_to(stats.worker_count + 1);
        } else if stats.utilisation < config.scale_down_threshold
            && stats.worker_count > self.config.min_workers
        {
            debug!(utilisation = stats.utilisation, "Scaling down by one worker");
            self.scale_to(stats.worker_count - 1);
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let id = format!("worker-{}", Uuid::new_v4());
        let load = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicBool::new(true));

        let worker_id = id.clone();
        let worker_load = load.clone();
        let worker_active = active.clone();
        let source = self.source.clone();
        let processor = self.processor.clone();
        let events = self.events.clone();
        let queues = self.config.queues.clone();
        let poll_interval = self.config.poll_interval;
        let workers = self.workers.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            debug!(worker_id = %worker_id, "Worker loop started");
            'outer: while worker_active.load(Ordering::SeqCst) {
                let mut handled = false;
                for queue in &queues {
                    if !worker_active.load(Ordering::SeqCst) {
                        break;
                    }
                    match source.receive(queue).await {
                        Ok(Some(message)) => {
                            handled = true;
                            worker_load.fetch_add(1, Ordering::SeqCst);
                            deliver(&source, &processor, queue, message).await;
                            worker_load.fetch_sub(1, Ordering::SeqCst);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(worker_id = %worker_id, queue = %queue, error = %e, "Receive failed");
                        }
                    }
                }

                if !handled {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown_rx.recv() => break 'outer,
                    }
                }
            }

            workers.lock().remove(&worker_id);
            events.publish(&Event::WorkerRemoved {
                worker_id: worker_id.clone(),
            });
            debug!(worker_id = %worker_id, "Worker loop exited");
        });

        self.workers.lock().insert(id.clone(), WorkerHandle { load, active, task });
        self.events.publish(&Event::WorkerAdded { worker_id: id });
    }
}

/// Processes one delivery: decode the job envelope, run it, and settle the
/// message. The message is acknowledged unless redelivery is wanted.
async fn deliver(
    source: &Arc<dyn MessageSource>,
    processor: &Arc<JobProcessor>,
    queue: &str,
    message: Message,
) {
    let job = match Job::from_envelope(&message.payload) {
        Ok(job) => job,
        Err(e) => {
            warn!(queue, message_id = %message.id, error = %e, "Unparseable job envelope");
            if let Err(e) = source.reject(queue, &message, false).await {
                warn!(queue, error = %e, "Reject failed");
            }
            return;
        }
    };

    match processor.process(job).await {
        Ok(ProcessOutcome::Completed(_) | ProcessOutcome::Failed(_) | ProcessOutcome::Cancelled) => {
            // Failures re-enter through a fresh envelope, so this delivery
            // is done either way.
            if let Err(e) = source.acknowledge(queue, &message).await {
                warn!(queue, message_id = %message.id, error = %e, "Acknowledge failed");
            }
        }
        Err(ConveyorError::IllegalTransition { .. }) => {
            // The job moved on (e.g. cancelled) before we could start it.
            if let Err(e) = source.acknowledge(queue, &message).await {
                warn!(queue, message_id = %message.id, error = %e, "Acknowledge failed");
            }
        }
        Err(e) => {
            // Admission refused (circuit open, overloaded, missing handler):
            // leave the message to the backend for redelivery.
            debug!(queue, message_id = %message.id, error = %e, "Processing deferred");
            if let Err(e) = source.reject(queue, &message, true).await {
                warn!(queue, message_id = %message.id, error = %e, "Requeue failed");
            }
        }
    }
}

/// Picks an index into `loads` by strategy. Shared by the pool and the
/// work-queue pattern.
pub fn select_index(
    strategy: LoadBalancingStrategy,
    loads: &[usize],
    cursor: &AtomicUsize,
) -> Option<usize> {
    if loads.is_empty() {
        return None;
    }
    match strategy {
        LoadBalancingStrategy::RoundRobin => {
            Some(cursor.fetch_add(1, Ordering::Relaxed) % loads.len())
        }
        LoadBalancingStrategy::LeastLoaded => loads
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| **load)
            .map(|(idx, _)| idx),
        LoadBalancingStrategy::Random => Some(pseudo_random(loads.len() as u64) as usize),
    }
}

/// Time-seeded LCG; good enough for spreading work, no rand dependency.
fn pseudo_random(range: u64) -> u64 {
    if range == 0 {
        return 0;
    }
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    let a: u64 = 6364136223846793005;
    let c: u64 = 1442695040888963407;
    seed.wrapping_mul(a).wrapping_add(c) % range
}
