//! Queue manager: the central coordinator.
//!
//! Owns the providers and the queue routing table, mediates message and job
//! traffic, keeps aggregate counters, and runs the periodic metrics and
//! health tasks. Job state itself lives in the scheduler, the single
//! authoritative store; the manager is a read-through view plus transport
//! glue.

use crate::metrics::names;
use async_trait::async_trait;
use chrono::Utc;
use conveyor_config::{ConveyorConfig, QueueOptions};
use conveyor_core::{
    job_queue_name, ConveyorError, ConveyorResult, Event, EventBus, HealthStatus, Job, JobFailure,
    JobId, JobOptions, JobStatus, Message, MessageId, ProviderKind, QueueInfo, QueueMetrics,
    SendOptions,
};
use conveyor_scheduler::{JobScheduler, RetryDecision, SchedulerStats};
use conveyor_transport::{build_provider, Provider};
use conveyor_worker::{JobLifecycle, MessageSource};
use metrics::{counter, gauge, histogram};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// EWMA weight for the average-processing-time estimate.
const AVG_PROCESSING_ALPHA: f64 = 0.2;

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// A declared queue and the provider it routes to.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDescriptor {
    /// Queue name.
    pub name: String,

    /// Provider name.
    pub provider: String,

    /// Options passed to the backend at creation.
    pub options: QueueOptions,
}

/// Provider summary for `providers()`.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescriptor {
    /// Provider name.
    pub name: String,

    /// Backend kind.
    pub kind: ProviderKind,
}

/// Aggregate statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Successful send calls.
    pub total_messages_sent: u64,
    /// Non-empty receive calls.
    pub total_messages_received: u64,
    /// Acknowledged deliveries.
    pub total_messages_deleted: u64,
    /// Jobs accepted by `submit_job`.
    pub total_jobs_submitted: u64,
    /// Jobs completed successfully.
    pub total_jobs_processed: u64,
    /// Failed attempts, including ones that led to a retry.
    pub attempt_failures: u64,
    /// Jobs that exhausted their retries.
    pub total_jobs_failed: u64,
    /// Jobs cancelled.
    pub total_jobs_cancelled: u64,
    /// Jobs submitted but not yet terminal.
    pub queued_jobs: i64,
    /// EWMA of job execution time in milliseconds.
    pub avg_processing_time_ms: f64,
    /// Scheduler-side view.
    pub scheduler: SchedulerStats,
}

#[derive(Default)]
struct ManagerStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_deleted: AtomicU64,
    jobs_submitted: AtomicU64,
    jobs_processed: AtomicU64,
    attempt_failures: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    queued_jobs: AtomicI64,
    avg_processing_time_ms: Mutex<Option<f64>>,
}

impl ManagerStats {
    fn record_processing_time(&self, elapsed_ms: f64) {
        let mut avg = self.avg_processing_time_ms.lock();
        *avg = Some(match *avg {
            Some(current) => AVG_PROCESSING_ALPHA * elapsed_ms + (1.0 - AVG_PROCESSING_ALPHA) * current,
            None => elapsed_ms,
        });
    }
}

/// The central coordinator over providers, queues, jobs, and statistics.
pub struct QueueManager {
    config: ConveyorConfig,
    providers: HashMap<String, Arc<dyn Provider>>,
    queues: RwLock<HashMap<String, QueueDescriptor>>,
    scheduler: Arc<JobScheduler>,
    events: Arc<EventBus>,
    stats: ManagerStats,
    state: AtomicU8,
    periodic_tasks: Mutex<Vec<JoinHandle<()>>>,
    resend_timers: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

impl QueueManager {
    /// Builds a manager from validated configuration. Providers are
    /// constructed here; connections happen in `start`.
    pub fn new(config: ConveyorConfig) -> ConveyorResult<Arc<Self>> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for provider_config in &config.providers {
            let provider = build_provider(provider_config, events.clone())?;
            providers.insert(provider_config.name.clone(), provider);
        }

        let scheduler = Arc::new(JobScheduler::new(config.retry_policy.clone(), events.clone()));

        Ok(Arc::new(Self {
            config,
            providers,
            queues: RwLock::new(HashMap::new()),
            scheduler,
            events,
            stats: ManagerStats::default(),
            state: AtomicU8::new(STATE_CREATED),
            periodic_tasks: Mutex::new(Vec::new()),
            resend_timers: Mutex::new(HashMap::new()),
        }))
    }

    /// The shared event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The authoritative job scheduler.
    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Connects every provider, declares the configured queues, and spawns
    /// the periodic monitoring tasks.
    pub async fn start(self: &Arc<Self>) -> ConveyorResult<()> {
        if self.state.load(Ordering::SeqCst) == STATE_RUNNING {
            return Ok(());
        }

        for (name, provider) in &self.providers {
            provider.connect().await.map_err(|e| {
                error!(provider = %name, error = %e, "Provider connect failed");
                e
            })?;
        }

        self.state.store(STATE_RUNNING, Ordering::SeqCst);

        let bindings: Vec<(String, String, QueueOptions)> = self
            .config
            .queues
            .iter()
            .map(|(name, binding)| (name.clone(), binding.provider.clone(), binding.options.clone()))
            .collect();
        for (name, provider, options) in bindings {
            self.declare_queue(&name, &provider, options).await?;
        }

        if self.config.monitoring.enabled {
            let mut tasks = self.periodic_tasks.lock();
            tasks.push(self.spawn_metrics_task());
            tasks.push(self.spawn_health_task());
        }

        info!(
            providers = self.providers.len(),
            queues = self.queues.read().len(),
            "Queue manager started"
        );
        Ok(())
    }

    /// Stops periodic tasks, shuts the scheduler down, and disconnects every
    /// provider; one provider's failure does not abort the others. Idempotent.
    pub async fn stop(&self) -> ConveyorResult<()> {
        if self.state.swap(STATE_STOPPED, Ordering::SeqCst) != STATE_RUNNING {
            return Ok(());
        }

        for task in self.periodic_tasks.lock().drain(..) {
            task.abort();
        }
        for (_, timer) in self.resend_timers.lock().drain() {
            timer.abort();
        }

        // Scheduler shutdown force-cancels Running jobs through its own
        // cancel path, which bypasses the lifecycle stats; reconcile the
        // jobs it reports cancelled so the counters stay in step.
        let cancelled = self.scheduler.shutdown();
        if !cancelled.is_empty() {
            self.stats
                .queued_jobs
                .fetch_sub(cancelled.len() as i64, Ordering::Relaxed);
            self.stats
                .jobs_cancelled
                .fetch_add(cancelled.len() as u64, Ordering::Relaxed);
            counter!(names::JOBS_CANCELLED_TOTAL).increment(cancelled.len() as u64);
        }

        let disconnects = self
            .providers
            .iter()
            .map(|(name, provider)| async move { (name.clone(), provider.disconnect().await) });
        for (name, result) in futures::future::join_all(disconnects).await {
            if let Err(e) = result {
                warn!(provider = %name, error = %e, "Disconnect failed");
            }
        }

        info!("Queue manager stopped");
        Ok(())
    }

    /// True while `start` has completed and `stop` has not run.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    /// Sends an opaque payload to a declared queue.
    pub async fn send_message(
        &self,
        queue: &str,
        payload: Value,
        opts: SendOptions,
    ) -> ConveyorResult<MessageId> {
        self.ensure_running()?;
        let provider = self.resolve_provider(queue)?;

        let message = Message::with_options(payload, &opts, self.config.retry_policy.max_retries);
        message.validate()?;

        provider.send_message(queue, &message).await?;

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        counter!(names::MESSAGES_SENT_TOTAL).increment(1);
        debug!(queue, message_id = %message.id, "Message sent");
        Ok(message.id)
    }

    /// Receives the next message from a declared queue, if any.
    pub async fn receive_message(&self, queue: &str) -> ConveyorResult<Option<Message>> {
        self.ensure_running()?;
        let provider = self.resolve_provider(queue)?;

        let message = provider.receive_message(queue).await?;
        if message.is_some() {
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
            counter!(names::MESSAGES_RECEIVED_TOTAL).increment(1);
        }
        Ok(message)
    }

    /// Acknowledges a received message so it will not be redelivered.
    pub async fn delete_message(&self, queue: &str, message: &Message) -> ConveyorResult<()> {
        self.ensure_running()?;
        let provider = self.resolve_provider(queue)?;

        provider.acknowledge(queue, message).await?;

        self.stats.messages_deleted.fetch_add(1, Ordering::Relaxed);
        counter!(names::MESSAGES_DELETED_TOTAL).increment(1);
        self.events.publish(&Event::MessageDeleted {
            queue: queue.to_string(),
            message_id: message.id.to_string(),
        });
        Ok(())
    }

    /// Creates a job and enqueues its envelope on `jobs-<type>`. The queue is
    /// declared on the default provider if it does not exist yet.
    pub async fn submit_job(
        &self,
        job_type: &str,
        data: Value,
        opts: JobOptions,
    ) -> ConveyorResult<JobId> {
        self.ensure_running()?;

        let job = Job::new(
            job_type,
            data,
            opts,
            self.config.retry_policy.max_retries,
            self.config.retry_policy.retry_delay(),
        );
        job.validate()?;

        let queue = job_queue_name(job_type);
        if !self.queues.read().contains_key(&queue) {
            let provider = self.config.default_provider.clone();
            self.declare_queue(&queue, &provider, QueueOptions::default())
                .await?;
        }

        let job = self.scheduler.create_job(job)?;
        let job_id = job.id.clone();

        if let Err(e) = self.send_job_envelope(&job).await {
            // Roll the record back so a failed submit leaves no trace.
            self.scheduler.remove_job(&job_id);
            return Err(e);
        }

        self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.stats.queued_jobs.fetch_add(1, Ordering::Relaxed);
        counter!(names::JOBS_SUBMITTED_TOTAL).increment(1);
        self.events.publish(&Event::JobSubmitted {
            job_id: job_id.to_string(),
            job_type: job_type.to_string(),
        });
        debug!(job_id = %job_id, job_type, "Job submitted");
        Ok(job_id)
    }

    /// Snapshot of a job, if known.
    pub fn get_job_status(&self, id: &JobId) -> Option<Job> {
        self.scheduler.get_job(id)
    }

    /// Cancels a job that has not started. Returns false when the job is
    /// missing or Running; Running jobs are only ended by timeout or by the
    /// processor.
    pub fn cancel_job(&self, id: &JobId) -> bool {
        let Some(job) = self.scheduler.get_job(id) else {
            return false;
        };
        if job.status == JobStatus::Running {
            return false;
        }

        match self.scheduler.cancel_job(id) {
            Ok(_) => {
                if let Some(timer) = self.resend_timers.lock().remove(id) {
                    timer.abort();
                }
                self.stats.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                self.stats.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
                counter!(names::JOBS_CANCELLED_TOTAL).increment(1);
                true
            }
            Err(e) => {
                debug!(job_id = %id, error = %e, "Cancel refused");
                false
            }
        }
    }

    /// Declares a queue on a provider (the default provider when `provider`
    /// is `None`).
    pub async fn create_queue(
        &self,
        queue: &str,
        provider: Option<&str>,
        options: QueueOptions,
    ) -> ConveyorResult<()> {
        self.ensure_running()?;
        let provider = provider
            .unwrap_or(self.config.default_provider.as_str())
            .to_string();
        self.declare_queue(queue, &provider, options).await
    }

    /// Deletes a queue from its provider and the routing table.
    pub async fn delete_queue(&self, queue: &str) -> ConveyorResult<()> {
        self.ensure_running()?;
        let descriptor = self
            .queues
            .read()
            .get(queue)
            .cloned()
            .ok_or_else(|| ConveyorError::QueueUnknown(queue.to_string()))?;

        let provider = self.provider(&descriptor.provider)?;
        provider.delete_queue(queue).await?;
        self.queues.write().remove(queue);

        self.events.publish(&Event::QueueDeleted {
            queue: queue.to_string(),
            provider: descriptor.provider,
        });
        Ok(())
    }

    /// Drops all waiting messages from a queue.
    pub async fn purge_queue(&self, queue: &str) -> ConveyorResult<u64> {
        self.ensure_running()?;
        let provider = self.resolve_provider(queue)?;
        provider.purge_queue(queue).await
    }

    /// Best-effort statistics for one queue.
    pub async fn queue_info(&self, queue: &str) -> ConveyorResult<QueueInfo> {
        self.ensure_running()?;
        let provider = self.resolve_provider(queue)?;
        provider.queue_info(queue).await
    }

    /// Declared providers.
    pub fn providers(&self) -> Vec<ProviderDescriptor> {
        let mut list: Vec<ProviderDescriptor> = self
            .providers
            .values()
            .map(|p| ProviderDescriptor {
                name: p.name().to_string(),
                kind: p.kind(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Declared queues.
    pub fn queues(&self) -> Vec<QueueDescriptor> {
        let mut list: Vec<QueueDescriptor> = self.queues.read().values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Aggregate statistics. Fields are individually accurate; a snapshot may
    /// be momentarily inconsistent across fields.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            total_messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            total_messages_deleted: self.stats.messages_deleted.load(Ordering::Relaxed),
            total_jobs_submitted: self.stats.jobs_submitted.load(Ordering::Relaxed),
            total_jobs_processed: self.stats.jobs_processed.load(Ordering::Relaxed),
            attempt_failures: self.stats.attempt_failures.load(Ordering::Relaxed),
            total_jobs_failed: self.stats.jobs_failed.load(Ordering::Relaxed),
            total_jobs_cancelled: self.stats.jobs_cancelled.load(Ordering::Relaxed),
            queued_jobs: self.stats.queued_jobs.load(Ordering::Relaxed),
            avg_processing_time_ms: self.stats.avg_processing_time_ms.lock().unwrap_or(0.0),
            scheduler: self.scheduler.stats(),
        }
    }

    fn ensure_running(&self) -> ConveyorResult<()> {
        if !self.is_running() {
            return Err(ConveyorError::NotRunning);
        }
        Ok(())
    }

    fn provider(&self, name: &str) -> ConveyorResult<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ConveyorError::ProviderUnknown(name.to_string()))
    }

    fn resolve_provider(&self, queue: &str) -> ConveyorResult<Arc<dyn Provider>> {
        let descriptor = self
            .queues
            .read()
            .get(queue)
            .cloned()
            .ok_or_else(|| ConveyorError::QueueUnknown(queue.to_string()))?;
        self.provider(&descriptor.provider)
    }

    async fn declare_queue(
        &self,
        queue: &str,
        provider_name: &str,
        options: QueueOptions,
    ) -> ConveyorResult<()> {
        let provider = self.provider(provider_name)?;
        provider.create_queue(queue, &options).await?;

        self.queues.write().insert(
            queue.to_string(),
            QueueDescriptor {
                name: queue.to_string(),
                provider: provider_name.to_string(),
                options,
            },
        );
        self.events.publish(&Event::QueueCreated {
            queue: queue.to_string(),
            provider: provider_name.to_string(),
        });
        Ok(())
    }

    async fn send_job_envelope(&self, job: &Job) -> ConveyorResult<()> {
        let queue = job_queue_name(&job.job_type);
        let provider = self.resolve_provider(&queue)?;

        let delay = job.scheduled_for.and_then(|at| {
            let millis = (at - Utc::now()).num_milliseconds();
            (millis > 0).then(|| Duration::from_millis(millis as u64))
        });

        let opts = SendOptions {
            priority: Some(job.priority.as_message_priority()),
            delay,
            ttl: None,
            max_retries: Some(self.config.retry_policy.max_retries),
        };
        let message = Message::with_options(
            job.to_envelope()?,
            &opts,
            self.config.retry_policy.max_retries,
        );

        provider.send_message(&queue, &message).await?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        counter!(names::MESSAGES_SENT_TOTAL).increment(1);
        Ok(())
    }

    /// Re-enqueues a job's envelope after the scheduler-computed retry delay.
    fn schedule_resend(self: &Arc<Self>, id: JobId, delay: Duration) {
        let manager = self.clone();
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.resend_timers.lock().remove(&timer_id);

            let Some(job) = manager.scheduler.get_job(&timer_id) else {
                return;
            };
            if !matches!(
                job.status,
                JobStatus::Pending | JobStatus::Retry
            ) {
                return;
            }
            if let Err(e) = manager.send_job_envelope(&job).await {
                error!(job_id = %timer_id, error = %e, "Retry re-enqueue failed");
            }
        });
        self.resend_timers.lock().insert(id, handle);
    }

    fn spawn_metrics_task(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.monitoring.metrics_interval());
            ticker.tick().await;

            let mut last_tick = Instant::now();
            let mut last_processed = 0u64;
            let mut last_failures = 0u64;

            while manager.is_running() {
                ticker.tick().await;

                let elapsed = last_tick.elapsed().as_secs_f64().max(f64::EPSILON);
                last_tick = Instant::now();

                let processed = manager.stats.jobs_processed.load(Ordering::Relaxed);
                let failures = manager.stats.attempt_failures.load(Ordering::Relaxed);
                let processing_rate = (processed - last_processed) as f64 / elapsed;
                let error_rate = (failures - last_failures) as f64 / elapsed;
                last_processed = processed;
                last_failures = failures;

                let avg = Duration::from_millis(
                    manager.stats.avg_processing_time_ms.lock().unwrap_or(0.0) as u64,
                );

                let descriptors = manager.queues();
                let mut snapshots = Vec::with_capacity(descriptors.len());
                for descriptor in descriptors {
                    let info = match manager.resolve_provider(&descriptor.name) {
                        Ok(provider) => provider
                            .queue_info(&descriptor.name)
                            .await
                            .unwrap_or_default(),
                        Err(_) => QueueInfo::default(),
                    };
                    gauge!(names::QUEUE_DEPTH, "queue" => descriptor.name.clone())
                        .set(info.message_count as f64);
                    snapshots.push(QueueMetrics {
                        queue: descriptor.name,
                        message_count: info.message_count,
                        consumer_count: info.consumer_count,
                        processing_rate,
                        error_rate,
                        avg_processing_time: avg,
                        timestamp: Utc::now(),
                    });
                }

                gauge!(names::JOBS_QUEUED)
                    .set(manager.stats.queued_jobs.load(Ordering::Relaxed) as f64);
                manager
                    .events
                    .publish(&Event::MetricsCollected { queues: snapshots });
            }
        })
    }

    fn spawn_health_task(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(manager.config.monitoring.health_check_interval());
            ticker.tick().await;

            while manager.is_running() {
                ticker.tick().await;
                for (name, provider) in &manager.providers {
                    let health = provider.health().await;
                    if health.status != HealthStatus::Healthy {
                        warn!(provider = %name, status = %health.status, details = ?health.details, "Provider unhealthy");
                    }
                    manager.events.publish(&Event::HealthCheckCompleted {
                        provider: name.clone(),
                        status: health.status,
                    });
                }
            }
        })
    }
}

/// Worker-facing lifecycle operations: mirror the scheduler transitions and
/// re-enqueue retries.
#[async_trait]
impl JobLifecycle for Arc<QueueManager> {
    async fn start_job(&self, id: &JobId) -> ConveyorResult<()> {
        self.scheduler.start_job(id).map(|_| ())
    }

    async fn complete_job(&self, id: &JobId, result: Option<Value>) -> ConveyorResult<()> {
        let job = self.scheduler.complete_job(id, result)?;

        self.stats.jobs_processed.fetch_add(1, Ordering::Relaxed);
        self.stats.queued_jobs.fetch_sub(1, Ordering::Relaxed);
        counter!(names::JOBS_PROCESSED_TOTAL).increment(1);

        if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
            let elapsed_ms = (completed - started).num_milliseconds().max(0) as f64;
            self.stats.record_processing_time(elapsed_ms);
            histogram!(names::JOB_DURATION_SECONDS).record(elapsed_ms / 1000.0);
        }
        Ok(())
    }

    async fn fail_job(&self, id: &JobId, error: &ConveyorError) -> ConveyorResult<()> {
        let decision = self.scheduler.fail_job(id, JobFailure::from_error(error))?;

        self.stats.attempt_failures.fetch_add(1, Ordering::Relaxed);
        counter!(names::JOB_ATTEMPT_FAILURES_TOTAL).increment(1);

        match decision {
            RetryDecision::Retrying { delay, attempt } => {
                debug!(job_id = %id, attempt, delay_ms = delay.as_millis() as u64, "Scheduling retry envelope");
                self.schedule_resend(id.clone(), delay);
            }
            RetryDecision::Exhausted => {
                self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
                self.stats.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                counter!(names::JOBS_FAILED_TOTAL).increment(1);
            }
        }
        Ok(())
    }

    async fn cancel_running_job(&self, id: &JobId) -> ConveyorResult<()> {
        self.scheduler.cancel_job(id)?;
        self.stats.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        self.stats.queued_jobs.fetch_sub(1, Ordering::Relaxed);
        counter!(names::JOBS_CANCELLED_TOTAL).increment(1);
        Ok(())
    }
}

/// Message operations the worker pool and pattern layer pull through.
#[async_trait]
impl MessageSource for Arc<QueueManager> {
    async fn receive(&self, queue: &str) -> ConveyorResult<Option<Message>> {
        self.receive_message(queue).await
    }

    async fn acknowledge(&self, queue: &str, message: &Message) -> ConveyorResult<()> {
        self.delete_message(queue, message).await
    }

    async fn reject(&self, queue: &str, message: &Message, requeue: bool) -> ConveyorResult<()> {
        self.ensure_running()?;
        let provider = self.resolve_provider(queue)?;
        provider.reject(queue, message, requeue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn manager() -> Arc<QueueManager> {
        let config = ConveyorConfig::in_memory().with_queue("default");
        let manager = QueueManager::new(config).unwrap();
        manager.start().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_send_before_start_rejected() {
        let config = ConveyorConfig::in_memory().with_queue("default");
        let manager = QueueManager::new(config).unwrap();
        let err = manager
            .send_message("default", json!(1), SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_RUNNING");
    }

    #[tokio::test]
    async fn test_send_receive_delete() {
        let manager = manager().await;
        let id = manager
            .send_message("default", json!({"x": 1}), SendOptions::default())
            .await
            .unwrap();

        let message = manager.receive_message("default").await.unwrap().unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.payload, json!({"x": 1}));

        manager.delete_message("default", &message).await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats.total_messages_sent, 1);
        assert_eq!(stats.total_messages_received, 1);
        assert_eq!(stats.total_messages_deleted, 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_queue_rejected() {
        let manager = manager().await;
        let err = manager
            .send_message("ghost", json!(1), SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "QUEUE_UNKNOWN");
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_job_creates_record_and_envelope() {
        let manager = manager().await;
        let id = manager
            .submit_job("email", json!({"to": "a@b.c"}), JobOptions::default())
            .await
            .unwrap();

        let job = manager.get_job_status(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        // The envelope landed on the auto-created jobs queue.
        let message = manager.receive_message("jobs-email").await.unwrap().unwrap();
        let envelope = Job::from_envelope(&message.payload).unwrap();
        assert_eq!(envelope.id, id);

        assert_eq!(manager.stats().total_jobs_submitted, 1);
        assert_eq!(manager.stats().queued_jobs, 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let manager = manager().await;
        let id = manager
            .submit_job("slow", json!({}), JobOptions::default())
            .await
            .unwrap();

        assert!(manager.cancel_job(&id));
        assert_eq!(
            manager.get_job_status(&id).unwrap().status,
            JobStatus::Cancelled
        );
        assert_eq!(manager.stats().queued_jobs, 0);

        // Second cancel fails: terminal.
        assert!(!manager.cancel_job(&id));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_running_job_refused() {
        let manager = manager().await;
        let id = manager
            .submit_job("busy", json!({}), JobOptions::default())
            .await
            .unwrap();
        manager.scheduler().start_job(&id).unwrap();

        assert!(!manager.cancel_job(&id));
        assert_eq!(
            manager.get_job_status(&id).unwrap().status,
            JobStatus::Running
        );
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_missing_job() {
        let manager = manager().await;
        assert!(!manager.cancel_job(&JobId::new()));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_management() {
        let manager = manager().await;
        manager
            .create_queue("orders", None, QueueOptions::default())
            .await
            .unwrap();
        assert!(manager.queues().iter().any(|q| q.name == "orders"));

        let info = manager.queue_info("orders").await.unwrap();
        assert_eq!(info.message_count, 0);

        manager.delete_queue("orders").await.unwrap();
        assert!(!manager.queues().iter().any(|q| q.name == "orders"));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_providers_listing() {
        let manager = manager().await;
        let providers = manager.providers();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name, "memory");
        assert_eq!(providers[0].kind, ProviderKind::Memory);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_reconciles_running_jobs() {
        let manager = manager().await;
        let id = manager
            .submit_job("stuck", json!({}), JobOptions::default())
            .await
            .unwrap();
        manager.scheduler().start_job(&id).unwrap();

        manager.stop().await.unwrap();

        // The shutdown-cancelled job must not leave the counters skewed.
        let stats = manager.stats();
        assert_eq!(
            manager.get_job_status(&id).unwrap().status,
            JobStatus::Cancelled
        );
        assert_eq!(stats.queued_jobs, 0);
        assert_eq!(stats.total_jobs_cancelled, 1);
        assert_eq!(stats.total_jobs_cancelled, stats.scheduler.jobs_cancelled);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = manager().await;
        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert!(!manager.is_running());

        let err = manager
            .send_message("default", json!(1), SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_RUNNING");
    }

    #[tokio::test]
    async fn test_ewma_processing_time() {
        let stats = ManagerStats::default();
        stats.record_processing_time(100.0);
        assert_eq!(stats.avg_processing_time_ms.lock().unwrap(), 100.0);

        stats.record_processing_time(200.0);
        let avg = stats.avg_processing_time_ms.lock().unwrap();
        assert!(avg > 100.0 && avg < 200.0);
    }
}
