//! Job processor: handler dispatch with timeout, cancellation, and circuit
//! breaking.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use async_trait::async_trait;
use conveyor_core::{ConveyorError, ConveyorResult, Event, EventBus, Job, JobId};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Handler future type.
pub type HandlerFuture = BoxFuture<'static, ConveyorResult<Value>>;

/// Registered job handler: user code executed per job.
pub type JobHandler = Arc<dyn Fn(Job, HandlerContext) -> HandlerFuture + Send + Sync>;

/// Execution context handed to a handler. Cancellation is cooperative: poll
/// `is_cancelled` at every natural yield point.
#[derive(Clone)]
pub struct HandlerContext {
    /// Job being executed.
    pub job_id: JobId,

    /// Attempt number, 1-based.
    pub attempt: u32,

    cancelled: Arc<AtomicBool>,
}

impl HandlerContext {
    /// True once the job has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Job lifecycle operations the processor drives. Implemented by the queue
/// manager, which mirrors the transitions into the scheduler and re-enqueues
/// retries.
#[async_trait]
pub trait JobLifecycle: Send + Sync {
    /// Pending or Retry -> Running.
    async fn start_job(&self, id: &JobId) -> ConveyorResult<()>;

    /// Running -> Completed with an optional result.
    async fn complete_job(&self, id: &JobId, result: Option<Value>) -> ConveyorResult<()>;

    /// Running -> Retry or Failed.
    async fn fail_job(&self, id: &JobId, error: &ConveyorError) -> ConveyorResult<()>;

    /// Running -> Cancelled (processor-driven cancellation).
    async fn cancel_running_job(&self, id: &JobId) -> ConveyorResult<()>;
}

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Admission limit on concurrently executing jobs.
    pub max_concurrent_jobs: usize,

    /// Timeout applied when a job carries none of its own.
    pub default_timeout: Duration,

    /// Circuit breaker settings, shared by all job types.
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            default_timeout: Duration::from_secs(300),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// How a processed job ended.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Handler returned a value; the job is Completed.
    Completed(Value),
    /// Handler failed or timed out; retry policy has been applied.
    Failed(ConveyorError),
    /// Cancellation won the race.
    Cancelled,
}

struct ActiveExecution {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

/// Executes jobs through registered handlers.
pub struct JobProcessor {
    config: ProcessorConfig,
    handlers: RwLock<HashMap<String, JobHandler>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    active: Mutex<HashMap<JobId, ActiveExecution>>,
    lifecycle: Arc<dyn JobLifecycle>,
    events: Arc<EventBus>,
}

impl JobProcessor {
    /// Creates a processor bound to a lifecycle implementation.
    pub fn new(
        config: ProcessorConfig,
        lifecycle: Arc<dyn JobLifecycle>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            handlers: RwLock::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            lifecycle,
            events,
        }
    }

    /// Registers a handler for a job type, replacing any existing one.
    pub fn register_handler(
        &self,
        job_type: impl Into<String>,
        handler: impl Fn(Job, HandlerContext) -> HandlerFuture + Send + Sync + 'static,
    ) {
        let job_type = job_type.into();
        self.handlers
            .write()
            .insert(job_type.clone(), Arc::new(handler));
        info!(job_type = %job_type, "Registered job handler");
    }

    /// Removes a handler. Returns false if none was registered.
    pub fn unregister_handler(&self, job_type: &str) -> bool {
        self.handlers.write().remove(job_type).is_some()
    }

    /// True if a handler exists for the job type.
    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.read().contains_key(job_type)
    }

    /// Number of jobs currently executing.
    pub fn active_jobs(&self) -> usize {
        self.active.lock().len()
    }

    /// Current breaker state for a job type, if one is tracked.
    pub fn breaker_state(&self, job_type: &str) -> Option<CircuitState> {
        self.breakers.lock().get(job_type).map(|b| b.state())
    }

    /// Flags a running job as cancelled. The handler observes the flag at its
    /// next cooperative point; the execution slot is released through the
    /// normal completion path. Returns false if the job is not executing here.
    pub fn cancel_job(&self, id: &JobId) -> bool {
        let active = self.active.lock();
        match active.get(id) {
            Some(execution) => {
                execution.cancelled.store(true, Ordering::SeqCst);
                execution.notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Runs a job through its handler, racing execution against the effective
    /// timeout and cancellation.
    pub async fn process(&self, job: Job) -> ConveyorResult<ProcessOutcome> {
        let job_type = job.job_type.clone();
        let job_id = job.id.clone();

        let breaker = self.breaker_for(&job_type);
        if let Some(breaker) = &breaker {
            if !breaker.allow_request() {
                debug!(job_id = %job_id, job_type = %job_type, "Rejected by open circuit");
                return Err(ConveyorError::CircuitOpen(job_type));
            }
        }

        let handler = {
            let handlers = self.handlers.read();
            handlers
                .get(&job_type)
                .cloned()
                .ok_or_else(|| ConveyorError::HandlerMissing(job_type.clone()))?
        };

        let (cancelled, notify) = {
            let mut active = self.active.lock();
            if active.len() >= self.config.max_concurrent_jobs {
                return Err(ConveyorError::Overloaded {
                    active: active.len(),
                    limit: self.config.max_concurrent_jobs,
                });
            }
            let cancelled = Arc::new(AtomicBool::new(false));
            let notify = Arc::new(Notify::new());
            active.insert(
                job_id.clone(),
                ActiveExecution {
                    cancelled: cancelled.clone(),
                    notify: notify.clone(),
                },
            );
            (cancelled, notify)
        };

        if let Err(e) = self.lifecycle.start_job(&job_id).await {
            self.active.lock().remove(&job_id);
            return Err(e);
        }

        let timeout = job.timeout.unwrap_or(self.config.default_timeout);
        let context = HandlerContext {
            job_id: job_id.clone(),
            attempt: job.retry_count + 1,
            cancelled,
        };

        let started = Instant::now();
        let execution = AssertUnwindSafe(handler(job, context)).catch_unwind();

        let outcome = tokio::select! {
            result = execution => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ConveyorError::ExecutionFailed(
                    "handler panicked".to_string(),
                )),
            },
            () = tokio::time::sleep(timeout) => Err(ConveyorError::Timeout {
                elapsed_ms: timeout.as_millis() as u64,
            }),
            () = notify.notified() => Err(ConveyorError::Cancelled),
        };

        self.active.lock().remove(&job_id);

        match outcome {
            Ok(value) => {
                if let Some(breaker) = &breaker {
                    breaker.record_success();
                }
                self.lifecycle
                    .complete_job(&job_id, Some(value.clone()))
                    .await?;
                self.events.publish(&Event::JobProcessingCompleted {
                    job_id: job_id.to_string(),
                    duration: started.elapsed(),
                });
                Ok(ProcessOutcome::Completed(value))
            }
            Err(ConveyorError::Cancelled) => {
                if let Err(e) = self.lifecycle.cancel_running_job(&job_id).await {
                    debug!(job_id = %job_id, error = %e, "Cancel propagation failed");
                }
                Ok(ProcessOutcome::Cancelled)
            }
            Err(error) => {
                if let Some(breaker) = &breaker {
                    breaker.record_failure();
                }
                warn!(job_id = %job_id, job_type = %job_type, error = %error, "Job attempt failed");
                self.lifecycle.fail_job(&job_id, &error).await?;
                self.events.publish(&Event::JobProcessingFailed {
                    job_id: job_id.to_string(),
                    message: error.to_string(),
                });
                Ok(ProcessOutcome::Failed(error))
            }
        }
    }

    fn breaker_for(&self, job_type: &str) -> Option<Arc<CircuitBreaker>> {
        if !self.config.circuit_breaker.enabled {
            return None;
        }
        let mut breakers = self.breakers.lock();
        Some(
            breakers
                .entry(job_type.to_string())
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(
                        job_type,
                        self.config.circuit_breaker.clone(),
                    ))
                })
                .clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_config::RetryPolicyConfig;
    use conveyor_core::{JobFailure, JobOptions, JobStatus};
    use conveyor_scheduler::JobScheduler;
    use serde_json::json;

    /// Lifecycle stub that drives a real scheduler.
    struct SchedulerLifecycle {
        scheduler: JobScheduler,
    }

    #[async_trait]
    impl JobLifecycle for SchedulerLifecycle {
        async fn start_job(&self, id: &JobId) -> ConveyorResult<()> {
            self.scheduler.start_job(id).map(|_| ())
        }

        async fn complete_job(&self, id: &JobId, result: Option<Value>) -> ConveyorResult<()> {
            self.scheduler.complete_job(id, result).map(|_| ())
        }

        async fn fail_job(&self, id: &JobId, error: &ConveyorError) -> ConveyorResult<()> {
            self.scheduler
                .fail_job(id, JobFailure::from_error(error))
                .map(|_| ())
        }

        async fn cancel_running_job(&self, id: &JobId) -> ConveyorResult<()> {
            self.scheduler.cancel_job(id).map(|_| ())
        }
    }

    struct Fixture {
        processor: Arc<JobProcessor>,
        scheduler: Arc<SchedulerLifecycle>,
    }

    fn fixture(config: ProcessorConfig) -> Fixture {
        let events = Arc::new(EventBus::new());
        let scheduler = Arc::new(SchedulerLifecycle {
            scheduler: JobScheduler::new(RetryPolicyConfig::default(), events.clone()),
        });
        let processor = Arc::new(JobProcessor::new(config, scheduler.clone(), events));
        Fixture { processor, scheduler }
    }

    fn job(job_type: &str, opts: JobOptions) -> Job {
        Job::new(job_type, json!({}), opts, 0, Duration::from_millis(10))
    }

    fn submit(fixture: &Fixture, job: Job) -> Job {
        fixture.scheduler.scheduler.create_job(job).unwrap()
    }

    #[tokio::test]
    async fn test_process_success() {
        let f = fixture(ProcessorConfig::default());
        f.processor.register_handler("add", |job, _ctx| {
            Box::pin(async move {
                let a = job.data.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = job.data.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(a + b))
            })
        });

        let mut created = job("add", JobOptions::default());
        created.data = json!({"a": 2, "b": 3});
        let created = submit(&f, created);

        let outcome = f.processor.process(created.clone()).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed(v) if v == json!(5)));

        let stored = f.scheduler.scheduler.get_job(&created.id).unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let f = fixture(ProcessorConfig::default());
        let created = submit(&f, job("ghost", JobOptions::default()));
        let err = f.processor.process(created).await.unwrap_err();
        assert_eq!(err.error_code(), "HANDLER_MISSING");
    }

    #[tokio::test]
    async fn test_failure_routes_to_retry_policy() {
        let f = fixture(ProcessorConfig::default());
        f.processor.register_handler("flaky", |_job, _ctx| {
            Box::pin(async { Err(ConveyorError::ExecutionFailed("boom".to_string())) })
        });

        let created = submit(
            &f,
            job("flaky", JobOptions { max_retries: Some(2), ..Default::default() }),
        );
        let outcome = f.processor.process(created.clone()).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed(_)));

        let stored = f.scheduler.scheduler.get_job(&created.id).unwrap();
        assert_eq!(stored.status, JobStatus::Retry);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.unwrap().message, "Job execution failed: boom");
    }

    #[tokio::test]
    async fn test_timeout() {
        let f = fixture(ProcessorConfig::default());
        f.processor.register_handler("slow", |_job, _ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!(null))
            })
        });

        let created = submit(
            &f,
            job(
                "slow",
                JobOptions {
                    timeout: Some(Duration::from_millis(50)),
                    max_retries: Some(0),
                    ..Default::default()
                },
            ),
        );

        let outcome = f.processor.process(created.clone()).await.unwrap();
        match outcome {
            ProcessOutcome::Failed(e) => assert_eq!(e.error_code(), "TIMEOUT"),
            other => panic!("expected timeout failure, got {other:?}"),
        }

        let stored = f.scheduler.scheduler.get_job(&created.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn test_cancellation_mid_flight() {
        let f = fixture(ProcessorConfig::default());
        f.processor.register_handler("forever", |_job, ctx| {
            Box::pin(async move {
                loop {
                    if ctx.is_cancelled() {
                        return Err(ConveyorError::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        });

        let created = submit(&f, job("forever", JobOptions::default()));
        let processor = f.processor.clone();
        let id = created.id.clone();
        let task = tokio::spawn(async move { processor.process(created).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(f.processor.cancel_job(&id));

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Cancelled));
        assert_eq!(
            f.scheduler.scheduler.get_job(&id).unwrap().status,
            JobStatus::Cancelled
        );
        assert_eq!(f.processor.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_overload_admission() {
        let f = fixture(ProcessorConfig {
            max_concurrent_jobs: 1,
            ..Default::default()
        });
        f.processor.register_handler("sleepy", |_job, _ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!(null))
            })
        });

        let first = submit(&f, job("sleepy", JobOptions::default()));
        let second = submit(&f, job("sleepy", JobOptions::default()));

        let processor = f.processor.clone();
        let task = tokio::spawn(async move { processor.process(first).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = f.processor.process(second).await.unwrap_err();
        assert_eq!(err.error_code(), "OVERLOADED");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_circuit_opens_then_probes() {
        let f = fixture(ProcessorConfig {
            circuit_breaker: CircuitBreakerConfig {
                enabled: true,
                failure_threshold: 3,
                reset_timeout: Duration::from_millis(100),
            },
            ..Default::default()
        });
        f.processor.register_handler("broken", |_job, _ctx| {
            Box::pin(async { Err(ConveyorError::ExecutionFailed("always".to_string())) })
        });

        for _ in 0..3 {
            let created = submit(
                &f,
                job("broken", JobOptions { max_retries: Some(0), ..Default::default() }),
            );
            let outcome = f.processor.process(created).await.unwrap();
            assert!(matches!(outcome, ProcessOutcome::Failed(_)));
        }
        assert_eq!(f.processor.breaker_state("broken"), Some(CircuitState::Open));

        // Fourth call is rejected without touching the handler.
        let rejected = submit(
            &f,
            job("broken", JobOptions { max_retries: Some(0), ..Default::default() }),
        );
        let err = f.processor.process(rejected.clone()).await.unwrap_err();
        assert_eq!(err.error_code(), "CIRCUIT_OPEN");
        assert_eq!(
            f.scheduler.scheduler.get_job(&rejected.id).unwrap().status,
            JobStatus::Pending
        );

        // After the reset timeout the probe reaches the handler again.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let probe = submit(
            &f,
            job("broken", JobOptions { max_retries: Some(0), ..Default::default() }),
        );
        let outcome = f.processor.process(probe).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed(_)));
        assert_eq!(f.processor.breaker_state("broken"), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_breaker_disabled_tracks_nothing() {
        let f = fixture(ProcessorConfig {
            circuit_breaker: CircuitBreakerConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        });
        f.processor.register_handler("broken", |_job, _ctx| {
            Box::pin(async { Err(ConveyorError::ExecutionFailed("always".to_string())) })
        });

        for _ in 0..10 {
            let created = submit(
                &f,
                job("broken", JobOptions { max_retries: Some(0), ..Default::default() }),
            );
            let outcome = f.processor.process(created).await.unwrap();
            assert!(matches!(outcome, ProcessOutcome::Failed(_)));
        }
        assert!(f.processor.breaker_state("broken").is_none());
    }

    #[tokio::test]
    async fn test_handler_panic_is_a_failure() {
        let f = fixture(ProcessorConfig::default());
        f.processor.register_handler("panicky", |_job, _ctx| {
            Box::pin(async { panic!("kaboom") })
        });

        let created = submit(
            &f,
            job("panicky", JobOptions { max_retries: Some(0), ..Default::default() }),
        );
        let outcome = f.processor.process(created.clone()).await.unwrap();
        match outcome {
            ProcessOutcome::Failed(e) => assert_eq!(e.error_code(), "EXECUTION_FAILED"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(f.processor.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_unregister_handler() {
        let f = fixture(ProcessorConfig::default());
        f.processor.register_handler("temp", |_job, _ctx| Box::pin(async { Ok(json!(null)) }));
        assert!(f.processor.has_handler("temp"));
        assert!(f.processor.unregister_handler("temp"));
        assert!(!f.processor.has_handler("temp"));
        assert!(!f.processor.unregister_handler("temp"));
    }
}
