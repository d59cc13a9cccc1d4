//! Job scheduler: the authoritative store of job state and retry timers.

use chrono::{DateTime, Utc};
use conveyor_config::RetryPolicyConfig;
use conveyor_core::{
    ConveyorError, ConveyorResult, Event, EventBus, Job, JobFailure, JobId, JobStatus,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of a `fail_job` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The job moved to Retry and re-enters Pending after `delay`.
    Retrying { delay: Duration, attempt: u32 },
    /// Retries are exhausted; the job is Failed.
    Exhausted,
}

/// Filter for `list_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Only jobs in this status.
    pub status: Option<JobStatus>,

    /// Only jobs of this type.
    pub job_type: Option<String>,

    /// Only jobs carrying this tag.
    pub tag: Option<String>,

    /// Cap on the number of returned jobs.
    pub limit: Option<usize>,
}

/// Scheduler statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    /// Jobs currently in the table.
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub retrying: usize,

    /// Lifetime counters.
    pub jobs_created: u64,
    pub jobs_completed: u64,
    /// Terminal failures only.
    pub jobs_failed: u64,
    /// Every failed attempt, including ones that led to a retry.
    pub attempt_failures: u64,
    pub jobs_cancelled: u64,
    pub jobs_retried: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    attempt_failures: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
}

struct SchedulerInner {
    /// Job table. The lock is held only for O(1) map and field mutation,
    /// never across I/O.
    jobs: Mutex<HashMap<JobId, Job>>,

    /// Pending retry timers keyed by job id so cancel can revoke them.
    timers: Mutex<HashMap<JobId, JoinHandle<()>>>,

    /// Jobs currently Running.
    active: Mutex<HashSet<JobId>>,

    policy: RetryPolicyConfig,
    events: Arc<EventBus>,
    shutdown: AtomicBool,
    counters: Counters,
}

/// In-memory job scheduler. State is process-local; durability is the
/// backend's concern.
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    /// Creates a scheduler with the given retry policy defaults.
    pub fn new(policy: RetryPolicyConfig, events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                jobs: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                active: Mutex::new(HashSet::new()),
                policy,
                events,
                shutdown: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Registers a new job. The job enters the table as Pending.
    pub fn create_job(&self, mut job: Job) -> ConveyorResult<Job> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(ConveyorError::NotRunning);
        }
        job.validate()?;
        job.status = JobStatus::Pending;

        let snapshot = job.clone();
        self.inner.jobs.lock().insert(job.id.clone(), job);
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);

        self.inner.events.publish(&Event::JobCreated {
            job_id: snapshot.id.to_string(),
            job_type: snapshot.job_type.clone(),
        });
        debug!(job_id = %snapshot.id, job_type = %snapshot.job_type, "Job created");
        Ok(snapshot)
    }

    /// Returns a snapshot of a job.
    pub fn get_job(&self, id: &JobId) -> Option<Job> {
        self.inner.jobs.lock().get(id).cloned()
    }

    /// Lists jobs matching the filter.
    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.inner.jobs.lock();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|job| filter.status.map_or(true, |s| job.status == s))
            .filter(|job| {
                filter
                    .job_type
                    .as_deref()
                    .map_or(true, |t| job.job_type == t)
            })
            .filter(|job| {
                filter
                    .tag
                    .as_deref()
                    .map_or(true, |tag| job.tags.iter().any(|t| t == tag))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    /// Snapshot of all Running jobs.
    pub fn running_jobs(&self) -> Vec<Job> {
        let active = self.inner.active.lock().clone();
        let jobs = self.inner.jobs.lock();
        active.iter().filter_map(|id| jobs.get(id).cloned()).collect()
    }

    /// Pending or Retry -> Running.
    pub fn start_job(&self, id: &JobId) -> ConveyorResult<Job> {
        let snapshot = {
            let mut jobs = self.inner.jobs.lock();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| ConveyorError::JobNotFound(id.to_string()))?;

            if !matches!(job.status, JobStatus::Pending | JobStatus::Retry) {
                return Err(ConveyorError::IllegalTransition {
                    job_id: id.to_string(),
                    from: job.status,
                    operation: "start",
                });
            }

            let now = Utc::now();
            job.status = JobStatus::Running;
            job.updated_at = now;
            if job.started_at.is_none() {
                job.started_at = Some(now);
            }
            self.inner.active.lock().insert(id.clone());
            job.clone()
        };

        // A retry timer racing this start is now stale; revoke it.
        if let Some(handle) = self.inner.timers.lock().remove(id) {
            handle.abort();
        }

        self.inner.events.publish(&Event::JobStarted {
            job_id: id.to_string(),
        });
        Ok(snapshot)
    }

    /// Running -> Completed.
    pub fn complete_job(&self, id: &JobId, result: Option<Value>) -> ConveyorResult<Job> {
        let snapshot = {
            let mut jobs = self.inner.jobs.lock();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| ConveyorError::JobNotFound(id.to_string()))?;

            if job.status != JobStatus::Running {
                return Err(ConveyorError::IllegalTransition {
                    job_id: id.to_string(),
                    from: job.status,
                    operation: "complete",
                });
            }

            let now = Utc::now();
            job.status = JobStatus::Completed;
            job.result = result;
            job.completed_at = Some(now);
            job.updated_at = now;
            self.inner.active.lock().remove(id);
            job.clone()
        };

        self.inner.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.inner.events.publish(&Event::JobCompleted {
            job_id: id.to_string(),
        });
        debug!(job_id = %id, "Job completed");
        Ok(snapshot)
    }

    /// Running -> Retry (with a deferred re-entry to Pending) or Failed.
    pub fn fail_job(&self, id: &JobId, failure: JobFailure) -> ConveyorResult<RetryDecision> {
        let (decision, message) = {
            let mut jobs = self.inner.jobs.lock();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| ConveyorError::JobNotFound(id.to_string()))?;

            if job.status != JobStatus::Running {
                return Err(ConveyorError::IllegalTransition {
                    job_id: id.to_string(),
                    from: job.status,
                    operation: "fail",
                });
            }

            let now = Utc::now();
            let message = failure.message.clone();
            job.last_error = Some(failure);
            job.failed_at = Some(now);
            job.updated_at = now;
            self.inner.active.lock().remove(id);

            let decision = if job.retry_count < job.max_retries {
                job.retry_count += 1;
                job.status = JobStatus::Retry;
                let attempt = job.retry_count;
                let delay = self.retry_delay_for(attempt, job.retry_delay);
                RetryDecision::Retrying { delay, attempt }
            } else {
                job.status = JobStatus::Failed;
                RetryDecision::Exhausted
            };
            (decision, message)
        };

        self.inner
            .counters
            .attempt_failures
            .fetch_add(1, Ordering::Relaxed);
        match &decision {
            RetryDecision::Retrying { delay, attempt } => {
                self.inner.counters.retried.fetch_add(1, Ordering::Relaxed);
                self.inner.events.publish(&Event::JobRetryScheduled {
                    job_id: id.to_string(),
                    attempt: *attempt,
                    delay: *delay,
                });
                self.schedule_retry(id.clone(), *delay);
                debug!(job_id = %id, attempt, delay_ms = delay.as_millis() as u64, "Retry scheduled");
            }
            RetryDecision::Exhausted => {
                self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.inner.events.publish(&Event::JobFailed {
                    job_id: id.to_string(),
                    message,
                });
                warn!(job_id = %id, "Job failed permanently");
            }
        }
        Ok(decision)
    }

    /// Cancels a job. Illegal from terminal states; revokes a pending retry
    /// timer.
    pub fn cancel_job(&self, id: &JobId) -> ConveyorResult<Job> {
        let snapshot = {
            let mut jobs = self.inner.jobs.lock();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| ConveyorError::JobNotFound(id.to_string()))?;

            if job.status.is_terminal() {
                return Err(ConveyorError::IllegalTransition {
                    job_id: id.to_string(),
                    from: job.status,
                    operation: "cancel",
                });
            }

            let now = Utc::now();
            if job.status == JobStatus::Running {
                self.inner.active.lock().remove(id);
            }
            job.status = JobStatus::Cancelled;
            job.cancelled_at = Some(now);
            job.updated_at = now;
            job.clone()
        };

        if let Some(handle) = self.inner.timers.lock().remove(id) {
            handle.abort();
        }

        self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        self.inner.events.publish(&Event::JobCancelled {
            job_id: id.to_string(),
        });
        Ok(snapshot)
    }

    /// Removes a job record entirely (rollback of a failed submit).
    pub fn remove_job(&self, id: &JobId) -> Option<Job> {
        if let Some(handle) = self.inner.timers.lock().remove(id) {
            handle.abort();
        }
        self.inner.active.lock().remove(id);
        self.inner.jobs.lock().remove(id)
    }

    /// Removes Completed and Failed jobs last updated before `older_than`.
    /// Returns the number removed.
    pub fn cleanup(&self, older_than: DateTime<Utc>) -> usize {
        let mut jobs = self.inner.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(matches!(job.status, JobStatus::Completed | JobStatus::Failed)
                && job.updated_at < older_than)
        });
        let removed = before - jobs.len();
        if removed > 0 {
            info!(removed, "Cleaned up terminal jobs");
        }
        removed
    }

    /// Statistics snapshot. Counts across fields may be momentarily
    /// inconsistent with each other; each field is itself accurate.
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            jobs_created: self.inner.counters.created.load(Ordering::Relaxed),
            jobs_completed: self.inner.counters.completed.load(Ordering::Relaxed),
            jobs_failed: self.inner.counters.failed.load(Ordering::Relaxed),
            attempt_failures: self.inner.counters.attempt_failures.load(Ordering::Relaxed),
            jobs_cancelled: self.inner.counters.cancelled.load(Ordering::Relaxed),
            jobs_retried: self.inner.counters.retried.load(Ordering::Relaxed),
            ..SchedulerStats::default()
        };

        let jobs = self.inner.jobs.lock();
        stats.total = jobs.len();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Retry => stats.retrying += 1,
            }
        }
        stats
    }

    /// Cancels every timer, best-effort cancels Running jobs, and emits the
    /// shutdown event. Returns the ids of the jobs this call cancelled so
    /// callers can reconcile their own counters. Idempotent.
    pub fn shutdown(&self) -> Vec<JobId> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }

        for (_, handle) in self.inner.timers.lock().drain() {
            handle.abort();
        }

        let running: Vec<JobId> = self.inner.active.lock().iter().cloned().collect();
        let mut cancelled = Vec::with_capacity(running.len());
        for id in running {
            match self.cancel_job(&id) {
                Ok(_) => cancelled.push(id),
                Err(e) => debug!(job_id = %id, error = %e, "Cancel during shutdown failed"),
            }
        }

        self.inner.events.publish(&Event::SchedulerShutdown);
        info!("Scheduler shut down");
        cancelled
    }

    /// True once `shutdown` has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Computes the delay before retry attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max_retry_delay)` with exponential backoff
    /// enabled, otherwise `base`.
    pub fn retry_delay_for(&self, attempt: u32, base: Duration) -> Duration {
        if !self.inner.policy.exponential_backoff {
            return base;
        }
        let base_ms = base.as_millis() as u64;
        let shift = (attempt.saturating_sub(1)).min(63);
        let delay_ms = base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms.min(self.inner.policy.max_retry_delay_ms))
    }

    fn schedule_retry(&self, id: JobId, delay: Duration) {
        let inner = self.inner.clone();
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let reentered = {
                let mut jobs = inner.jobs.lock();
                match jobs.get_mut(&timer_id) {
                    Some(job) if job.status == JobStatus::Retry => {
                        job.status = JobStatus::Pending;
                        job.updated_at = Utc::now();
                        true
                    }
                    _ => false,
                }
            };
            inner.timers.lock().remove(&timer_id);

            if reentered {
                inner.events.publish(&Event::JobRetryStarted {
                    job_id: timer_id.to_string(),
                });
            }
        });
        self.inner.timers.lock().insert(id, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::JobOptions;
    use serde_json::json;

    fn scheduler() -> JobScheduler {
        JobScheduler::new(RetryPolicyConfig::default(), Arc::new(EventBus::new()))
    }

    fn scheduler_with(policy: RetryPolicyConfig) -> JobScheduler {
        JobScheduler::new(policy, Arc::new(EventBus::new()))
    }

    fn job(max_retries: u32, retry_delay_ms: u64) -> Job {
        Job::new(
            "test",
            json!({}),
            JobOptions {
                max_retries: Some(max_retries),
                retry_delay: Some(Duration::from_millis(retry_delay_ms)),
                ..Default::default()
            },
            3,
            Duration::from_millis(1000),
        )
    }

    #[tokio::test]
    async fn test_lifecycle_success() {
        let scheduler = scheduler();
        let created = scheduler.create_job(job(3, 10)).unwrap();
        assert_eq!(created.status, JobStatus::Pending);

        let started = scheduler.start_job(&created.id).unwrap();
        assert_eq!(started.status, JobStatus::Running);
        assert!(started.started_at.is_some());
        assert_eq!(scheduler.running_jobs().len(), 1);

        let completed = scheduler
            .complete_job(&created.id, Some(json!(5)))
            .unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.result, Some(json!(5)));
        assert!(scheduler.running_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_start_requires_pending_or_retry() {
        let scheduler = scheduler();
        let created = scheduler.create_job(job(3, 10)).unwrap();
        scheduler.start_job(&created.id).unwrap();

        let err = scheduler.start_job(&created.id).unwrap_err();
        assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");
    }

    #[tokio::test]
    async fn test_complete_requires_running() {
        let scheduler = scheduler();
        let created = scheduler.create_job(job(3, 10)).unwrap();
        let err = scheduler.complete_job(&created.id, None).unwrap_err();
        assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");
    }

    #[tokio::test]
    async fn test_fail_schedules_retry_then_reenters_pending() {
        let scheduler = scheduler_with(RetryPolicyConfig {
            exponential_backoff: false,
            ..Default::default()
        });
        let created = scheduler.create_job(job(2, 10)).unwrap();
        scheduler.start_job(&created.id).unwrap();

        let decision = scheduler
            .fail_job(&created.id, JobFailure::from_error(&"boom"))
            .unwrap();
        assert_eq!(
            decision,
            RetryDecision::Retrying { delay: Duration::from_millis(10), attempt: 1 }
        );
        assert_eq!(scheduler.get_job(&created.id).unwrap().status, JobStatus::Retry);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let job = scheduler.get_job(&created.id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.unwrap().message, "boom");
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let scheduler = scheduler_with(RetryPolicyConfig {
            exponential_backoff: false,
            ..Default::default()
        });
        let created = scheduler.create_job(job(2, 5)).unwrap();

        for attempt in 0..3 {
            // Let a scheduled retry land back in Pending first.
            loop {
                let status = scheduler.get_job(&created.id).unwrap().status;
                if matches!(status, JobStatus::Pending) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            scheduler.start_job(&created.id).unwrap();
            let decision = scheduler
                .fail_job(&created.id, JobFailure::from_error(&"boom"))
                .unwrap();
            if attempt < 2 {
                assert!(matches!(decision, RetryDecision::Retrying { .. }));
            } else {
                assert_eq!(decision, RetryDecision::Exhausted);
            }
        }

        let job = scheduler.get_job(&created.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);

        let stats = scheduler.stats();
        assert_eq!(stats.attempt_failures, 3);
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.jobs_retried, 2);
    }

    #[tokio::test]
    async fn test_terminal_states_are_absorbing() {
        let scheduler = scheduler();
        let created = scheduler.create_job(job(0, 10)).unwrap();
        scheduler.start_job(&created.id).unwrap();
        scheduler.complete_job(&created.id, None).unwrap();

        assert!(scheduler.start_job(&created.id).is_err());
        assert!(scheduler.cancel_job(&created.id).is_err());
        assert!(scheduler
            .fail_job(&created.id, JobFailure::from_error(&"late"))
            .is_err());
        assert_eq!(
            scheduler.get_job(&created.id).unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_revokes_retry_timer() {
        let scheduler = scheduler_with(RetryPolicyConfig {
            exponential_backoff: false,
            ..Default::default()
        });
        let created = scheduler.create_job(job(3, 20)).unwrap();
        scheduler.start_job(&created.id).unwrap();
        scheduler
            .fail_job(&created.id, JobFailure::from_error(&"boom"))
            .unwrap();

        let cancelled = scheduler.cancel_job(&created.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        // The timer must not resurrect the job.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            scheduler.get_job(&created.id).unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_retry_delay_exponential_and_capped() {
        let scheduler = scheduler_with(RetryPolicyConfig {
            max_retries: 10,
            retry_delay_ms: 100,
            exponential_backoff: true,
            max_retry_delay_ms: 1000,
        });
        let base = Duration::from_millis(100);

        let mut last = Duration::ZERO;
        for attempt in 1..=10 {
            let delay = scheduler.retry_delay_for(attempt, base);
            assert!(delay >= last, "delays must be non-decreasing");
            assert!(delay <= Duration::from_millis(1000));
            last = delay;
        }

        assert_eq!(scheduler.retry_delay_for(1, base), Duration::from_millis(100));
        assert_eq!(scheduler.retry_delay_for(2, base), Duration::from_millis(200));
        assert_eq!(scheduler.retry_delay_for(3, base), Duration::from_millis(400));
        assert_eq!(scheduler.retry_delay_for(10, base), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_fixed_delay_without_backoff() {
        let scheduler = scheduler_with(RetryPolicyConfig {
            exponential_backoff: false,
            ..Default::default()
        });
        let base = Duration::from_millis(250);
        assert_eq!(scheduler.retry_delay_for(1, base), base);
        assert_eq!(scheduler.retry_delay_for(5, base), base);
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_terminal_jobs() {
        let scheduler = scheduler();
        let done = scheduler.create_job(job(0, 10)).unwrap();
        scheduler.start_job(&done.id).unwrap();
        scheduler.complete_job(&done.id, None).unwrap();

        let keep = scheduler.create_job(job(0, 10)).unwrap();

        let removed = scheduler.cleanup(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 1);
        assert!(scheduler.get_job(&done.id).is_none());
        assert!(scheduler.get_job(&keep.id).is_some());
    }

    #[tokio::test]
    async fn test_list_jobs_filters() {
        let scheduler = scheduler();
        let mut tagged = job(0, 10);
        tagged.tags = vec!["nightly".to_string()];
        let tagged = scheduler.create_job(tagged).unwrap();
        scheduler.create_job(job(0, 10)).unwrap();

        let by_tag = scheduler.list_jobs(&JobFilter {
            tag: Some("nightly".to_string()),
            ..Default::default()
        });
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].id, tagged.id);

        let pending = scheduler.list_jobs(&JobFilter {
            status: Some(JobStatus::Pending),
            ..Default::default()
        });
        assert_eq!(pending.len(), 2);

        let limited = scheduler.list_jobs(&JobFilter {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_and_rejects_new_jobs() {
        let scheduler = scheduler();
        let created = scheduler.create_job(job(3, 10)).unwrap();
        scheduler.start_job(&created.id).unwrap();

        let cancelled = scheduler.shutdown();
        assert_eq!(cancelled, vec![created.id.clone()]);
        assert!(scheduler.is_shut_down());
        assert_eq!(
            scheduler.get_job(&created.id).unwrap().status,
            JobStatus::Cancelled
        );

        let err = scheduler.create_job(job(0, 10)).unwrap_err();
        assert_eq!(err.error_code(), "NOT_RUNNING");

        // Idempotent.
        assert!(scheduler.shutdown().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let scheduler = scheduler();
        let ghost = JobId::new();
        assert!(matches!(
            scheduler.start_job(&ghost).unwrap_err(),
            ConveyorError::JobNotFound(_)
        ));
    }
}
