//! Prometheus-style metrics for queue monitoring.

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Metric names published by the queue manager.
pub mod names {
    /// Total messages accepted by providers.
    pub const MESSAGES_SENT_TOTAL: &str = "conveyor_messages_sent_total";
    /// Total messages handed to consumers.
    pub const MESSAGES_RECEIVED_TOTAL: &str = "conveyor_messages_received_total";
    /// Total messages acknowledged/deleted.
    pub const MESSAGES_DELETED_TOTAL: &str = "conveyor_messages_deleted_total";

    /// Total jobs submitted.
    pub const JOBS_SUBMITTED_TOTAL: &str = "conveyor_jobs_submitted_total";
    /// Total jobs completed successfully.
    pub const JOBS_PROCESSED_TOTAL: &str = "conveyor_jobs_processed_total";
    /// Total failed attempts, including retried ones.
    pub const JOB_ATTEMPT_FAILURES_TOTAL: &str = "conveyor_job_attempt_failures_total";
    /// Total jobs that exhausted their retries.
    pub const JOBS_FAILED_TOTAL: &str = "conveyor_jobs_failed_total";
    /// Total jobs cancelled.
    pub const JOBS_CANCELLED_TOTAL: &str = "conveyor_jobs_cancelled_total";

    /// Jobs submitted but not yet terminal.
    pub const JOBS_QUEUED: &str = "conveyor_jobs_queued";
    /// Messages waiting per queue.
    pub const QUEUE_DEPTH: &str = "conveyor_queue_depth";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "conveyor_job_duration_seconds";
}

/// Registers metric descriptions with the installed recorder.
pub fn register_metrics() {
    describe_counter!(names::MESSAGES_SENT_TOTAL, "Total messages accepted by providers");
    describe_counter!(
        names::MESSAGES_RECEIVED_TOTAL,
        "Total messages handed to consumers"
    );
    describe_counter!(names::MESSAGES_DELETED_TOTAL, "Total messages acknowledged");
    describe_counter!(names::JOBS_SUBMITTED_TOTAL, "Total jobs submitted");
    describe_counter!(
        names::JOBS_PROCESSED_TOTAL,
        "Total jobs completed successfully"
    );
    describe_counter!(
        names::JOB_ATTEMPT_FAILURES_TOTAL,
        "Total failed job attempts, including retried ones"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total jobs that exhausted their retries"
    );
    describe_counter!(names::JOBS_CANCELLED_TOTAL, "Total jobs cancelled");
    describe_gauge!(names::JOBS_QUEUED, "Jobs submitted but not yet terminal");
    describe_gauge!(names::QUEUE_DEPTH, "Messages waiting per queue");
    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");
}
