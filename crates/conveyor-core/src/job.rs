//! Job model and state machine vocabulary.

use crate::error::{ConveyorError, ConveyorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be picked up.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Exhausted all retries.
    Failed,
    /// Explicitly cancelled.
    Cancelled,
    /// Failed attempt, waiting for the retry delay.
    Retry,
}

impl JobStatus {
    /// Terminal states accept no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// Job priority levels, mapped onto the 0-255 message priority range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    /// Background work.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Important work.
    High,
    /// Time-sensitive work.
    Urgent,
}

impl JobPriority {
    /// Maps to the message priority byte.
    #[must_use]
    pub const fn as_message_priority(&self) -> u8 {
        match self {
            Self::Low => 64,
            Self::Normal => 128,
            Self::High => 192,
            Self::Urgent => 255,
        }
    }
}

/// Error captured from the last failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    /// Human-readable failure message.
    pub message: String,

    /// Optional stack or backtrace text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl JobFailure {
    /// Captures a failure from any displayable error.
    pub fn from_error<E: fmt::Display>(error: &E) -> Self {
        Self {
            message: error.to_string(),
            stack: None,
            timestamp: Utc::now(),
        }
    }
}

/// Options accepted by `submit_job`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobOptions {
    /// Priority level.
    pub priority: Option<JobPriority>,

    /// Maximum retry attempts.
    pub max_retries: Option<u32>,

    /// Base retry delay.
    pub retry_delay: Option<Duration>,

    /// Execution timeout.
    pub timeout: Option<Duration>,

    /// Earliest execution instant.
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Tags for categorization.
    pub tags: Option<Vec<String>>,
}

/// A scheduled unit of work, carried as a message payload on `jobs-<type>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job ID.
    pub id: JobId,

    /// Job type; selects the handler.
    pub job_type: String,

    /// Opaque job payload.
    pub data: Value,

    /// Current status.
    pub status: JobStatus,

    /// Priority level.
    pub priority: JobPriority,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last state-change timestamp.
    pub updated_at: DateTime<Utc>,

    /// Set on first entry into Running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Set on the most recent failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// Set on cancellation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,

    /// Maximum retry attempts.
    pub max_retries: u32,

    /// Failed attempts so far.
    pub retry_count: u32,

    /// Base retry delay.
    pub retry_delay: Duration,

    /// Execution timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Earliest execution instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Tags for categorization.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Error from the last failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobFailure>,

    /// Result of a successful run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Job {
    /// Creates a Pending job. Option fields in `opts` fall back to the
    /// given retry-policy defaults.
    pub fn new(
        job_type: impl Into<String>,
        data: Value,
        opts: JobOptions,
        default_max_retries: u32,
        default_retry_delay: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            data,
            status: JobStatus::Pending,
            priority: opts.priority.unwrap_or_default(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            max_retries: opts.max_retries.unwrap_or(default_max_retries),
            retry_count: 0,
            retry_delay: opts.retry_delay.unwrap_or(default_retry_delay),
            timeout: opts.timeout,
            scheduled_for: opts.scheduled_for,
            tags: opts.tags.unwrap_or_default(),
            last_error: None,
            result: None,
        }
    }

    /// Validates ingress invariants.
    pub fn validate(&self) -> ConveyorResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(ConveyorError::validation("job type must be non-empty"));
        }
        if self.retry_count > self.max_retries {
            return Err(ConveyorError::validation(format!(
                "retry_count {} exceeds max_retries {}",
                self.retry_count, self.max_retries
            )));
        }
        Ok(())
    }

    /// Serialize to an opaque message payload.
    pub fn to_envelope(&self) -> ConveyorResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserialize from a message payload.
    pub fn from_envelope(payload: &Value) -> ConveyorResult<Self> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

/// Queue name convention for job envelopes of a given type.
#[must_use]
pub fn job_queue_name(job_type: &str) -> String {
    format!("jobs-{job_type}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job::new(
            "email",
            json!({"to": "user@example.com"}),
            JobOptions::default(),
            3,
            Duration::from_millis(1000),
        )
    }

    #[test]
    fn test_new_job_defaults() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retry_count, 0);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Retry.is_terminal());
    }

    #[test]
    fn test_priority_mapping() {
        assert!(JobPriority::Urgent.as_message_priority() > JobPriority::High.as_message_priority());
        assert!(JobPriority::High.as_message_priority() > JobPriority::Normal.as_message_priority());
        assert!(JobPriority::Normal.as_message_priority() > JobPriority::Low.as_message_priority());
        assert_eq!(JobPriority::Urgent.as_message_priority(), 255);
    }

    #[test]
    fn test_validate_rejects_blank_type() {
        let mut job = sample_job();
        job.job_type = "  ".to_string();
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_envelope_round_trip() {
        let job = sample_job();
        let envelope = job.to_envelope().unwrap();
        let restored = Job::from_envelope(&envelope).unwrap();
        assert_eq!(restored.id, job.id);
        assert_eq!(restored.job_type, job.job_type);
        assert_eq!(restored.data, job.data);
    }

    #[test]
    fn test_job_queue_name() {
        assert_eq!(job_queue_name("email"), "jobs-email");
    }
}
