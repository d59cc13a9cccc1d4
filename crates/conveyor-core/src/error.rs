//! Unified error types for all layers of the framework.

use crate::job::JobStatus;
use thiserror::Error;

/// Result type for queue operations.
pub type ConveyorResult<T> = Result<T, ConveyorError>;

/// Unified error type for Conveyor.
///
/// Every public operation surfaces one of these variants so callers can
/// branch on the kind rather than parse messages.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// Operation invoked before start or after stop.
    #[error("Queue manager is not running")]
    NotRunning,

    /// Queue name is not declared in configuration.
    #[error("Unknown queue: {0}")]
    QueueUnknown(String),

    /// Provider name is not declared in configuration.
    #[error("Unknown provider: {0}")]
    ProviderUnknown(String),

    /// Payload or job failed schema validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transport endpoint could not be reached.
    #[error("Backend unavailable ({provider}): {message}")]
    BackendUnavailable { provider: String, message: String },

    /// Transport operation failed.
    #[error("Backend error ({provider}): {message}")]
    Backend { provider: String, message: String },

    /// Job id is not present in the scheduler.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Scheduler state-machine precondition violated.
    #[error("Illegal transition for job {job_id}: cannot {operation} from {from}")]
    IllegalTransition {
        job_id: String,
        from: JobStatus,
        operation: &'static str,
    },

    /// No handler registered for the job type.
    #[error("No handler registered for job type: {0}")]
    HandlerMissing(String),

    /// Handler exceeded its effective timeout.
    #[error("Job timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    /// Explicit cancellation observed.
    #[error("Job was cancelled")]
    Cancelled,

    /// Circuit breaker for the job type is open.
    #[error("Circuit breaker open for job type: {0}")]
    CircuitOpen(String),

    /// Processor is at its concurrency limit.
    #[error("Processor overloaded: {active} active jobs (limit {limit})")]
    Overloaded { active: usize, limit: usize },

    /// Backend refused the payload size.
    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Backend-specific admission conflict.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Handler execution failed.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConveyorError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotRunning => "NOT_RUNNING",
            Self::QueueUnknown(_) => "QUEUE_UNKNOWN",
            Self::ProviderUnknown(_) => "PROVIDER_UNKNOWN",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::Backend { .. } => "BACKEND_ERROR",
            Self::JobNotFound(_) => "JOB_NOT_FOUND",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::HandlerMissing(_) => "HANDLER_MISSING",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::Overloaded { .. } => "OVERLOADED",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::Conflict(_) => "CONFLICT",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::ExecutionFailed(_) => "EXECUTION_FAILED",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if the operation may be retried by the caller.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. }
                | Self::Backend { .. }
                | Self::Timeout { .. }
                | Self::Overloaded { .. }
                | Self::CircuitOpen(_)
                | Self::ExecutionFailed(_)
        )
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a backend error for the given provider.
    #[must_use]
    pub fn backend<T: ToString>(provider: &str, error: T) -> Self {
        Self::Backend {
            provider: provider.to_string(),
            message: error.to_string(),
        }
    }

    /// Creates a backend-unavailable error for the given provider.
    #[must_use]
    pub fn unavailable<T: ToString>(provider: &str, error: T) -> Self {
        Self::BackendUnavailable {
            provider: provider.to_string(),
            message: error.to_string(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ConveyorError::NotRunning.error_code(), "NOT_RUNNING");
        assert_eq!(
            ConveyorError::QueueUnknown("q".to_string()).error_code(),
            "QUEUE_UNKNOWN"
        );
        assert_eq!(
            ConveyorError::validation("bad").error_code(),
            "VALIDATION_FAILED"
        );
        assert_eq!(
            ConveyorError::Timeout { elapsed_ms: 50 }.error_code(),
            "TIMEOUT"
        );
        assert_eq!(ConveyorError::Cancelled.error_code(), "CANCELLED");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ConveyorError::unavailable("redis", "refused").is_retryable());
        assert!(ConveyorError::Timeout { elapsed_ms: 1 }.is_retryable());
        assert!(ConveyorError::Overloaded { active: 10, limit: 10 }.is_retryable());
        assert!(!ConveyorError::validation("bad").is_retryable());
        assert!(!ConveyorError::NotRunning.is_retryable());
        assert!(!ConveyorError::Cancelled.is_retryable());
    }

    #[test]
    fn test_illegal_transition_display() {
        let err = ConveyorError::IllegalTransition {
            job_id: "j1".to_string(),
            from: JobStatus::Completed,
            operation: "start",
        };
        let text = err.to_string();
        assert!(text.contains("j1"));
        assert!(text.contains("start"));
        assert!(text.contains("completed"));
    }

    #[test]
    fn test_constructors() {
        let err = ConveyorError::backend("amqp", "channel closed");
        assert!(err.to_string().contains("amqp"));
        assert!(err.to_string().contains("channel closed"));

        let err = ConveyorError::unavailable("redis", "connection refused");
        assert_eq!(err.error_code(), "BACKEND_UNAVAILABLE");
    }
}
