//! Circuit breaker guarding job execution per job type.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    /// Requests are allowed.
    Closed = 0,
    /// Requests are rejected.
    Open = 1,
    /// Probe requests are allowed; the next outcome decides.
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Track breaker state at all. Disabled means no state is kept.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Cumulative failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time after the last failure before an Open circuit admits a probe.
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Three-state guard for one job type. Process-local.
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    failures: AtomicU32,
    last_failure: Mutex<Option<Instant>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            last_failure: Mutex::new(None),
            config,
        }
    }

    /// Returns the current state. An Open breaker whose reset timeout has
    /// elapsed flips to HalfOpen here, observed lazily on the next check.
    pub fn state(&self) -> CircuitState {
        let state = CircuitState::from(self.state.load(Ordering::SeqCst));
        if state == CircuitState::Open {
            let last_failure = *self.last_failure.lock();
            let elapsed = last_failure.map(|t| t.elapsed());
            if elapsed.is_some_and(|e| e >= self.config.reset_timeout) {
                self.state
                    .store(CircuitState::HalfOpen as u8, Ordering::SeqCst);
                debug!(breaker = %self.name, "Circuit transitioning to half-open");
                return CircuitState::HalfOpen;
            }
        }
        state
    }

    /// True if a request may proceed.
    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Records a successful execution.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
                self.failures.store(0, Ordering::SeqCst);
                debug!(breaker = %self.name, "Circuit closed after successful probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed execution.
    pub fn record_failure(&self) {
        *self.last_failure.lock() = Some(Instant::now());

        match self.state() {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
                    warn!(breaker = %self.name, failures, "Circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
                warn!(breaker = %self.name, "Circuit reopened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Resets to Closed, clearing all counters.
    pub fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
        *self.last_failure.lock() = None;
    }

    /// Breaker name (the job type it guards).
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                enabled: true,
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
            },
        )
    }

    #[test]
    fn test_initial_state_closed() {
        let cb = breaker(3, 1000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker(3, 1000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(2, 1000);
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_reset_timeout() {
        let cb = breaker(1, 20);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
    }

    #[tokio::test]
    async fn test_half_open_closes_on_success() {
        let cb = breaker(1, 10);
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_reopens_on_failure() {
        let cb = breaker(1, 10);
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_manual_reset() {
        let cb = breaker(1, 60000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }
}
