//! Conveyor Worker - job execution
//!
//! The processor runs registered handlers with timeout, cooperative
//! cancellation, and a per-job-type circuit breaker. The worker pool keeps N
//! consumer loops pulling job envelopes from queues and feeding them to the
//! processor, with optional utilisation-based auto-scaling.

pub mod circuit_breaker;
pub mod pool;
pub mod processor;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use pool::{
    select_index, AutoScaleConfig, LoadBalancingStrategy, MessageSource, WorkerInfo, WorkerPool,
    WorkerPoolConfig, WorkerPoolStats,
};
pub use processor::{
    HandlerContext, HandlerFuture, JobHandler, JobLifecycle, JobProcessor, ProcessOutcome,
    ProcessorConfig,
};
