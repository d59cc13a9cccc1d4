//! Conveyor Core - shared types for the message-queue framework
//!
//! Defines the message and job data model, the unified error type, provider
//! descriptors, and the in-process event bus. Every other Conveyor crate
//! builds on these types.

pub mod error;
pub mod events;
pub mod job;
pub mod message;
pub mod provider;

pub use error::{ConveyorError, ConveyorResult};
pub use events::{Event, EventBus, EventListener, QueueMetrics, Subscription, ALL_EVENTS};
pub use job::{job_queue_name, Job, JobFailure, JobId, JobOptions, JobPriority, JobStatus};
pub use message::{Message, MessageId, MessageMetadata, SendOptions, DEFAULT_PRIORITY};
pub use provider::{HealthStatus, ProviderHealth, ProviderKind, QueueInfo};
