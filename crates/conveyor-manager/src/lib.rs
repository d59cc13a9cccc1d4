//! Conveyor Manager - the central coordinator
//!
//! The queue manager owns provider connections and queue routing, mediates
//! message and job traffic, keeps aggregate statistics, and runs the periodic
//! metrics and health tasks. The pattern layer builds work-queue dispatch and
//! pub/sub broadcast on top of it.
//!
//! # Example
//!
//! ```rust,ignore
//! use conveyor_config::ConveyorConfig;
//! use conveyor_core::{JobOptions, SendOptions};
//! use conveyor_manager::QueueManager;
//! use serde_json::json;
//!
//! let config = ConveyorConfig::in_memory().with_queue("default");
//! let manager = QueueManager::new(config)?;
//! manager.start().await?;
//!
//! let id = manager
//!     .send_message("default", json!({"hello": "world"}), SendOptions::default())
//!     .await?;
//! let message = manager.receive_message("default").await?;
//!
//! let job_id = manager
//!     .submit_job("email", json!({"to": "user@example.com"}), JobOptions::default())
//!     .await?;
//! ```

pub mod manager;
pub mod metrics;
pub mod patterns;

pub use manager::{ProviderDescriptor, QueueDescriptor, QueueManager, StatsSnapshot};
pub use metrics::register_metrics;
pub use patterns::{PubSub, PubSubConfig, WorkQueue, WorkQueueConfig, WorkerDelivery};
