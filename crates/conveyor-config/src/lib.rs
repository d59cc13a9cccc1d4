//! Conveyor Config - schema-checked configuration
//!
//! The configuration surface recognised by the queue manager: providers,
//! queue bindings, retry policy, and monitoring intervals. Unknown fields are
//! rejected everywhere, and `ConveyorConfig::validate` must pass before the
//! manager will start.

pub mod loader;
pub mod settings;

pub use loader::ConfigLoader;
pub use settings::{
    ConveyorConfig, MonitoringConfig, ProviderConfig, ProviderSettings, QueueBinding,
    QueueOptions, RetryPolicyConfig,
};
