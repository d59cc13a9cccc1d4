//! Messaging patterns over the queue manager.

pub mod pubsub;
pub mod work_queue;

pub use pubsub::{PubSub, PubSubConfig, SubscriberCallback};
pub use work_queue::{WorkQueue, WorkQueueConfig, WorkerCallback, WorkerDelivery};
