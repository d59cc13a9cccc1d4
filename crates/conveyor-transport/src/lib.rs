//! Conveyor Transport - provider abstraction and backend bindings
//!
//! A [`Provider`] binds queue names to a concrete backend: process-local
//! memory, Redis lists, an AMQP broker, a Kafka record log, or SQS. The queue
//! manager talks only to this trait; backend differences in ack semantics,
//! delay support, and queue lifecycle live behind it.

pub mod amqp;
pub mod kafka;
pub mod memory;
pub mod provider;
pub mod redis;
pub mod sqs;

pub use amqp::AmqpProvider;
pub use kafka::KafkaProvider;
pub use memory::MemoryProvider;
pub use provider::{build_provider, validate_queue_name, MessageCallback, Provider};
pub use redis::RedisProvider;
pub use sqs::SqsProvider;
