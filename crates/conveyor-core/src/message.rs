//! Message model: the unit carried over a queue.

use crate::error::{ConveyorError, ConveyorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the message ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Delivery metadata attached to every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Creation instant.
    pub timestamp: DateTime<Utc>,

    /// Priority 0-255; higher is more urgent. Ties break by enqueue order.
    pub priority: u8,

    /// Delivery must not happen before `timestamp + delay`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,

    /// Message expires if not delivered within this interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,

    /// Delivery attempts so far.
    pub retry_count: u32,

    /// Maximum redelivery attempts.
    pub max_retries: u32,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            priority: DEFAULT_PRIORITY,
            delay: None,
            ttl: None,
            retry_count: 0,
            max_retries: 3,
        }
    }
}

/// Default message priority (middle of the 0-255 range).
pub const DEFAULT_PRIORITY: u8 = 128;

/// Per-send options accepted by `send_message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendOptions {
    /// Priority 0-255.
    pub priority: Option<u8>,

    /// Delivery delay.
    pub delay: Option<Duration>,

    /// Time to live.
    pub ttl: Option<Duration>,

    /// Maximum redelivery attempts.
    pub max_retries: Option<u32>,
}

/// A message: opaque payload plus delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message ID, unique within the process.
    pub id: MessageId,

    /// Opaque user payload, carried verbatim end-to-end.
    pub payload: Value,

    /// Delivery metadata.
    pub metadata: MessageMetadata,

    /// Opaque backend token captured at receive time (SQS-like backends).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_handle: Option<String>,
}

impl Message {
    /// Creates a message with default metadata.
    pub fn new(payload: Value) -> Self {
        Self {
            id: MessageId::new(),
            payload,
            metadata: MessageMetadata::default(),
            receipt_handle: None,
        }
    }

    /// Creates a message applying the given send options.
    pub fn with_options(payload: Value, opts: &SendOptions, default_max_retries: u32) -> Self {
        let mut message = Self::new(payload);
        if let Some(priority) = opts.priority {
            message.metadata.priority = priority;
        }
        message.metadata.delay = opts.delay;
        message.metadata.ttl = opts.ttl;
        message.metadata.max_retries = opts.max_retries.unwrap_or(default_max_retries);
        message
    }

    /// Returns true if the TTL window has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.metadata.ttl {
            Some(ttl) => {
                let deadline = self.metadata.timestamp
                    + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
                now > deadline
            }
            None => false,
        }
    }

    /// Returns true if the delivery delay has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.metadata.delay {
            Some(delay) => {
                let ready_at = self.metadata.timestamp
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                now >= ready_at
            }
            None => true,
        }
    }

    /// Returns true if another redelivery attempt is allowed.
    pub fn can_redeliver(&self) -> bool {
        self.metadata.retry_count < self.metadata.max_retries
    }

    /// Validates metadata invariants.
    pub fn validate(&self) -> ConveyorResult<()> {
        if self.metadata.retry_count > self.metadata.max_retries {
            return Err(ConveyorError::validation(format!(
                "retry_count {} exceeds max_retries {}",
                self.metadata.retry_count, self.metadata.max_retries
            )));
        }
        Ok(())
    }

    /// Serialize to JSON for the wire.
    pub fn to_json(&self) -> ConveyorResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON off the wire.
    pub fn from_json(json: &str) -> ConveyorResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_id_uniqueness() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_round_trip() {
        let message = Message::new(json!({"x": 1, "nested": {"y": [1, 2, 3]}}));
        let json = message.to_json().unwrap();
        let restored = Message::from_json(&json).unwrap();
        assert_eq!(restored.id, message.id);
        assert_eq!(restored.payload, message.payload);
    }

    #[test]
    fn test_ttl_expiry() {
        let mut message = Message::new(json!(null));
        message.metadata.ttl = Some(Duration::from_millis(10));
        assert!(!message.is_expired(message.metadata.timestamp));
        let later = message.metadata.timestamp + chrono::Duration::seconds(1);
        assert!(message.is_expired(later));
    }

    #[test]
    fn test_delay_due() {
        let mut message = Message::new(json!(null));
        message.metadata.delay = Some(Duration::from_secs(5));
        assert!(!message.is_due(message.metadata.timestamp));
        let later = message.metadata.timestamp + chrono::Duration::seconds(6);
        assert!(message.is_due(later));
    }

    #[test]
    fn test_with_options() {
        let opts = SendOptions {
            priority: Some(200),
            delay: None,
            ttl: Some(Duration::from_secs(60)),
            max_retries: None,
        };
        let message = Message::with_options(json!(1), &opts, 5);
        assert_eq!(message.metadata.priority, 200);
        assert_eq!(message.metadata.ttl, Some(Duration::from_secs(60)));
        assert_eq!(message.metadata.max_retries, 5);
    }

    #[test]
    fn test_validate_retry_invariant() {
        let mut message = Message::new(json!(null));
        message.metadata.retry_count = 4;
        message.metadata.max_retries = 3;
        assert!(message.validate().is_err());
    }
}
