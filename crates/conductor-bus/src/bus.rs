//! MessageBus port definition

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error type for bus operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// Broker connectivity failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Bus has been disconnected
    #[error("bus is disconnected")]
    Disconnected,

    /// Subscription could not be established
    #[error("subscribe failed on topic {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
}

impl BusError {
    /// Transport failures are transient and worth a backoff retry;
    /// everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transport(_))
    }
}

/// Round-trip health probe result
#[derive(Debug, Clone)]
pub struct BusHealth {
    pub ok: bool,
    pub latency_ms: u64,
}

/// Acknowledgement decision returned by a handler.
///
/// Only meaningful for stream-backed (consumer-group) deliveries: `Retry`
/// leaves the entry unacknowledged so it is re-delivered later. Pub/sub-only
/// deliveries have no ack; the value is ignored there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Entry is done, acknowledge it
    Ack,
    /// Leave the entry pending for another attempt
    Retry,
}

/// One message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: serde_json::Value,
    /// `message_id` extracted from the payload, when the producer set one
    pub message_id: Option<String>,
    /// Broker-assigned stream entry id for stream-backed deliveries
    pub stream_id: Option<String>,
    /// Delivery attempt, starting at 1; grows on redelivery
    pub attempt: u32,
}

/// Subscriber callback. Invoked once per delivery; concurrent invocations
/// are possible across messages.
pub type MessageHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, Ack> + Send + Sync>;

/// Options for a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Partition key; deliveries sharing a key stay ordered on stream-backed
    /// consumers (the orchestrator uses `workflow_id`)
    pub key: Option<String>,
    /// Also append the payload to this durable stream
    pub mirror_to_stream: Option<String>,
    /// Expiry applied to the mirrored stream key
    pub ttl: Option<Duration>,
}

impl PublishOptions {
    pub fn mirrored(stream: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            mirror_to_stream: Some(stream.into()),
            ttl: None,
        }
    }
}

/// Options for a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Competing-consumer group. When set, the subscription reads the
    /// topic's mirrored stream through this group (explicit ack, pending
    /// replay) instead of plain pub/sub broadcast.
    pub consumer_group: Option<String>,
    /// Consumer name inside the group; defaults to a generated id
    pub consumer_name: Option<String>,
    /// Stream to read when grouped; defaults to `stream:{topic}`
    pub stream: Option<String>,
}

impl SubscribeOptions {
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            consumer_group: Some(name.into()),
            consumer_name: None,
            stream: None,
        }
    }
}

/// Handle returned by `subscribe`; dropping it does NOT unsubscribe.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub topic: String,
    pub(crate) token: CancellationToken,
}

impl SubscriptionHandle {
    pub(crate) fn new(topic: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic: topic.into(),
            token: CancellationToken::new(),
        }
    }
}

/// Asynchronous, topic-based pub/sub with optional durable stream mirroring
/// and consumer groups.
///
/// `subscribe` resolves only after the subscription is confirmed live:
/// callers may publish immediately after awaiting it and rely on delivery.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a message. Completes only after the broker accepted the
    /// publish (and the stream append when mirroring is requested).
    async fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        options: PublishOptions,
    ) -> Result<(), BusError>;

    /// Attach a handler to a topic. Returns after the subscription is live.
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, BusError>;

    /// Detach a subscription.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError>;

    /// Round-trip PING.
    async fn health(&self) -> Result<BusHealth, BusError>;

    /// Release all resources and stop background consumers.
    async fn disconnect(&self) -> Result<(), BusError>;
}

/// Extract the `message_id` field from a wire payload, when present.
pub(crate) fn message_id_of(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("message_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_transient() {
        assert!(BusError::Transport("connection reset".into()).is_transient());
        assert!(!BusError::Serialization("bad json".into()).is_transient());
        assert!(!BusError::Disconnected.is_transient());
    }

    #[test]
    fn test_message_id_extraction() {
        let payload = serde_json::json!({"message_id": "abc", "other": 1});
        assert_eq!(message_id_of(&payload).as_deref(), Some("abc"));
        assert_eq!(message_id_of(&serde_json::json!({})), None);
    }
}
