//! Durable event bus adapter.
//!
//! Wraps a JetStream-backed pub/sub transport behind a trait narrow enough
//! that `gridflow-core` never imports `async-nats` directly. The adapter
//! owns subject naming, stream/consumer provisioning and redelivery
//! bookkeeping; callers only see `publish` and `subscribe`.

mod error;
pub mod nats;
pub mod subjects;

pub mod config;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
pub use error::PublishError;
use futures::Stream;

/// Where a stream retains messages until acked (work-queue) or until a
/// retention limit is hit regardless of ack state (limits). Task dispatch
/// subjects use work-queue so a redelivered message is never picked up by
/// two competing workers once acked; status/event subjects use limits so
/// multiple independent subscribers can each consume the full history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    Limits,
    WorkQueue,
}

/// Declarative stream configuration, passed to `EventBus::create_or_update_stream`.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub max_age: Option<Duration>,
}

/// Declarative durable pull-consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: String,
    pub ack_wait: Duration,
    pub max_deliver: i64,
}

/// Acknowledges, negative-acknowledges, or terminates a single delivered
/// message. Boxed so `DeliveredMessage` stays transport-agnostic.
#[async_trait]
pub trait Ackable: Send + Sync {
    /// Confirms processing; the message will not be redelivered.
    async fn ack(&self) -> Result<(), PublishError>;
    /// Signals a transient failure; the server redelivers after `delay`
    /// (or its default backoff if `None`), subject to `max_deliver`.
    async fn nak(&self, delay: Option<Duration>) -> Result<(), PublishError>;
    /// Signals a permanent failure; the message is dropped without further
    /// redelivery attempts, independent of `max_deliver`.
    async fn term(&self) -> Result<(), PublishError>;
    /// 1-based delivery attempt count as tracked by the server.
    fn delivery_count(&self) -> u64;
}

/// A single message pulled off a consumer, with its payload and ack handle.
pub struct DeliveredMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub ack: Box<dyn Ackable>,
}

impl std::fmt::Debug for DeliveredMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveredMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.ack.delivery_count())
            .finish()
    }
}

/// Sequence position assigned by the server on a successful publish.
#[derive(Debug, Clone, Copy)]
pub struct PublishAck {
    pub stream_sequence: u64,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = DeliveredMessage> + Send>>;

/// The transport seam between `gridflow-core` and whatever durable bus
/// backs it in production (NATS JetStream via [`nats::NatsBus`]) or in
/// tests (an in-process double living in `gridflow-test-utils`).
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes `payload` to `subject` and waits for the server's ack.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<PublishAck, PublishError>;

    /// Idempotently creates or updates a stream. Safe to call on every
    /// startup; existing streams are reconciled rather than recreated.
    async fn create_or_update_stream(&self, config: StreamConfig) -> Result<(), PublishError>;

    /// Idempotently creates or updates a durable pull consumer on `stream`.
    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<(), PublishError>;

    /// Returns an unbounded stream of messages pulled from `consumer` on
    /// `stream`. The stream never ends on its own; callers drop it (or
    /// cancel the task polling it) to stop consuming.
    async fn subscribe(&self, stream: &str, consumer: &str) -> Result<MessageStream, PublishError>;
}
