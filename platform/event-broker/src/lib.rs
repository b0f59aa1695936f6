//! # EventBroker Abstraction
//!
//! A platform-level abstraction over the durable message broker that sits
//! between the webhook ingress and the worker.
//!
//! ## Why This Lives in `platform/`
//!
//! The broker is a shared runtime capability: the ingress publishes to it,
//! the worker consumes from it, and neither should care which transport is
//! behind the trait. Keeping it here allows a config-driven swap between
//! AMQP (production) and an in-memory queue (dev/test).
//!
//! ## Implementations
//!
//! - **AmqpBroker**: production implementation over an AMQP broker, using a
//!   durable direct exchange bound to a durable queue
//! - **InMemoryBroker**: test/dev implementation backed by an in-process
//!   queue with real requeue-on-nack semantics

mod amqp;
mod memory;

pub use amqp::AmqpBroker;
pub use memory::InMemoryBroker;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// A message handed to the broker for durable publication.
#[derive(Debug, Clone, Default)]
pub struct BrokerMessage {
    /// The message payload (raw bytes, JSON by convention)
    pub payload: Vec<u8>,
    /// String metadata attached outside the payload so consumers can route
    /// without decoding the body
    pub headers: HashMap<String, String>,
}

impl BrokerMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            headers: HashMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// A message received from the broker, pending manual acknowledgement.
///
/// Exactly one of [`Delivery::ack`] or [`Delivery::nack`] must be called;
/// both consume the delivery.
pub struct Delivery {
    /// The message payload
    pub payload: Vec<u8>,
    /// Metadata headers attached at publish time
    pub headers: HashMap<String, String>,
    /// Whether the broker has presented this message before
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            headers,
            redelivered,
            acker,
        }
    }

    /// Look up a metadata header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Acknowledge the delivery, removing it from the queue.
    pub async fn ack(self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    /// Reject the delivery. With `requeue` the broker re-presents the
    /// message later; without it the message is dropped.
    pub async fn nack(self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Transport-specific acknowledgement handle carried by a [`Delivery`].
#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> BrokerResult<()>;
    async fn nack(self: Box<Self>, requeue: bool) -> BrokerResult<()>;
}

/// Errors that can occur when talking to the broker
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("publish timed out after {0} seconds")]
    PublishTimeout(u64),

    #[error("failed to consume from queue: {0}")]
    ConsumeError(String),

    #[error("failed to acknowledge delivery: {0}")]
    AckError(String),

    #[error("failed to inspect queue: {0}")]
    QueueError(String),
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Core broker abstraction for durable publish/consume messaging.
///
/// `publish` must not return before the message is accepted by the broker;
/// `consume` yields manually-acknowledged deliveries for a single consumer.
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Durably publish a message to the configured exchange.
    async fn publish(&self, message: BrokerMessage) -> BrokerResult<()>;

    /// Start consuming from the configured queue in manual-ack mode.
    ///
    /// Deliveries carry the payload bytes and the metadata headers set at
    /// publish time. The stream ends when the broker connection does.
    async fn consume(&self) -> BrokerResult<BoxStream<'static, Delivery>>;

    /// Number of messages currently waiting in the queue.
    async fn queue_depth(&self) -> BrokerResult<u64>;

    /// Close the broker connection; publishes after this fail.
    async fn close(&self) -> BrokerResult<()>;
}

impl fmt::Debug for dyn EventBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBroker")
    }
}
