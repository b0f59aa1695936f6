//! In-memory implementation of the EventBroker trait for testing and development

use crate::{
    Acknowledger, BrokerError, BrokerMessage, BrokerResult, Delivery, EventBroker,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// EventBroker implementation backed by an in-process queue.
///
/// Unlike a broadcast bus, this models real queue semantics: a single
/// consumer, messages held until acknowledged (depth accounting), and
/// requeue-on-nack putting the message back at the tail of the queue.
///
/// Suitable for unit/integration tests and local development without an
/// AMQP broker.
///
/// # Example
/// ```rust
/// use event_broker::{BrokerMessage, EventBroker, InMemoryBroker};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.publish(BrokerMessage::new(b"hello".to_vec())).await?;
///
/// let mut deliveries = broker.consume().await?;
/// let delivery = deliveries.next().await.unwrap();
/// assert_eq!(delivery.payload, b"hello");
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
pub struct InMemoryBroker {
    tx: mpsc::UnboundedSender<QueuedMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedMessage>>>,
    depth: Arc<AtomicU64>,
    closed: AtomicBool,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    payload: Vec<u8>,
    headers: HashMap<String, String>,
    redelivered: bool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            depth: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBroker for InMemoryBroker {
    async fn publish(&self, message: BrokerMessage) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionError(
                "broker is closed".to_string(),
            ));
        }

        let queued = QueuedMessage {
            payload: message.payload,
            headers: message.headers,
            redelivered: false,
        };

        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(queued)
            .map_err(|_| BrokerError::PublishError("queue receiver dropped".to_string()))
    }

    async fn consume(&self) -> BrokerResult<BoxStream<'static, Delivery>> {
        let mut rx = self
            .rx
            .lock()
            .expect("in-memory broker mutex poisoned")
            .take()
            .ok_or_else(|| {
                BrokerError::ConsumeError("a consumer is already attached".to_string())
            })?;

        let tx = self.tx.clone();
        let depth = self.depth.clone();

        let stream = async_stream::stream! {
            while let Some(message) = rx.recv().await {
                let acker = MemoryAcker {
                    message: message.clone(),
                    tx: tx.clone(),
                    depth: depth.clone(),
                };
                yield Delivery::new(
                    message.payload,
                    message.headers,
                    message.redelivered,
                    Box::new(acker),
                );
            }
        };

        Ok(stream.boxed())
    }

    async fn queue_depth(&self) -> BrokerResult<u64> {
        Ok(self.depth.load(Ordering::SeqCst))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryAcker {
    message: QueuedMessage,
    tx: mpsc::UnboundedSender<QueuedMessage>,
    depth: Arc<AtomicU64>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> BrokerResult<()> {
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> BrokerResult<()> {
        if requeue {
            let mut message = self.message;
            message.redelivered = true;
            // Still counted in the depth; the message never left the queue
            self.tx
                .send(message)
                .map_err(|_| BrokerError::AckError("queue receiver dropped".to_string()))?;
        } else {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message(payload: &[u8]) -> BrokerMessage {
        BrokerMessage::new(payload.to_vec())
    }

    #[tokio::test]
    async fn test_publish_and_consume_in_order() {
        let broker = InMemoryBroker::new();

        for i in 0..3 {
            broker
                .publish(message(format!("message {i}").as_bytes()))
                .await
                .unwrap();
        }
        assert_eq!(broker.queue_depth().await.unwrap(), 3);

        let mut deliveries = broker.consume().await.unwrap();
        for i in 0..3 {
            let delivery = deliveries.next().await.unwrap();
            assert_eq!(delivery.payload, format!("message {i}").into_bytes());
            assert!(!delivery.redelivered);
            delivery.ack().await.unwrap();
        }

        assert_eq!(broker.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_headers_round_trip() {
        let broker = InMemoryBroker::new();

        let mut headers = HashMap::new();
        headers.insert("webhook_id".to_string(), "wh_1".to_string());
        headers.insert("tenant_id".to_string(), "acme".to_string());

        broker
            .publish(message(b"{}").with_headers(headers))
            .await
            .unwrap();

        let mut deliveries = broker.consume().await.unwrap();
        let delivery = deliveries.next().await.unwrap();
        assert_eq!(delivery.header("webhook_id"), Some("wh_1"));
        assert_eq!(delivery.header("tenant_id"), Some("acme"));
        assert_eq!(delivery.header("missing"), None);
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        broker.publish(message(b"retry me")).await.unwrap();

        let mut deliveries = broker.consume().await.unwrap();
        let first = deliveries.next().await.unwrap();
        first.nack(true).await.unwrap();

        // Depth unchanged: the message went back to the queue
        assert_eq!(broker.queue_depth().await.unwrap(), 1);

        let second = deliveries.next().await.unwrap();
        assert_eq!(second.payload, b"retry me");
        assert!(second.redelivered);
        second.ack().await.unwrap();
        assert_eq!(broker.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_drops() {
        let broker = InMemoryBroker::new();
        broker.publish(message(b"poison")).await.unwrap();

        let mut deliveries = broker.consume().await.unwrap();
        let delivery = deliveries.next().await.unwrap();
        delivery.nack(false).await.unwrap();

        assert_eq!(broker.queue_depth().await.unwrap(), 0);
        let nothing =
            tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
        assert!(nothing.is_err(), "dropped message must not come back");
    }

    #[tokio::test]
    async fn test_single_consumer_only() {
        let broker = InMemoryBroker::new();
        let _first = broker.consume().await.unwrap();
        assert!(broker.consume().await.is_err());
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let broker = InMemoryBroker::new();
        broker.close().await.unwrap();
        assert!(broker.publish(message(b"late")).await.is_err());
    }
}
