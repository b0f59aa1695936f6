use event_broker::{BrokerMessage, EventBroker, InMemoryBroker};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use webhook_relay::metrics::Metrics;
use webhook_relay::models::{metadata_headers, EventStatus, WebhookEvent};
use webhook_relay::storage::{EventStore, InMemoryStore};
use webhook_relay::worker::Worker;

const FAST_RETRY: Duration = Duration::from_millis(1);

fn pipeline() -> (Arc<InMemoryBroker>, Arc<InMemoryStore>, Worker) {
    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryStore::new());
    let worker = Worker::new(broker.clone(), store.clone(), Metrics::new())
        .with_retry_policy(3, FAST_RETRY);
    (broker, store, worker)
}

fn sample_event() -> WebhookEvent {
    WebhookEvent {
        webhook_id: format!("wh_{}", Uuid::new_v4()),
        webhook_type: "email_event".to_string(),
        tenant_id: "acme".to_string(),
        event: "delivered".to_string(),
        email: "a@b.test".to_string(),
        ..Default::default()
    }
}

async fn publish(broker: &InMemoryBroker, event: &WebhookEvent) {
    let message = BrokerMessage::new(serde_json::to_vec(event).unwrap())
        .with_headers(metadata_headers(event));
    broker.publish(message).await.unwrap();
}

/// Happy path: insert, mark processed, ack.
#[tokio::test]
async fn test_delivery_persisted_and_acked() {
    let (broker, store, worker) = pipeline();
    let event = sample_event();
    publish(&broker, &event).await;

    let mut deliveries = broker.consume().await.unwrap();
    let delivery = deliveries.next().await.unwrap();
    worker.handle_delivery(delivery).await;

    let stored = store.find(&event.webhook_id).expect("event must be stored");
    assert_eq!(stored.status, EventStatus::Processed);
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.tenant_id, "acme");
    assert!(stored.updated_at.is_some());

    assert_eq!(broker.queue_depth().await.unwrap(), 0);
}

/// Delivery headers override whatever the body claims; the ingress is
/// authoritative.
#[tokio::test]
async fn test_header_metadata_overrides_body() {
    let (broker, store, worker) = pipeline();

    let event = sample_event();
    let mut headers = metadata_headers(&event);
    headers.insert("tenant_id".to_string(), "header-tenant".to_string());
    headers.insert("webhook_id".to_string(), "header-id".to_string());

    let message =
        BrokerMessage::new(serde_json::to_vec(&event).unwrap()).with_headers(headers);
    broker.publish(message).await.unwrap();

    let mut deliveries = broker.consume().await.unwrap();
    worker.handle_delivery(deliveries.next().await.unwrap()).await;

    let stored = store.find("header-id").expect("event stored under header id");
    assert_eq!(stored.tenant_id, "header-tenant");
    assert!(store.find(&event.webhook_id).is_none());
}

/// Malformed payloads are dropped without requeue so they cannot poison
/// the queue.
#[tokio::test]
async fn test_malformed_delivery_dropped() {
    let (broker, store, worker) = pipeline();

    broker
        .publish(BrokerMessage::new(b"{definitely not json".to_vec()))
        .await
        .unwrap();

    let mut deliveries = broker.consume().await.unwrap();
    worker.handle_delivery(deliveries.next().await.unwrap()).await;

    assert!(store.events().is_empty());
    assert_eq!(broker.queue_depth().await.unwrap(), 0);

    let nothing = tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
    assert!(nothing.is_err(), "malformed delivery must not be redelivered");
}

/// A transient insert failure is retried through the broker and succeeds
/// on redelivery.
#[tokio::test]
async fn test_transient_failure_retries_and_recovers() {
    let (broker, store, worker) = pipeline();
    let event = sample_event();
    publish(&broker, &event).await;
    store.fail_next_inserts(1);

    let mut deliveries = broker.consume().await.unwrap();

    // First attempt fails and requeues; nothing has been stored yet, so
    // the `retrying` status write matches no document
    worker.handle_delivery(deliveries.next().await.unwrap()).await;
    assert!(store.find(&event.webhook_id).is_none());
    assert_eq!(broker.queue_depth().await.unwrap(), 1);

    // Redelivery carries the incremented count and succeeds
    worker.handle_delivery(deliveries.next().await.unwrap()).await;
    let stored = store.find(&event.webhook_id).unwrap();
    assert_eq!(stored.status, EventStatus::Processed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(broker.queue_depth().await.unwrap(), 0);
}

/// Retry budget exhaustion: three failed attempts, then the record is
/// written `failed` with `retry_count = 3` and the delivery acked.
#[tokio::test]
async fn test_retry_budget_exhaustion_dead_letters() {
    let (broker, store, worker) = pipeline();
    let event = sample_event();
    publish(&broker, &event).await;
    store.fail_next_inserts(3);

    let mut deliveries = broker.consume().await.unwrap();
    for _ in 0..3 {
        let delivery = tokio::time::timeout(Duration::from_secs(1), deliveries.next())
            .await
            .expect("delivery expected")
            .expect("stream open");
        worker.handle_delivery(delivery).await;
    }

    let stored = store.find(&event.webhook_id).expect("dead-letter recorded");
    assert_eq!(stored.status, EventStatus::Failed);
    assert_eq!(stored.retry_count, 3);
    // Even though no regular insert ever landed, the dead-letter is a
    // full record, not a status stub
    assert_eq!(stored.tenant_id, "acme");
    assert_eq!(stored.event, "delivered");

    // Acked exactly once: nothing left in the queue, nothing redelivered
    assert_eq!(broker.queue_depth().await.unwrap(), 0);
    let nothing = tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
    assert!(nothing.is_err());

    let failed = store.get_failed("acme").await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].webhook_id, event.webhook_id);
}

/// End-to-end through `Worker::run`: events published while the loop is
/// live are persisted; shutdown stops consumption.
#[tokio::test]
async fn test_run_loop_drains_and_stops_on_shutdown() {
    let (broker, store, worker) = pipeline();

    let first = sample_event();
    let second = sample_event();
    publish(&broker, &first).await;
    publish(&broker, &second).await;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = Arc::new(worker);
    let run_worker = worker.clone();
    let run = tokio::spawn(async move {
        run_worker
            .run(async move {
                stop_rx.await.ok();
            })
            .await
    });

    // Wait until both deliveries are persisted
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if broker.queue_depth().await.unwrap() == 0 && store.events().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker should drain the queue");

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("run loop should stop after shutdown")
        .unwrap()
        .unwrap();

    assert_eq!(store.find(&first.webhook_id).unwrap().status, EventStatus::Processed);
    assert_eq!(store.find(&second.webhook_id).unwrap().status, EventStatus::Processed);
}
