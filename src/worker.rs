//! Queue worker.
//!
//! A single consumer per process: decode the delivery, persist it, and
//! acknowledge. Storage failures are retried with jittered exponential
//! backoff up to a bounded budget, after which the event is recorded as
//! `failed` and the delivery acknowledged (dead-letter by acceptance).
//! Malformed payloads are dropped without requeue to avoid poison loops.

use event_broker::{BrokerMessage, Delivery, EventBroker};
use futures::StreamExt;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::Metrics;
use crate::models::{metadata_headers, EventStatus, WebhookEvent};
use crate::storage::{EventStore, StoreError};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(10);

pub struct Worker {
    broker: Arc<dyn EventBroker>,
    store: Arc<dyn EventStore>,
    metrics: Metrics,
    max_retries: u32,
    base_delay: Duration,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn EventBroker>,
        store: Arc<dyn EventStore>,
        metrics: Metrics,
    ) -> Self {
        Self {
            broker,
            store,
            metrics,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    /// Consume until `shutdown` resolves. The in-flight delivery is always
    /// finished before the loop exits.
    pub async fn run(
        &self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), event_broker::BrokerError> {
        let mut deliveries = self.broker.consume().await?;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received, worker draining");
                    break;
                }
                delivery = deliveries.next() => match delivery {
                    Some(delivery) => self.handle_delivery(delivery).await,
                    None => {
                        tracing::warn!("delivery stream closed");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn handle_delivery(&self, delivery: Delivery) {
        let start = Metrics::timer();

        let mut event: WebhookEvent = match serde_json::from_slice(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    payload_len = delivery.payload.len(),
                    "failed to decode delivery, dropping"
                );
                if let Err(e) = delivery.nack(false).await {
                    tracing::error!(error = %e, "failed to drop malformed delivery");
                }
                return;
            }
        };

        // The ingress-set headers are authoritative over the body
        for (header, field) in [
            ("webhook_id", &mut event.webhook_id),
            ("webhook_type", &mut event.webhook_type),
            ("tenant_id", &mut event.tenant_id),
        ] {
            if let Some(value) = delivery.header(header) {
                if !value.is_empty() {
                    *field = value.to_string();
                }
            }
        }

        tracing::debug!(
            webhook_id = %event.webhook_id,
            tenant_id = %event.tenant_id,
            event = %event.event,
            retry_count = event.retry_count,
            redelivered = delivery.redelivered,
            "processing delivery"
        );

        match self.persist(&event).await {
            Ok(()) => {
                self.metrics
                    .webhook_processed_total
                    .with_label_values(&[&event.tenant_id, &event.event, "success"])
                    .inc();
                self.metrics
                    .webhook_processing_seconds
                    .with_label_values(&[&event.tenant_id, &event.event])
                    .observe(start.elapsed().as_secs_f64());

                if let Err(e) = delivery.ack().await {
                    tracing::error!(webhook_id = %event.webhook_id, error = %e, "failed to ack delivery");
                }
            }
            Err(e) => self.handle_failure(event, delivery, e).await,
        }
    }

    async fn persist(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        self.store.insert(event).await?;
        self.store
            .update_status(&event.webhook_id, EventStatus::Processed, event.retry_count)
            .await?;
        Ok(())
    }

    async fn handle_failure(&self, mut event: WebhookEvent, delivery: Delivery, error: StoreError) {
        event.retry_count += 1;

        tracing::error!(
            webhook_id = %event.webhook_id,
            tenant_id = %event.tenant_id,
            event = %event.event,
            retry_count = event.retry_count,
            error = %error,
            "failed to persist event"
        );
        self.metrics
            .webhook_retries_total
            .with_label_values(&[&event.tenant_id, &event.event])
            .inc();

        if event.retry_count >= self.max_retries {
            event.status = EventStatus::Failed;
            self.record_dead_letter(&event).await;
            self.metrics
                .webhook_processed_total
                .with_label_values(&[&event.tenant_id, &event.event, "failed"])
                .inc();

            tracing::error!(
                webhook_id = %event.webhook_id,
                tenant_id = %event.tenant_id,
                retry_count = event.retry_count,
                "retries exhausted, event dead-lettered"
            );
            if let Err(e) = delivery.ack().await {
                tracing::error!(webhook_id = %event.webhook_id, error = %e, "failed to ack dead-lettered delivery");
            }
            return;
        }

        if let Err(e) = self
            .store
            .update_status(&event.webhook_id, EventStatus::Retrying, event.retry_count)
            .await
        {
            tracing::error!(webhook_id = %event.webhook_id, error = %e, "failed to record retrying status");
        }

        tokio::time::sleep(self.backoff_delay(event.retry_count)).await;
        self.requeue(event, delivery).await;
    }

    /// Flip the stored record to `failed`. When no document matches, no
    /// insert attempt for this delivery ever landed, so the full event is
    /// written instead; the dead-letter must stay visible for replay.
    async fn record_dead_letter(&self, event: &WebhookEvent) {
        match self
            .store
            .update_status(&event.webhook_id, EventStatus::Failed, event.retry_count)
            .await
        {
            Ok(0) => {
                if let Err(e) = self.store.insert(event).await {
                    tracing::error!(
                        webhook_id = %event.webhook_id,
                        error = %e,
                        "failed to record dead-letter event"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(webhook_id = %event.webhook_id, error = %e, "failed to record dead-letter status");
            }
        }
    }

    /// Send the event back through the broker with its incremented retry
    /// count. A plain nack would redeliver the original body verbatim and
    /// reset the budget, so the retry is republished and the consumed
    /// delivery acknowledged; if the republish itself fails, fall back to
    /// nack-requeue rather than lose the message.
    async fn requeue(&self, event: WebhookEvent, delivery: Delivery) {
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(webhook_id = %event.webhook_id, error = %e, "failed to marshal retry payload");
                if let Err(e) = delivery.nack(true).await {
                    tracing::error!(error = %e, "failed to requeue delivery");
                }
                return;
            }
        };

        let message = BrokerMessage::new(payload).with_headers(metadata_headers(&event));
        match self.broker.publish(message).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    tracing::error!(webhook_id = %event.webhook_id, error = %e, "failed to ack requeued delivery");
                }
            }
            Err(e) => {
                tracing::error!(
                    webhook_id = %event.webhook_id,
                    error = %e,
                    "failed to republish retry, returning delivery to the broker"
                );
                if let Err(e) = delivery.nack(true).await {
                    tracing::error!(error = %e, "failed to requeue delivery");
                }
            }
        }
    }

    fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        let backoff = self.base_delay.as_secs_f64() * f64::from(2_u32.pow(exponent));
        let jitter = rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_secs_f64(backoff * jitter)
    }
}
