use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, IndexModel};
use std::time::Duration;

use super::{EventStore, StoreError, StoreResult};
use crate::models::{EventStatus, WebhookEvent};

/// MongoDB-backed event store: one collection, six indexes, documents
/// carrying only set fields.
pub struct MongoStore {
    client: Client,
    collection: Collection<Document>,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str, collection: &str) -> StoreResult<Self> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        options.max_pool_size = Some(100);
        options.max_idle_time = Some(Duration::from_secs(30));
        options.connect_timeout = Some(Duration::from_secs(10));
        options.server_selection_timeout = Some(Duration::from_secs(10));

        let client =
            Client::with_options(options).map_err(|e| StoreError::Connection(e.to_string()))?;

        // Fail fast if the deployment is unreachable
        client
            .database(database)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::info!(database, collection, "connected to MongoDB");

        let collection = client.database(database).collection::<Document>(collection);
        let store = Self { client, collection };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> StoreResult<()> {
        let indexes = [
            doc! { "webhook_id": 1 },
            doc! { "tenant_id": 1 },
            doc! { "received_at": 1 },
            doc! { "campaign_id": 1, "tenant_id": 1, "event": 1 },
            doc! { "status": 1, "tenant_id": 1 },
            doc! { "email": 1, "campaign_id": 1 },
        ]
        .into_iter()
        .map(|keys| IndexModel::builder().keys(keys).build());

        self.collection
            .create_indexes(indexes)
            .await
            .map_err(|e| StoreError::Connection(format!("create indexes: {e}")))?;
        Ok(())
    }

    pub async fn close(self) {
        self.client.shutdown().await;
    }

    fn document_for(event: &WebhookEvent) -> Document {
        let mut document = doc! {
            "webhook_id": &event.webhook_id,
            "webhook_type": &event.webhook_type,
            "tenant_id": &event.tenant_id,
            "event": &event.event,
            "received_at": bson::DateTime::from_millis(event.received_at.timestamp_millis()),
            "status": event.status.as_str(),
            "retry_count": i64::from(event.retry_count),
        };

        // Optional fields only when they carry a value
        if !event.campaign_id.is_empty() {
            document.insert("campaign_id", &event.campaign_id);
        }
        if !event.campaign_name.is_empty() {
            document.insert("campaign_name", &event.campaign_name);
        }
        if !event.tag_name.is_empty() {
            document.insert("tag_name", &event.tag_name);
        }
        if !event.date_event.is_empty() {
            document.insert("date_event", &event.date_event);
        }
        if event.timestamp != 0 {
            document.insert("ts", event.timestamp);
        }
        if event.timestamp_event != 0 {
            document.insert("ts_event", event.timestamp_event);
        }
        if !event.url.is_empty() {
            document.insert("url", &event.url);
        }
        if !event.email.is_empty() {
            document.insert("email", &event.email);
        }
        if !event.emails.is_empty() {
            document.insert("emails", event.emails.clone());
        }
        if let Some(list_id) = &event.list_id {
            if let Ok(value) = bson::to_bson(list_id) {
                document.insert("list_id", value);
            }
        }
        if !event.reason.is_empty() {
            document.insert("reason", &event.reason);
        }

        document
    }

    fn event_from_document(document: &Document) -> WebhookEvent {
        WebhookEvent {
            webhook_id: document.get_str("webhook_id").unwrap_or_default().to_string(),
            webhook_type: document
                .get_str("webhook_type")
                .unwrap_or_default()
                .to_string(),
            tenant_id: document.get_str("tenant_id").unwrap_or_default().to_string(),
            event: document.get_str("event").unwrap_or_default().to_string(),
            campaign_name: document
                .get_str("campaign_name")
                .unwrap_or_default()
                .to_string(),
            campaign_id: document
                .get_str("campaign_id")
                .unwrap_or_default()
                .to_string(),
            tag_name: document.get_str("tag_name").unwrap_or_default().to_string(),
            date_event: document
                .get_str("date_event")
                .unwrap_or_default()
                .to_string(),
            timestamp: document.get_i64("ts").unwrap_or_default(),
            timestamp_event: document.get_i64("ts_event").unwrap_or_default(),
            email: document.get_str("email").unwrap_or_default().to_string(),
            emails: document
                .get_array("emails")
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|value| value.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default(),
            url: document.get_str("url").unwrap_or_default().to_string(),
            list_id: document
                .get("list_id")
                .and_then(|value| bson::from_bson(value.clone()).ok()),
            reason: document.get_str("reason").unwrap_or_default().to_string(),
            received_at: document
                .get_datetime("received_at")
                .ok()
                .and_then(|dt| DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis()))
                .unwrap_or_else(Utc::now),
            updated_at: document
                .get_datetime("updated_at")
                .ok()
                .and_then(|dt| DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())),
            retry_count: document.get_i64("retry_count").unwrap_or_default().max(0) as u32,
            status: document
                .get_str("status")
                .ok()
                .and_then(EventStatus::parse)
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl EventStore for MongoStore {
    async fn insert(&self, event: &WebhookEvent) -> StoreResult<()> {
        self.collection
            .insert_one(Self::document_for(event))
            .await
            .map_err(|e| {
                tracing::error!(
                    tenant_id = %event.tenant_id,
                    webhook_id = %event.webhook_id,
                    error = %e,
                    "failed to insert event"
                );
                StoreError::Write(e.to_string())
            })?;
        Ok(())
    }

    async fn update_status(
        &self,
        webhook_id: &str,
        status: EventStatus,
        retry_count: u32,
    ) -> StoreResult<u64> {
        let update = doc! {
            "$set": {
                "status": status.as_str(),
                "retry_count": i64::from(retry_count),
                "updated_at": bson::DateTime::now(),
            }
        };

        let result = self
            .collection
            .update_one(doc! { "webhook_id": webhook_id }, update)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(result.matched_count)
    }

    async fn get_failed(&self, tenant_id: &str) -> StoreResult<Vec<WebhookEvent>> {
        let filter = doc! {
            "tenant_id": tenant_id,
            "status": EventStatus::Failed.as_str(),
        };

        let mut cursor = self
            .collection
            .find(filter)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut events = Vec::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
        {
            events.push(Self::event_from_document(&document));
        }
        Ok(events)
    }
}
