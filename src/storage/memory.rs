use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use super::{EventStore, StoreError, StoreResult};
use crate::models::{EventStatus, WebhookEvent};

/// In-memory EventStore for tests and local development.
///
/// Supports injecting insert failures so the worker's retry path can be
/// exercised without a real database.
#[derive(Default)]
pub struct InMemoryStore {
    events: Mutex<Vec<WebhookEvent>>,
    failing_inserts: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` insert calls fail with a write error.
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<WebhookEvent> {
        self.events
            .lock()
            .expect("in-memory store mutex poisoned")
            .clone()
    }

    pub fn find(&self, webhook_id: &str) -> Option<WebhookEvent> {
        self.events()
            .into_iter()
            .find(|event| event.webhook_id == webhook_id)
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert(&self, event: &WebhookEvent) -> StoreResult<()> {
        let remaining = self.failing_inserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_inserts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Write("injected insert failure".to_string()));
        }

        self.events
            .lock()
            .expect("in-memory store mutex poisoned")
            .push(event.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        webhook_id: &str,
        status: EventStatus,
        retry_count: u32,
    ) -> StoreResult<u64> {
        let mut events = self.events.lock().expect("in-memory store mutex poisoned");

        match events
            .iter_mut()
            .find(|event| event.webhook_id == webhook_id)
        {
            Some(event) => {
                event.status = status;
                event.retry_count = retry_count;
                event.updated_at = Some(Utc::now());
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn get_failed(&self, tenant_id: &str) -> StoreResult<Vec<WebhookEvent>> {
        Ok(self
            .events()
            .into_iter()
            .filter(|event| event.tenant_id == tenant_id && event.status == EventStatus::Failed)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(webhook_id: &str, tenant_id: &str) -> WebhookEvent {
        WebhookEvent {
            webhook_id: webhook_id.to_string(),
            tenant_id: tenant_id.to_string(),
            event: "delivered".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_and_update() {
        let store = InMemoryStore::new();
        store.insert(&event("wh_1", "acme")).await.unwrap();

        store
            .update_status("wh_1", EventStatus::Processed, 0)
            .await
            .unwrap();

        let stored = store.find("wh_1").unwrap();
        assert_eq!(stored.status, EventStatus::Processed);
        assert!(stored.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = InMemoryStore::new();
        store.fail_next_inserts(2);

        assert!(store.insert(&event("wh_1", "acme")).await.is_err());
        assert!(store.insert(&event("wh_1", "acme")).await.is_err());
        assert!(store.insert(&event("wh_1", "acme")).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_without_insert_is_a_noop() {
        let store = InMemoryStore::new();
        let matched = store
            .update_status("ghost", EventStatus::Failed, 3)
            .await
            .unwrap();

        assert_eq!(matched, 0);
        assert!(store.find("ghost").is_none());
    }

    #[tokio::test]
    async fn test_get_failed_filters_by_tenant_and_status() {
        let store = InMemoryStore::new();

        let mut failed = event("wh_1", "acme");
        failed.status = EventStatus::Failed;
        store.insert(&failed).await.unwrap();

        store.insert(&event("wh_2", "acme")).await.unwrap();

        let mut other_tenant = event("wh_3", "globex");
        other_tenant.status = EventStatus::Failed;
        store.insert(&other_tenant).await.unwrap();

        let failed_events = store.get_failed("acme").await.unwrap();
        assert_eq!(failed_events.len(), 1);
        assert_eq!(failed_events[0].webhook_id, "wh_1");
    }
}
