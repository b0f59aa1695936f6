//! Durable event storage.
//!
//! The worker talks to storage through the [`EventStore`] trait so tests
//! can run against [`InMemoryStore`] while production uses [`MongoStore`].

mod memory;
mod mongo;

pub use memory::InMemoryStore;
pub use mongo::MongoStore;

use async_trait::async_trait;

use crate::models::{EventStatus, WebhookEvent};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage connection error: {0}")]
    Connection(String),

    #[error("storage write error: {0}")]
    Write(String),

    #[error("storage query error: {0}")]
    Query(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event. Only fields with a value are written; empty
    /// strings, empty lists and an absent `list_id` are omitted.
    async fn insert(&self, event: &WebhookEvent) -> StoreResult<()>;

    /// Update the processing state of the event(s) with this `webhook_id`,
    /// stamping `updated_at`. Duplicate ids are tolerated. Returns the
    /// number of documents matched; zero means nothing was ever inserted
    /// under that id and no record was written.
    async fn update_status(
        &self,
        webhook_id: &str,
        status: EventStatus,
        retry_count: u32,
    ) -> StoreResult<u64>;

    /// Fetch a tenant's dead-lettered events for operational replay.
    async fn get_failed(&self, tenant_id: &str) -> StoreResult<Vec<WebhookEvent>>;
}
