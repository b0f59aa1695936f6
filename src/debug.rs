//! Diagnostic capture of raw webhook traffic.
//!
//! Enabled with `WEBHOOK_DEBUG=true`: every inbound payload is mirrored to
//! a timestamped dump file and the extracted fields are logged. Payload
//! handling is otherwise unchanged.

use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::path::PathBuf;

use crate::models::WebhookEvent;

#[derive(Debug, Clone)]
pub struct DebugCapture {
    dir: PathBuf,
}

impl DebugCapture {
    /// Enabled only when `WEBHOOK_DEBUG` is exactly `"true"`.
    pub fn from_env() -> Option<Self> {
        match std::env::var("WEBHOOK_DEBUG") {
            Ok(value) if value == "true" => {
                tracing::info!("webhook debug capture enabled");
                Some(Self::new("."))
            }
            _ => None,
        }
    }

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record(&self, headers: &HeaderMap, payload: &Map<String, Value>, event: &WebhookEvent) {
        let header_map: Map<String, Value> = headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Value::String(value.to_str().unwrap_or("<binary>").to_string()),
                )
            })
            .collect();

        let snapshot = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "headers": header_map,
            "body": payload,
        });

        let path = self.dir.join(format!(
            "raw_webhook_data_{}.json",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));

        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::error!(path = %path.display(), error = %e, "failed to write debug dump");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode debug dump"),
        }

        tracing::info!(
            webhook_id = %event.webhook_id,
            tenant_id = %event.tenant_id,
            event = %event.event,
            email = %event.email,
            campaign_id = %event.campaign_id,
            "captured webhook payload"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_writes_dump_file() {
        let dir = std::env::temp_dir().join(format!(
            "webhook-debug-test-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let capture = DebugCapture::new(&dir);
        let payload = serde_json::json!({"event": "delivered"})
            .as_object()
            .cloned()
            .unwrap();

        capture.record(&HeaderMap::new(), &payload, &WebhookEvent::default());

        let dumps: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(dumps.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
