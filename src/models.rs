use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle states of a stored webhook event.
///
/// Transitions move forward from `Pending`; only `Retrying` may go back to
/// an earlier state. `Processed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Pending,
    Processed,
    Failed,
    Retrying,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
            EventStatus::Retrying => "retrying",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EventStatus::Pending),
            "processed" => Some(EventStatus::Processed),
            "failed" => Some(EventStatus::Failed),
            "retrying" => Some(EventStatus::Retrying),
            _ => None,
        }
    }
}

/// `list_id` arrives as a string, a number, or a list of either (seen on
/// unsubscribe events); it is carried and stored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListId {
    Text(String),
    Number(serde_json::Number),
    Many(Vec<ListId>),
}

/// A single email event delivered by the ESP.
///
/// Wire names mirror the vendor payload (`ts`, `ts_event`, `URL`); metadata
/// fields (`tenant_id`, `received_at`, `retry_count`, `status`) are set by
/// the pipeline, never by the vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub webhook_id: String,
    #[serde(default)]
    pub webhook_type: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub event: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub campaign_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub campaign_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub date_event: String,
    #[serde(default, rename = "ts")]
    pub timestamp: i64,
    #[serde(default, rename = "ts_event")]
    pub timestamp_event: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,
    #[serde(default, rename = "URL", alias = "url", skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<ListId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub status: EventStatus,
}

impl Default for WebhookEvent {
    fn default() -> Self {
        Self {
            webhook_id: String::new(),
            webhook_type: String::new(),
            tenant_id: String::new(),
            event: String::new(),
            campaign_name: String::new(),
            campaign_id: String::new(),
            tag_name: String::new(),
            date_event: String::new(),
            timestamp: 0,
            timestamp_event: 0,
            email: String::new(),
            emails: Vec::new(),
            url: String::new(),
            list_id: None,
            reason: String::new(),
            received_at: Utc::now(),
            updated_at: None,
            retry_count: 0,
            status: EventStatus::Pending,
        }
    }
}

/// Broker metadata headers duplicated out of the payload so the worker can
/// route without decoding the body. The ingress-set values are
/// authoritative over whatever the body carries.
pub fn metadata_headers(event: &WebhookEvent) -> HashMap<String, String> {
    HashMap::from([
        ("webhook_id".to_string(), event.webhook_id.clone()),
        ("webhook_type".to_string(), event.webhook_type.clone()),
        ("tenant_id".to_string(), event.tenant_id.clone()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trip() {
        for status in [
            EventStatus::Pending,
            EventStatus::Processed,
            EventStatus::Failed,
            EventStatus::Retrying,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventStatus::parse("bogus"), None);
    }

    #[test]
    fn test_event_decodes_vendor_payload() {
        let payload = json!({
            "event": "clicked",
            "campaign_id": "c1",
            "email": "a@b.test",
            "ts": 1_700_000_000,
            "URL": "https://example.test/offer"
        });

        let event: WebhookEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.event, "clicked");
        assert_eq!(event.timestamp, 1_700_000_000);
        assert_eq!(event.url, "https://example.test/offer");
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, 0);
    }

    #[test]
    fn test_list_id_shapes_pass_through() {
        let scalar: ListId = serde_json::from_value(json!("list-9")).unwrap();
        assert_eq!(scalar, ListId::Text("list-9".to_string()));

        let number: ListId = serde_json::from_value(json!(42)).unwrap();
        assert!(matches!(number, ListId::Number(_)));

        let many: ListId = serde_json::from_value(json!(["a", 1])).unwrap();
        match many {
            ListId::Many(items) => assert_eq!(items.len(), 2),
            other => panic!("expected sequence, got {other:?}"),
        }

        // Stored shape mirrors the received shape
        let round = serde_json::to_value(ListId::Many(vec![
            ListId::Text("a".to_string()),
        ]))
        .unwrap();
        assert_eq!(round, json!(["a"]));
    }

    #[test]
    fn test_empty_optionals_are_omitted_from_wire() {
        let event = WebhookEvent {
            webhook_id: "wh_1".to_string(),
            tenant_id: "acme".to_string(),
            event: "delivered".to_string(),
            ..Default::default()
        };

        let value = serde_json::to_value(&event).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("email"));
        assert!(!object.contains_key("emails"));
        assert!(!object.contains_key("URL"));
        assert!(!object.contains_key("list_id"));
        assert!(!object.contains_key("reason"));
        assert!(object.contains_key("retry_count"));
    }

    #[test]
    fn test_metadata_headers_duplicate_identity() {
        let event = WebhookEvent {
            webhook_id: "wh_1".to_string(),
            webhook_type: "email_event".to_string(),
            tenant_id: "acme".to_string(),
            ..Default::default()
        };

        let headers = metadata_headers(&event);
        assert_eq!(headers.get("webhook_id").map(String::as_str), Some("wh_1"));
        assert_eq!(
            headers.get("webhook_type").map(String::as_str),
            Some("email_event")
        );
        assert_eq!(headers.get("tenant_id").map(String::as_str), Some("acme"));
    }
}
