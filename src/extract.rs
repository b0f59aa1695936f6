//! Vendor payload normalization.
//!
//! MailerCloud payloads are loosely shaped: several fields arrive under
//! more than one name depending on the event type, and not every delivery
//! carries a usable identifier. This module maps a raw JSON object onto a
//! [`WebhookEvent`] and assigns a stable `webhook_id`.

use chrono::Utc;
use serde_json::{Map, Value};

use crate::models::{ListId, WebhookEvent};

/// Identifier fields honored verbatim, in priority order.
const ID_FIELDS: [&str; 5] = [
    "webhook_id",
    "message_id",
    "event_id",
    "delivery_id",
    "tracking_id",
];

/// Build a [`WebhookEvent`] from a vendor payload.
///
/// Attribution metadata (`tenant_id`, `webhook_type`) is left for the
/// caller; unknown payload fields are discarded.
pub fn event_from_payload(payload: &Map<String, Value>) -> WebhookEvent {
    let mut event = WebhookEvent {
        webhook_id: assign_webhook_id(payload),
        ..Default::default()
    };

    if let Some(value) = string_field(payload, "event") {
        event.event = value;
    }

    // Field name variations; first non-empty wins
    if let Some(value) = first_string_field(payload, &["campaign_name", "campaign name"]) {
        event.campaign_name = value;
    }
    if let Some(value) = first_string_field(payload, &["campaign_id", "camp_id"]) {
        event.campaign_id = value;
    }
    if let Some(value) = first_string_field(payload, &["tag_name", "tag"]) {
        event.tag_name = value;
    }
    if let Some(value) = first_string_field(payload, &["URL", "url", "click_url"]) {
        event.url = value;
    }

    if let Some(value) = string_field(payload, "date_event") {
        event.date_event = value;
    }
    if let Some(value) = string_field(payload, "reason") {
        event.reason = value;
    }
    if let Some(value) = string_field(payload, "email") {
        event.email = value;
    }

    if let Some(ts) = numeric_field(payload, "ts") {
        event.timestamp = ts;
    }
    if let Some(ts) = numeric_field(payload, "ts_event") {
        event.timestamp_event = ts;
    }

    // Bulk events carry a list of addresses; non-strings are dropped
    if let Some(values) = payload.get("emails").and_then(Value::as_array) {
        event.emails = values
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect();
    }

    // list_id is polymorphic (string, number, or list); kept as received
    if let Some(value) = payload.get("list_id") {
        event.list_id = list_id_from_value(value);
    }

    event
}

/// Assign a stable identity to a delivery.
///
/// Preference order: a vendor-supplied identifier verbatim, then a
/// composite of the distinguishing fields, then a timestamp so every
/// delivery gets *some* id.
pub fn assign_webhook_id(payload: &Map<String, Value>) -> String {
    for field in ID_FIELDS {
        if let Some(id) = string_field(payload, field) {
            return id;
        }
    }

    let mut components: Vec<String> = Vec::new();
    if let Some(value) = string_field(payload, "campaign_id") {
        components.push(value);
    }
    if let Some(value) = string_field(payload, "email") {
        components.push(value);
    }
    if let Some(ts) = payload.get("ts").and_then(Value::as_f64) {
        components.push(format!("{}", ts.floor() as i64));
    }
    if let Some(value) = string_field(payload, "event") {
        components.push(value);
    }

    if !components.is_empty() {
        // Each component hex-encoded individually, space-separated inside
        // brackets: the rendering a slice of strings gets from a %x-style
        // formatter, kept so ids stay stable across rollouts
        let encoded: Vec<String> = components.iter().map(hex::encode).collect();
        return format!("mc_[{}]", encoded.join(" "));
    }

    format!(
        "mc_{}",
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

fn string_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn first_string_field(payload: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| string_field(payload, key))
}

fn numeric_field(payload: &Map<String, Value>, key: &str) -> Option<i64> {
    payload.get(key).and_then(Value::as_f64).map(|v| v as i64)
}

fn list_id_from_value(value: &Value) -> Option<ListId> {
    match value {
        Value::String(s) => Some(ListId::Text(s.clone())),
        Value::Number(n) => Some(ListId::Number(n.clone())),
        Value::Array(items) => Some(ListId::Many(
            items.iter().filter_map(list_id_from_value).collect(),
        )),
        _ => None,
    }
}
