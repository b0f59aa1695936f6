//! The webhook ingress endpoint.
//!
//! One route, three kinds of POST traffic: MailerCloud URL-validation
//! probes (always answered 200, never published), real MailerCloud
//! webhooks (attributed through the `Webhook-Id` registry, without an API
//! key, since the vendor never sends one), and direct API-key webhooks.
//! Everything else is a 401.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use event_broker::{BrokerMessage, EventBroker};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::debug::DebugCapture;
use crate::extract::event_from_payload;
use crate::metrics::Metrics;
use crate::models::metadata_headers;
use crate::rate_limit::QuotaLimiter;
use crate::registry::TenantRegistry;

pub const SERVICE_NAME: &str = "MailerCloud Webhook Relay";

/// The vendor's probe sends this literal string as the `Webhook-Id` value.
const VALIDATION_WEBHOOK_ID: &str = "WebhookID";
const VALIDATION_USER_AGENT: &str = "MailerCloud";
const DEFAULT_WEBHOOK_TYPE: &str = "email_event";

pub struct IngressState {
    pub registry: TenantRegistry,
    pub limiter: QuotaLimiter,
    pub broker: Arc<dyn EventBroker>,
    pub metrics: Metrics,
    pub api_key_header: String,
    pub debug: Option<DebugCapture>,
}

/// `GET /webhook`: reachability check used by the ESP before it saves a
/// webhook registration.
pub async fn readiness() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Webhook endpoint is ready",
        "service": SERVICE_NAME,
    }))
}

/// `POST /webhook`: classify, attribute, rate-limit, publish.
pub async fn receive(
    State(state): State<Arc<IngressState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Metrics::timer();

    let webhook_header = header_value(&headers, "Webhook-Id");
    let user_agent = header_value(&headers, "user-agent");

    let payload: Option<Map<String, Value>> = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|value| value.as_object().cloned());

    // Validation probes answer 200 regardless of body, and an empty or
    // test-only body is itself a probe
    let header_probe = webhook_header == Some(VALIDATION_WEBHOOK_ID)
        || user_agent == Some(VALIDATION_USER_AGENT);
    let body_probe = payload.as_ref().is_some_and(is_validation_payload);

    if header_probe || body_probe {
        tracing::info!(
            webhook_id = webhook_header.unwrap_or_default(),
            user_agent = user_agent.unwrap_or_default(),
            "handling MailerCloud validation request"
        );
        return (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "message": "Webhook validation successful",
                "service": SERVICE_NAME,
                "success": true,
            })),
        )
            .into_response();
    }

    // Attribution. MailerCloud authenticates by URL validation, not API
    // key, so a non-probe Webhook-Id header is trusted on its own.
    let tenant_id = match webhook_header {
        Some(webhook_id) => resolve_vendor_tenant(&state.registry, webhook_id),
        None => {
            let Some(api_key) = header_value(&headers, &state.api_key_header) else {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": "Missing API key"})),
                )
                    .into_response();
            };
            match state.registry.tenant_by_key(api_key) {
                Some(tenant_id) => tenant_id.to_string(),
                None => {
                    tracing::warn!(
                        api_key_prefix = api_key.get(..8).unwrap_or(api_key),
                        "invalid API key"
                    );
                    return (
                        StatusCode::UNAUTHORIZED,
                        Json(json!({"error": "Invalid API key"})),
                    )
                        .into_response();
                }
            }
        }
    };

    let Some(payload) = payload else {
        tracing::warn!(tenant_id = %tenant_id, "failed to parse webhook payload");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid JSON payload"})),
        )
            .into_response();
    };

    if !state.limiter.allow(&tenant_id) {
        state
            .metrics
            .rate_limit_exceeded_total
            .with_label_values(&[&tenant_id, "events"])
            .inc();
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "Rate limit exceeded"})),
        )
            .into_response();
    }

    let mut event = event_from_payload(&payload);
    event.tenant_id = tenant_id;
    event.webhook_type = header_value(&headers, "Webhook-Type")
        .unwrap_or(DEFAULT_WEBHOOK_TYPE)
        .to_string();

    if let Some(debug) = &state.debug {
        debug.record(&headers, &payload, &event);
    }

    state
        .metrics
        .webhook_received_total
        .with_label_values(&[&event.tenant_id, &event.event])
        .inc();

    let message = match serde_json::to_vec(&event) {
        Ok(payload) => BrokerMessage::new(payload).with_headers(metadata_headers(&event)),
        Err(e) => {
            tracing::error!(error = %e, "failed to marshal event");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to process event"})),
            )
                .into_response();
        }
    };

    // Synchronous publish: the 200 is only sent once the broker holds the
    // message. No in-process retry; the proxy upstream handles 500s.
    let publish_result = state.broker.publish(message).await;

    let status_label = if publish_result.is_ok() {
        "success"
    } else {
        "failed"
    };
    state
        .metrics
        .webhook_processed_total
        .with_label_values(&[&event.tenant_id, &event.event, status_label])
        .inc();
    if !event.event.is_empty() {
        state
            .metrics
            .webhook_processing_seconds
            .with_label_values(&[&event.tenant_id, &event.event])
            .observe(start.elapsed().as_secs_f64());
    }

    match publish_result {
        Ok(()) => {
            tracing::info!(
                webhook_id = %event.webhook_id,
                tenant_id = %event.tenant_id,
                event = %event.event,
                "event accepted"
            );
            (
                StatusCode::OK,
                Json(json!({
                    "message": "Event accepted",
                    "webhook_id": event.webhook_id,
                    "tenant_id": event.tenant_id,
                })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(
                webhook_id = %event.webhook_id,
                tenant_id = %event.tenant_id,
                error = %e,
                "failed to publish event"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to process event"})),
            )
                .into_response()
        }
    }
}

/// Empty object, or an object whose only member is `test`.
fn is_validation_payload(payload: &Map<String, Value>) -> bool {
    payload.is_empty() || (payload.len() == 1 && payload.contains_key("test"))
}

/// Vendor-flow attribution: registry binding first, then the raw webhook
/// id itself, then the anonymous fallback.
fn resolve_vendor_tenant(registry: &TenantRegistry, webhook_id: &str) -> String {
    if webhook_id.is_empty() {
        return "unknown".to_string();
    }
    match registry.tenant_by_webhook(webhook_id) {
        Some(tenant_id) => tenant_id.to_string(),
        None => {
            tracing::warn!(
                webhook_id,
                "webhook id not found in registry, falling back to webhook id"
            );
            webhook_id.to_string()
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
