use axum::body::{Body, Bytes};
use axum::http::{Request, Response};
use axum::Router;
use event_broker::InMemoryBroker;
use http_body_util::BodyExt;
use std::sync::Arc;

use webhook_relay::debug::DebugCapture;
use webhook_relay::metrics::Metrics;
use webhook_relay::rate_limit::QuotaLimiter;
use webhook_relay::registry::TenantRegistry;
use webhook_relay::routes;
use webhook_relay::IngressState;

/// Registered fixtures: tenant `t1` owns webhook `abc123`, tenant `acme`
/// authenticates with `key-acme`.
pub const BOUND_WEBHOOK_ID: &str = "abc123";
pub const BOUND_TENANT: &str = "t1";
pub const API_KEY_TENANT: &str = "acme";
pub const API_KEY: &str = "key-acme";

pub struct TestApp {
    pub router: Router,
    pub broker: Arc<InMemoryBroker>,
}

/// Standard fixture registry.
pub fn registry() -> TenantRegistry {
    let mut registry = TenantRegistry::new();
    registry.bind_key(API_KEY_TENANT.to_string(), API_KEY.to_string());
    registry.bind_webhook(BOUND_WEBHOOK_ID.to_string(), BOUND_TENANT.to_string());
    registry
}

pub fn app() -> TestApp {
    app_with(registry(), QuotaLimiter::new(), None)
}

pub fn app_with(
    registry: TenantRegistry,
    limiter: QuotaLimiter,
    debug: Option<DebugCapture>,
) -> TestApp {
    let broker = Arc::new(InMemoryBroker::new());
    let state = Arc::new(IngressState {
        registry,
        limiter,
        broker: broker.clone(),
        metrics: Metrics::new(),
        api_key_header: "X-API-Key".to_string(),
        debug,
    });

    TestApp {
        router: routes::router(state),
        broker,
    }
}

/// POST /webhook with a JSON body and the given extra headers.
pub fn post_webhook(body: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

/// Read a response body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).expect("response body must be JSON")
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}
