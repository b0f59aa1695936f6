pub mod health;
pub mod metrics;
pub mod webhook;

use axum::http::Method;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics::Metrics;
use crate::middleware::metrics::{track_http_metrics, MetricsMiddlewareState};
use webhook::IngressState;

/// Assemble the full ingress application.
pub fn router(state: Arc<IngressState>) -> Router {
    let middleware_state = Arc::new(MetricsMiddlewareState {
        metrics: state.metrics.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let health_router = Router::new().route("/health", get(health::health));

    let webhook_router = Router::new()
        .route("/webhook", get(webhook::readiness).post(webhook::receive))
        .with_state(state.clone());

    Router::new()
        .merge(health_router)
        .merge(metrics_router(state.metrics.clone()))
        .merge(webhook_router)
        // request duration metrics
        .layer(from_fn_with_state(middleware_state, track_http_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// The `/metrics` scrape surface; also served standalone on the
/// Prometheus port.
pub fn metrics_router(metrics: Metrics) -> Router {
    let metrics_state = Arc::new(metrics::MetricsState { metrics });
    Router::new()
        .route("/metrics", get(metrics::metrics))
        .with_state(metrics_state)
}
