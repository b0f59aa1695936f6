use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub webhook_received_total: IntCounterVec,
    pub webhook_processed_total: IntCounterVec,
    pub webhook_retries_total: IntCounterVec,
    pub rate_limit_exceeded_total: IntCounterVec,

    // Histograms
    pub webhook_processing_seconds: HistogramVec,
    pub http_request_duration_seconds: HistogramVec,

    // Gauges
    pub webhook_queue_size: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let webhook_received_total = IntCounterVec::new(
            Opts::new(
                "webhook_events_received_total",
                "Total webhook events received",
            ),
            &["tenant_id", "event_type"],
        )
        .expect("metric");

        let webhook_processed_total = IntCounterVec::new(
            Opts::new(
                "webhook_events_processed_total",
                "Total webhook events processed",
            ),
            &["tenant_id", "event_type", "status"], // status: success|failed
        )
        .expect("metric");

        let webhook_retries_total = IntCounterVec::new(
            Opts::new("webhook_retries_total", "Total webhook event retries"),
            &["tenant_id", "event_type"],
        )
        .expect("metric");

        let rate_limit_exceeded_total = IntCounterVec::new(
            Opts::new(
                "webhook_rate_limit_exceeded_total",
                "Requests rejected by the per-tenant rate limiter",
            ),
            &["tenant_id", "limit_type"],
        )
        .expect("metric");

        let webhook_processing_seconds = HistogramVec::new(
            HistogramOpts::new(
                "webhook_processing_duration_seconds",
                "Time taken to process webhook events",
            ),
            &["tenant_id", "event_type"],
        )
        .expect("metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration seconds",
            ),
            &["path", "method", "status"],
        )
        .expect("metric");

        let webhook_queue_size = IntGaugeVec::new(
            Opts::new(
                "webhook_queue_size",
                "Current depth of the webhook processing queue",
            ),
            &["queue"],
        )
        .expect("metric");

        registry
            .register(Box::new(webhook_received_total.clone()))
            .unwrap();
        registry
            .register(Box::new(webhook_processed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(webhook_retries_total.clone()))
            .unwrap();
        registry
            .register(Box::new(rate_limit_exceeded_total.clone()))
            .unwrap();
        registry
            .register(Box::new(webhook_processing_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(webhook_queue_size.clone()))
            .unwrap();

        Self {
            registry,
            webhook_received_total,
            webhook_processed_total,
            webhook_retries_total,
            rate_limit_exceeded_total,
            webhook_processing_seconds,
            http_request_duration_seconds,
            webhook_queue_size,
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }

    pub fn timer() -> Instant {
        Instant::now()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
