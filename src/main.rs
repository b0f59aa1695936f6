use axum::Router;
use event_broker::{AmqpBroker, EventBroker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use webhook_relay::config::Config;
use webhook_relay::debug::DebugCapture;
use webhook_relay::metrics::Metrics;
use webhook_relay::rate_limit::QuotaLimiter;
use webhook_relay::registry::TenantRegistry;
use webhook_relay::routes;
use webhook_relay::{shutdown_signal, IngressState};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const QUEUE_PROBE_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    tracing::info!("starting webhook ingress");

    // Broker (fail-fast); declares the exchange/queue topology
    let broker = Arc::new(
        AmqpBroker::connect(&config.amqp_url, &config.amqp_exchange, &config.amqp_queue).await?,
    );

    // Tenant registry: env bindings plus the ESP webhook listing. Sync
    // failures are logged per tenant and the ingress falls back to the
    // raw webhook id at attribution time.
    let mut registry = TenantRegistry::from_env();
    let bound = registry.sync_bindings(&config.mailercloud_api_url).await;
    let stats = registry.stats();
    tracing::info!(
        tenants = stats.tenants,
        webhooks = stats.webhooks,
        bound,
        "tenant registry loaded"
    );

    let metrics = Metrics::new();

    let state = Arc::new(IngressState {
        registry,
        limiter: QuotaLimiter::new(),
        broker: broker.clone(),
        metrics: metrics.clone(),
        api_key_header: config.api_key_header.clone(),
        debug: DebugCapture::from_env(),
    });

    // Standalone metrics listener for Prometheus scrapes
    let metrics_app = routes::metrics_router(metrics.clone());
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.prometheus_port));
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(metrics_addr).await {
            Ok(listener) => {
                tracing::info!(addr = %metrics_addr, "metrics server listening");
                if let Err(e) = axum::serve(listener, metrics_app).await {
                    tracing::error!(error = %e, "metrics server error");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to bind metrics server"),
        }
    });

    // Periodic queue depth probe
    let probe_broker = broker.clone();
    let probe_metrics = metrics.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(QUEUE_PROBE_INTERVAL);
        loop {
            ticker.tick().await;
            match probe_broker.queue_depth().await {
                Ok(depth) => probe_metrics
                    .webhook_queue_size
                    .with_label_values(&["all"])
                    .set(depth as i64),
                Err(e) => tracing::warn!(error = %e, "failed to inspect queue depth"),
            }
        }
    });

    let app: Router = routes::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.app_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "webhook ingress listening");

    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                drain_rx.await.ok();
            })
            .await
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight requests");

    let _ = drain_tx.send(());
    match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!("drain window elapsed before all requests completed"),
    }

    if let Err(e) = broker.close().await {
        tracing::warn!(error = %e, "failed to close broker connection");
    }

    tracing::info!("shutdown complete");
    Ok(())
}
