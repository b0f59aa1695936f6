use event_broker::{AmqpBroker, EventBroker};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use webhook_relay::config::Config;
use webhook_relay::metrics::Metrics;
use webhook_relay::shutdown_signal;
use webhook_relay::storage::MongoStore;
use webhook_relay::worker::Worker;

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

    tracing::info!("starting webhook worker");

    // Same topology declaration as the ingress; whichever process starts
    // first creates it
    let broker = Arc::new(
        AmqpBroker::connect(&config.amqp_url, &config.amqp_exchange, &config.amqp_queue).await?,
    );

    let store = Arc::new(
        MongoStore::connect(
            &config.mongodb_uri,
            &config.mongodb_database,
            &config.mongodb_collection,
        )
        .await?,
    );

    let worker = Worker::new(broker.clone(), store, Metrics::new()).with_retry_policy(
        config.worker_max_retries,
        Duration::from_secs(config.worker_base_delay_secs),
    );

    tracing::info!(
        max_retries = config.worker_max_retries,
        base_delay_secs = config.worker_base_delay_secs,
        "worker consuming"
    );

    // Runs until SIGINT/SIGTERM; the in-flight delivery is finished first
    worker.run(shutdown_signal()).await?;

    if let Err(e) = broker.close().await {
        tracing::warn!(error = %e, "failed to close broker connection");
    }

    tracing::info!("worker stopped");
    Ok(())
}
