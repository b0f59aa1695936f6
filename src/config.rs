use std::env;

use crate::registry::DEFAULT_API_URL;

/// Runtime configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub app_port: u16,
    pub prometheus_port: u16,
    pub log_level: String,

    pub mongodb_uri: String,
    pub mongodb_database: String,
    pub mongodb_collection: String,

    pub amqp_url: String,
    pub amqp_exchange: String,
    pub amqp_queue: String,

    pub api_key_header: String,
    pub mailercloud_api_url: String,

    pub worker_max_retries: u32,
    pub worker_base_delay_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let app_port: u16 = env::var("APP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| "APP_PORT must be a valid u16".to_string())?;

        let prometheus_port: u16 = env::var("PROMETHEUS_PORT")
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|_| "PROMETHEUS_PORT must be a valid u16".to_string())?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let mongodb_uri = env::var("MONGODB_URI")
            .map_err(|_| "MONGODB_URI must be set".to_string())?;
        let mongodb_database =
            env::var("MONGODB_DATABASE").unwrap_or_else(|_| "webhooks".to_string());
        let mongodb_collection =
            env::var("MONGODB_COLLECTION").unwrap_or_else(|_| "events".to_string());

        // CLOUDAMQP_URL is the hosted-broker convention; RABBITMQ_URI the
        // self-hosted one
        let amqp_url = env::var("CLOUDAMQP_URL")
            .or_else(|_| env::var("RABBITMQ_URI"))
            .map_err(|_| "CLOUDAMQP_URL or RABBITMQ_URI must be set".to_string())?;
        let amqp_exchange =
            env::var("RABBITMQ_EXCHANGE").unwrap_or_else(|_| "webhook_events".to_string());
        let amqp_queue =
            env::var("RABBITMQ_QUEUE").unwrap_or_else(|_| "webhook_queue".to_string());

        let api_key_header =
            env::var("API_KEY_HEADER").unwrap_or_else(|_| "X-API-Key".to_string());
        let mailercloud_api_url =
            env::var("MAILERCLOUD_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());

        let worker_max_retries: u32 = env::var("WORKER_MAX_RETRIES")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|_| "WORKER_MAX_RETRIES must be a non-negative integer".to_string())?;

        let worker_base_delay_secs: u64 = env::var("WORKER_BASE_DELAY_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| "WORKER_BASE_DELAY_SECS must be a number of seconds".to_string())?;

        Ok(Config {
            app_port,
            prometheus_port,
            log_level,
            mongodb_uri,
            mongodb_database,
            mongodb_collection,
            amqp_url,
            amqp_exchange,
            amqp_queue,
            api_key_header,
            mailercloud_api_url,
            worker_max_retries,
            worker_base_delay_secs,
        })
    }
}
