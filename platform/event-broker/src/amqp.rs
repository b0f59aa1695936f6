//! AMQP implementation of the EventBroker trait

use crate::{
    Acknowledger, BrokerError, BrokerMessage, BrokerResult, Delivery, EventBroker,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::HashMap;
use std::time::Duration;

const PUBLISH_TIMEOUT_SECS: u64 = 5;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// EventBroker implementation over AMQP.
///
/// Declares a durable direct exchange bound to a durable queue with an
/// empty routing key; the declaration is idempotent, so publisher and
/// consumer processes can both run it at startup. Messages are published
/// persistent with publisher confirms, bounded by a 5-second timeout.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    exchange: String,
    queue: String,
}

impl AmqpBroker {
    /// Connect and declare the exchange/queue topology.
    pub async fn connect(url: &str, exchange: &str, queue: &str) -> BrokerResult<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        // Publisher confirms, so publish() can report broker acceptance
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConnectionError(format!("declare exchange: {e}")))?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConnectionError(format!("declare queue: {e}")))?;

        channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConnectionError(format!("bind queue: {e}")))?;

        tracing::info!(exchange, queue, "AMQP topology declared");

        Ok(Self {
            connection,
            channel,
            exchange: exchange.to_string(),
            queue: queue.to_string(),
        })
    }

    fn header_table(headers: &HashMap<String, String>) -> FieldTable {
        let mut table = FieldTable::default();
        for (name, value) in headers {
            table.insert(
                name.as_str().into(),
                AMQPValue::LongString(value.as_str().into()),
            );
        }
        table
    }

    fn header_map(table: &FieldTable) -> HashMap<String, String> {
        table
            .inner()
            .iter()
            .filter_map(|(name, value)| match value {
                AMQPValue::LongString(s) => Some((
                    name.as_str().to_string(),
                    String::from_utf8_lossy(s.as_bytes()).into_owned(),
                )),
                AMQPValue::ShortString(s) => {
                    Some((name.as_str().to_string(), s.as_str().to_string()))
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventBroker for AmqpBroker {
    async fn publish(&self, message: BrokerMessage) -> BrokerResult<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_headers(Self::header_table(&message.headers));

        let publish = async {
            let confirm = self
                .channel
                .basic_publish(
                    &self.exchange,
                    "",
                    BasicPublishOptions::default(),
                    &message.payload,
                    properties,
                )
                .await
                .map_err(|e| BrokerError::PublishError(e.to_string()))?
                .await
                .map_err(|e| BrokerError::PublishError(e.to_string()))?;

            match confirm {
                Confirmation::NotRequested | Confirmation::Ack(_) => Ok(()),
                Confirmation::Nack(_) => Err(BrokerError::PublishError(
                    "broker refused the message".to_string(),
                )),
            }
        };

        tokio::time::timeout(Duration::from_secs(PUBLISH_TIMEOUT_SECS), publish)
            .await
            .map_err(|_| BrokerError::PublishTimeout(PUBLISH_TIMEOUT_SECS))?
    }

    async fn consume(&self) -> BrokerResult<BoxStream<'static, Delivery>> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConsumeError(e.to_string()))?;

        let stream = consumer.filter_map(|delivery| async move {
            match delivery {
                Ok(delivery) => {
                    let headers = delivery
                        .properties
                        .headers()
                        .as_ref()
                        .map(Self::header_map)
                        .unwrap_or_default();

                    Some(Delivery::new(
                        delivery.data,
                        headers,
                        delivery.redelivered,
                        Box::new(AmqpAcker {
                            acker: delivery.acker,
                        }),
                    ))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "AMQP consumer stream error, skipping delivery");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn queue_depth(&self) -> BrokerResult<u64> {
        // Passive declare re-reads the queue without changing it
        let queue = self
            .channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: true,
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::QueueError(e.to_string()))?;

        Ok(u64::from(queue.message_count()))
    }

    async fn close(&self) -> BrokerResult<()> {
        if let Err(e) = self.channel.close(200, "shutting down").await {
            tracing::warn!(error = %e, "failed to close AMQP channel");
        }
        self.connection
            .close(200, "shutting down")
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> BrokerResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::AckError(e.to_string()))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> BrokerResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::AckError(e.to_string()))
    }
}
