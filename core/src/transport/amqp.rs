//! AMQP 0.9.1 (RabbitMQ) adapter built on lapin.
//!
//! Publishes persistent JSON messages to the configured exchange (or the
//! default exchange, routed by queue name) and consumes the configured queue.
//! Deliveries are acked once handed to the channel; deliveries that are not
//! valid envelopes are rejected without requeue.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel as AmqpChannel, Connection, ConnectionProperties, ExchangeKind};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, Inbound};
use super::options::AmqpOptions;
use crate::envelope;
use crate::{BusError, Envelope, Result};

const CONTENT_TYPE: &str = "application/json";
const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    options: AmqpOptions,
    connection: Option<Connection>,
    channel: Option<AmqpChannel>,
    consumer_tag: Option<String>,
    reader: Option<JoinHandle<()>>,
}

impl AmqpBroker {
    pub fn new(options: AmqpOptions) -> Self {
        Self {
            options,
            connection: None,
            channel: None,
            consumer_tag: None,
            reader: None,
        }
    }

    async fn open_connection(&self) -> Result<Connection> {
        let mut last_error = String::from("no AMQP urls configured");
        for url in &self.options.urls {
            match Connection::connect(url, ConnectionProperties::default()).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(target: "busline::transport", broker = "rabbitmq", url = %url, error = %e, "Connection attempt failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(BusError::Connect(last_error))
    }

    async fn declare(&self, channel: &AmqpChannel) -> std::result::Result<(), lapin::Error> {
        let opts = &self.options;
        if opts.prefetch_count > 0 {
            channel
                .basic_qos(
                    opts.prefetch_count,
                    BasicQosOptions {
                        global: opts.global_prefetch,
                    },
                )
                .await?;
        }
        if !opts.exchange.is_empty() {
            channel
                .exchange_declare(
                    &opts.exchange,
                    exchange_kind(&opts.exchange_type),
                    ExchangeDeclareOptions {
                        durable: opts.durable,
                        auto_delete: opts.auto_delete,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        if opts.no_assert {
            return Ok(());
        }
        channel
            .queue_declare(
                &opts.queue,
                QueueDeclareOptions {
                    durable: opts.durable,
                    auto_delete: opts.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        if !opts.exchange.is_empty() {
            channel
                .queue_bind(
                    &opts.queue,
                    &opts.exchange,
                    opts.routing_key(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(())
    }

    // Default exchange routes by queue name
    fn route<'a>(&'a self, envelope: &'a Envelope) -> (&'a str, &'a str) {
        let opts = &self.options;
        if opts.exchange.is_empty() {
            ("", opts.queue.as_str())
        } else if opts.wildcards {
            (opts.exchange.as_str(), envelope.r#type.as_str())
        } else {
            (opts.exchange.as_str(), opts.routing_key())
        }
    }

    fn properties(&self, envelope: &Envelope) -> BasicProperties {
        let mut headers = FieldTable::default();
        for (key, value) in &self.options.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        headers.insert(
            ShortString::from("event-type"),
            AMQPValue::LongString(LongString::from(envelope.r#type.clone())),
        );
        if let Some(id) = &envelope.correlation_id {
            headers.insert(
                ShortString::from("correlation-id"),
                AMQPValue::LongString(LongString::from(id.clone())),
            );
        }
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(CONTENT_TYPE))
            .with_headers(headers)
            .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64);
        if self.options.persistent {
            props = props.with_delivery_mode(PERSISTENT);
        }
        if let Some(id) = &envelope.correlation_id {
            props = props.with_correlation_id(ShortString::from(id.clone()));
        }
        props
    }
}

fn exchange_kind(name: &str) -> ExchangeKind {
    match name {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    fn connect_timeout(&self) -> Option<Duration> {
        Some(self.options.timeout())
    }

    async fn connect(&mut self, inbound: Inbound) -> Result<()> {
        let connection = timeout(self.options.timeout(), self.open_connection())
            .await
            .map_err(|_| BusError::Connect("RabbitMQ connection timeout".to_string()))??;

        let on_error = inbound.clone();
        connection.on_error(move |err| {
            error!(target: "busline::transport", broker = "rabbitmq", error = %err, "Connection error");
            on_error.connection_lost(err.to_string());
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        self.declare(&channel)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let mut consumer = channel
            .basic_consume(
                &self.options.queue,
                &self.options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: self.options.no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        info!(target: "busline::transport", broker = "rabbitmq", queue = %self.options.queue, "Consuming");

        self.consumer_tag = Some(consumer.tag().as_str().to_string());
        let no_ack = self.options.no_ack;
        self.reader = Some(tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        inbound.connection_lost(e.to_string());
                        break;
                    }
                };
                let delivered = inbound.deliver(&delivery.data);
                if no_ack {
                    continue;
                }
                let settled = match delivered {
                    Ok(()) => delivery.ack(BasicAckOptions::default()).await,
                    Err(_) => {
                        delivery
                            .nack(BasicNackOptions {
                                requeue: false,
                                ..BasicNackOptions::default()
                            })
                            .await
                    }
                };
                if let Err(e) = settled {
                    warn!(target: "busline::transport", broker = "rabbitmq", error = %e, "Failed to settle delivery");
                }
            }
            debug!(target: "busline::transport", broker = "rabbitmq", "Consumer stopped");
        }));
        self.channel = Some(channel);
        self.connection = Some(connection);
        Ok(())
    }

    async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| BusError::Publish("not connected".to_string()))?;
        let raw = envelope::encode(envelope)?;
        let (exchange, routing_key) = self.route(envelope);
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &raw,
                self.properties(envelope),
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        let mut first_error = None;
        if let Some(channel) = self.channel.take() {
            if let Some(tag) = self.consumer_tag.take() {
                if let Err(e) = channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
                    first_error.get_or_insert(e.to_string());
                }
            }
            if let Err(e) = channel.close(200, "Bye").await {
                first_error.get_or_insert(e.to_string());
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close(200, "Bye").await {
                first_error.get_or_insert(e.to_string());
            }
        }
        match first_error {
            Some(message) => Err(BusError::Broker(message)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker(exchange: &str, wildcards: bool) -> AmqpBroker {
        AmqpBroker::new(AmqpOptions {
            exchange: exchange.to_string(),
            wildcards,
            ..AmqpOptions::default()
        })
    }

    #[test]
    fn routing() {
        let env = Envelope::event("orders.created", json!({}));
        assert_eq!(broker("", false).route(&env), ("", "cqrs.events"));
        assert_eq!(broker("cqrs", false).route(&env), ("cqrs", "cqrs.events"));
        assert_eq!(broker("cqrs", true).route(&env), ("cqrs", "orders.created"));
    }

    #[test]
    fn correlation_travels_in_headers() {
        let props = broker("", false).properties(&Envelope::request("pay", json!(1), "c-1"));
        let headers = props.headers().clone().unwrap_or_default();
        let keys: Vec<&str> = headers.inner().keys().map(|k| k.as_str()).collect();
        assert!(keys.contains(&"event-type"));
        assert!(keys.contains(&"correlation-id"));
        assert_eq!(props.delivery_mode(), &Some(PERSISTENT));
    }
}
