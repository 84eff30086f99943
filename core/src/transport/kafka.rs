//! Kafka adapter built on rdkafka.
//!
//! Produces to [`KAFKA_TOPIC`] keyed by correlation id (or type) so a
//! request and its replies share a partition, and consumes the topic in the
//! configured consumer group unless running producer-only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::broker::{Broker, Inbound};
use super::options::{KafkaOptions, KAFKA_TOPIC};
use crate::channel::{Fault, FaultKind};
use crate::envelope;
use crate::{BusError, Envelope, Result};

const RECV_BACKOFF: Duration = Duration::from_millis(500);

pub struct KafkaBroker {
    options: KafkaOptions,
    producer: Option<FutureProducer>,
    consumer: Option<Arc<StreamConsumer>>,
    reader: Option<JoinHandle<()>>,
}

impl KafkaBroker {
    pub fn new(options: KafkaOptions) -> Self {
        Self {
            options,
            producer: None,
            consumer: None,
            reader: None,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.options.brokers.join(","))
            .set("client.id", &self.options.client_id)
            .set(
                "socket.connection.setup.timeout.ms",
                self.options.timeout_ms.to_string(),
            );
        config
    }

    fn apply_overrides(&self, config: &mut ClientConfig) {
        for (key, value) in &self.options.config {
            config.set(key, value);
        }
    }

    fn create_producer(&self) -> std::result::Result<FutureProducer, KafkaError> {
        let mut config = self.client_config();
        config.set("message.timeout.ms", self.options.send_timeout_ms.to_string());
        self.apply_overrides(&mut config);
        config.create()
    }

    fn create_consumer(&self) -> std::result::Result<StreamConsumer, KafkaError> {
        let mut config = self.client_config();
        let reset = if self.options.from_beginning {
            "earliest"
        } else {
            "latest"
        };
        config
            .set("group.id", &self.options.group_id)
            .set("auto.offset.reset", reset)
            .set("enable.auto.commit", "true");
        self.apply_overrides(&mut config);
        config.create()
    }
}

fn record_key(envelope: &Envelope) -> &str {
    envelope
        .correlation_id
        .as_deref()
        .unwrap_or(envelope.r#type.as_str())
}

#[async_trait]
impl Broker for KafkaBroker {
    fn name(&self) -> &'static str {
        "kafka"
    }

    fn connect_timeout(&self) -> Option<Duration> {
        Some(self.options.timeout())
    }

    async fn connect(&mut self, inbound: Inbound) -> Result<()> {
        let producer = self
            .create_producer()
            .map_err(|e| BusError::Connect(e.to_string()))?;

        // librdkafka connects lazily; a metadata round trip proves the
        // cluster is reachable
        let probe = producer.clone();
        let timeout = self.options.timeout();
        tokio::task::spawn_blocking(move || {
            probe
                .client()
                .fetch_metadata(Some(KAFKA_TOPIC), timeout)
                .map(|_| ())
        })
        .await
        .map_err(|e| BusError::Connect(e.to_string()))?
        .map_err(|e| BusError::Connect(e.to_string()))?;
        self.producer = Some(producer);

        if self.options.producer_only {
            info!(target: "busline::transport", broker = "kafka", topic = KAFKA_TOPIC, "Connected in producer-only mode");
            return Ok(());
        }

        let consumer = self
            .create_consumer()
            .map_err(|e| BusError::Connect(e.to_string()))?;
        consumer
            .subscribe(&[KAFKA_TOPIC])
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let consumer = Arc::new(consumer);
        info!(target: "busline::transport", broker = "kafka", topic = KAFKA_TOPIC, group = %self.options.group_id, "Subscribed");

        let reader_consumer = Arc::clone(&consumer);
        self.reader = Some(tokio::spawn(async move {
            loop {
                if inbound.is_closed() {
                    break;
                }
                // Borrowed messages must not live across an await point
                let failure = match reader_consumer.recv().await {
                    Ok(message) => {
                        // Tombstones and empty records carry no envelope
                        if let Some(payload) = message.payload() {
                            let _ = inbound.deliver(payload);
                        }
                        None
                    }
                    Err(e) => Some(e),
                };
                if let Some(e) = failure {
                    warn!(target: "busline::transport", broker = "kafka", error = %e, "Consumer error");
                    inbound.fault(Fault::new(FaultKind::Broker, e.to_string()));
                    tokio::time::sleep(RECV_BACKOFF).await;
                }
            }
            debug!(target: "busline::transport", broker = "kafka", "Consumer stopped");
        }));
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| BusError::Publish("not connected".to_string()))?;
        let raw = envelope::encode(envelope)?;
        let mut headers = OwnedHeaders::new().insert(Header {
            key: "event-type",
            value: Some(envelope.r#type.as_str()),
        });
        if let Some(id) = envelope.correlation_id.as_deref() {
            headers = headers.insert(Header {
                key: "correlation-id",
                value: Some(id),
            });
        }
        let record = FutureRecord::to(KAFKA_TOPIC)
            .key(record_key(envelope))
            .payload(&raw)
            .headers(headers);
        producer
            .send(record, self.options.send_timeout())
            .await
            .map(|_| ())
            .map_err(|(e, _)| BusError::Publish(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
        if let Some(producer) = self.producer.take() {
            let timeout = self.options.send_timeout();
            tokio::task::spawn_blocking(move || producer.flush(timeout))
                .await
                .map_err(|e| BusError::Broker(e.to_string()))?
                .map_err(|e| BusError::Broker(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_prefers_correlation_id() {
        assert_eq!(record_key(&Envelope::request("pay", json!(1), "c-7")), "c-7");
        assert_eq!(record_key(&Envelope::event("tick", json!(1))), "tick");
    }
}
