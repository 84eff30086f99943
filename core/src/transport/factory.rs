// Transport selection from configuration
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::options::{AmqpOptions, KafkaOptions, MqttOptions, NatsOptions, RedisOptions};
use super::Transport;
use crate::channel::Channel;
use crate::{BusError, Result};

/// Which transport a bus runs on, tagged by `type`.
///
/// ```
/// use busline_core::TransportConfig;
///
/// let cfg: TransportConfig = toml::from_str(r#"
///     type = "nats"
///     servers = ["nats://a:4222", "nats://b:4222"]
/// "#).unwrap();
/// assert_eq!(cfg.type_name(), "nats");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// In-process channel; no broker
    #[default]
    Memory,
    Redis(RedisOptions),
    Nats(NatsOptions),
    Mqtt(MqttOptions),
    #[serde(rename = "rabbitmq")]
    Amqp(AmqpOptions),
    Kafka(KafkaOptions),
}

impl TransportConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            TransportConfig::Memory => "memory",
            TransportConfig::Redis(_) => "redis",
            TransportConfig::Nats(_) => "nats",
            TransportConfig::Mqtt(_) => "mqtt",
            TransportConfig::Amqp(_) => "rabbitmq",
            TransportConfig::Kafka(_) => "kafka",
        }
    }

    /// Default options for a transport type tag.
    pub fn from_type_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "memory" | "" => Ok(TransportConfig::Memory),
            "redis" => Ok(TransportConfig::Redis(RedisOptions::default())),
            "nats" => Ok(TransportConfig::Nats(NatsOptions::default())),
            "mqtt" => Ok(TransportConfig::Mqtt(MqttOptions::default())),
            "rabbitmq" | "amqp" => Ok(TransportConfig::Amqp(AmqpOptions::default())),
            "kafka" => Ok(TransportConfig::Kafka(KafkaOptions::default())),
            other => Err(BusError::Config(format!("unknown transport type '{other}'"))),
        }
    }

    /// Instantiate the transport. Broker transports start connecting
    /// immediately, so this must run inside a tokio runtime.
    ///
    /// Fails with [`BusError::MissingDependency`] when the adapter's cargo
    /// feature was not compiled in.
    pub fn build(&self, capacity: usize) -> Result<Arc<dyn Transport>> {
        info!(target: "busline::transport", transport = self.type_name(), "Building transport");
        match self {
            TransportConfig::Memory => Ok(Arc::new(Channel::new(capacity))),
            TransportConfig::Redis(opts) => build_redis(opts, capacity),
            TransportConfig::Nats(opts) => build_nats(opts, capacity),
            TransportConfig::Mqtt(opts) => build_mqtt(opts, capacity),
            TransportConfig::Amqp(opts) => build_amqp(opts, capacity),
            TransportConfig::Kafka(opts) => build_kafka(opts, capacity),
        }
    }
}

#[cfg(feature = "redis")]
fn build_redis(opts: &RedisOptions, capacity: usize) -> Result<Arc<dyn Transport>> {
    let broker = super::redis::RedisBroker::new(opts.clone());
    Ok(Arc::new(super::BrokerTransport::start(broker, capacity)))
}

#[cfg(not(feature = "redis"))]
fn build_redis(_opts: &RedisOptions, _capacity: usize) -> Result<Arc<dyn Transport>> {
    Err(BusError::MissingDependency {
        broker: "redis",
        feature: "redis",
    })
}

#[cfg(feature = "nats")]
fn build_nats(opts: &NatsOptions, capacity: usize) -> Result<Arc<dyn Transport>> {
    let broker = super::nats::NatsBroker::new(opts.clone());
    Ok(Arc::new(super::BrokerTransport::start(broker, capacity)))
}

#[cfg(not(feature = "nats"))]
fn build_nats(_opts: &NatsOptions, _capacity: usize) -> Result<Arc<dyn Transport>> {
    Err(BusError::MissingDependency {
        broker: "nats",
        feature: "nats",
    })
}

#[cfg(feature = "mqtt")]
fn build_mqtt(opts: &MqttOptions, capacity: usize) -> Result<Arc<dyn Transport>> {
    let broker = super::mqtt::MqttBroker::new(opts.clone());
    Ok(Arc::new(super::BrokerTransport::start(broker, capacity)))
}

#[cfg(not(feature = "mqtt"))]
fn build_mqtt(_opts: &MqttOptions, _capacity: usize) -> Result<Arc<dyn Transport>> {
    Err(BusError::MissingDependency {
        broker: "mqtt",
        feature: "mqtt",
    })
}

#[cfg(feature = "amqp")]
fn build_amqp(opts: &AmqpOptions, capacity: usize) -> Result<Arc<dyn Transport>> {
    let broker = super::amqp::AmqpBroker::new(opts.clone());
    Ok(Arc::new(super::BrokerTransport::start(broker, capacity)))
}

#[cfg(not(feature = "amqp"))]
fn build_amqp(_opts: &AmqpOptions, _capacity: usize) -> Result<Arc<dyn Transport>> {
    Err(BusError::MissingDependency {
        broker: "rabbitmq",
        feature: "amqp",
    })
}

#[cfg(feature = "kafka")]
fn build_kafka(opts: &KafkaOptions, capacity: usize) -> Result<Arc<dyn Transport>> {
    let broker = super::kafka::KafkaBroker::new(opts.clone());
    Ok(Arc::new(super::BrokerTransport::start(broker, capacity)))
}

#[cfg(not(feature = "kafka"))]
fn build_kafka(_opts: &KafkaOptions, _capacity: usize) -> Result<Arc<dyn Transport>> {
    Err(BusError::MissingDependency {
        broker: "kafka",
        feature: "kafka",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags() {
        for name in ["memory", "redis", "nats", "mqtt", "rabbitmq", "kafka"] {
            let cfg = TransportConfig::from_type_name(name).unwrap();
            assert_eq!(cfg.type_name(), name);
        }
        assert_eq!(
            TransportConfig::from_type_name("amqp").unwrap().type_name(),
            "rabbitmq"
        );
        assert!(matches!(
            TransportConfig::from_type_name("carrier-pigeon"),
            Err(BusError::Config(_))
        ));
    }

    #[test]
    fn rabbitmq_tag_parses_amqp_options() {
        let cfg: TransportConfig = toml::from_str(
            r#"
            type = "rabbitmq"
            queue = "orders"
            routing_key = "orders.#"
            wildcards = true
            "#,
        )
        .unwrap();
        match cfg {
            TransportConfig::Amqp(opts) => {
                assert_eq!(opts.queue, "orders");
                assert!(opts.wildcards);
                assert_eq!(opts.routing_key(), "orders.#");
                assert!(opts.durable);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn memory_builds_connected_transport() {
        let transport = TransportConfig::Memory.build(8).unwrap();
        assert_eq!(transport.name(), "memory");
        assert!(transport.is_connected());
    }

    #[cfg(not(feature = "kafka"))]
    #[tokio::test]
    async fn disabled_adapter_reports_missing_dependency() {
        let err = TransportConfig::Kafka(KafkaOptions::default())
            .build(8)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BusError::MissingDependency {
                broker: "kafka",
                feature: "kafka"
            }
        ));
    }
}
