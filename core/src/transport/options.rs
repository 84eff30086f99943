//! Connection options for each broker adapter.
//!
//! These are plain data and always compiled, so configuration files naming a
//! broker parse even when its adapter feature is disabled.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Redis pub/sub channel every instance publishes to and subscribes on.
pub const REDIS_CHANNEL: &str = "cqrs:events";
/// MQTT topic every instance publishes to and subscribes on.
pub const MQTT_TOPIC: &str = "cqrs/events";
/// Default AMQP queue name.
pub const AMQP_QUEUE: &str = "cqrs.events";
/// NATS subject every instance publishes to and subscribes on.
pub const NATS_SUBJECT: &str = "cqrs.events";
/// Kafka topic every instance produces to and consumes from.
pub const KAFKA_TOPIC: &str = "cqrs-events";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisOptions {
    /// Full connection URL; takes precedence over host/port/password/db
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub timeout_ms: u64,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            timeout_ms: 10_000,
        }
    }
}

impl RedisOptions {
    pub fn url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let auth = match &self.password {
            Some(password) => format!(":{password}@"),
            None => String::new(),
        };
        format!("redis://{auth}{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttOptions {
    /// `mqtt://host:port` or `tcp://host:port`
    pub url: String,
    /// Generated when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive_secs: u64,
    pub clean_session: bool,
    /// 0, 1 or 2
    pub qos: u8,
    pub connect_timeout_ms: u64,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".to_string(),
            client_id: None,
            username: None,
            password: None,
            keepalive_secs: 60,
            clean_session: true,
            qos: 0,
            connect_timeout_ms: 30_000,
        }
    }
}

impl MqttOptions {
    /// Host and port from `url`, defaulting the port to 1883.
    pub fn host_port(&self) -> (String, u16) {
        let rest = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        let rest = rest.trim_end_matches('/');
        match rest.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (rest.to_string(), 1883),
            },
            None => (rest.to_string(), 1883),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpOptions {
    /// Tried in order until one connects
    pub urls: Vec<String>,
    pub queue: String,
    /// Empty means publish to the default exchange, routed by queue name
    pub exchange: String,
    pub exchange_type: String,
    /// Defaults to the queue name
    pub routing_key: Option<String>,
    /// Route published messages by envelope type instead of `routing_key`;
    /// bind with a pattern such as `orders.#` to receive them
    pub wildcards: bool,
    pub prefetch_count: u16,
    pub global_prefetch: bool,
    pub durable: bool,
    pub auto_delete: bool,
    /// Skip declaring and binding the queue
    pub no_assert: bool,
    pub no_ack: bool,
    pub consumer_tag: String,
    pub persistent: bool,
    /// Static headers attached to every published message
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
}

impl Default for AmqpOptions {
    fn default() -> Self {
        Self {
            urls: vec!["amqp://localhost:5672".to_string()],
            queue: AMQP_QUEUE.to_string(),
            exchange: String::new(),
            exchange_type: "topic".to_string(),
            routing_key: None,
            wildcards: false,
            prefetch_count: 0,
            global_prefetch: false,
            durable: true,
            auto_delete: false,
            no_assert: false,
            no_ack: false,
            consumer_tag: String::new(),
            persistent: true,
            headers: HashMap::new(),
            timeout_ms: 30_000,
        }
    }
}

impl AmqpOptions {
    pub fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.queue)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsOptions {
    pub servers: Vec<String>,
    /// Connection name reported to the server
    pub name: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,
    /// Queue group; members share delivery instead of each receiving a copy
    pub queue: Option<String>,
    pub headers: HashMap<String, String>,
    pub no_echo: bool,
    pub timeout_ms: u64,
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: None,
            user: None,
            pass: None,
            token: None,
            queue: None,
            headers: HashMap::new(),
            no_echo: false,
            timeout_ms: 10_000,
        }
    }
}

impl NatsOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaOptions {
    pub brokers: Vec<String>,
    pub client_id: String,
    pub group_id: String,
    pub from_beginning: bool,
    /// Publish only; never consume
    pub producer_only: bool,
    pub send_timeout_ms: u64,
    pub timeout_ms: u64,
    /// Raw librdkafka properties applied last
    pub config: HashMap<String, String>,
}

impl Default for KafkaOptions {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "cqrs-kafka-client".to_string(),
            group_id: "cqrs-consumer-group".to_string(),
            from_beginning: false,
            producer_only: false,
            send_timeout_ms: 5_000,
            timeout_ms: 30_000,
            config: HashMap::new(),
        }
    }
}

impl KafkaOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}
