//! Redis pub/sub adapter.
//!
//! Uses one multiplexed connection for publishing and a dedicated pub/sub
//! connection subscribed to [`REDIS_CHANNEL`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use super::broker::{Broker, Inbound};
use super::options::{RedisOptions, REDIS_CHANNEL};
use crate::envelope;
use crate::{BusError, Envelope, Result};

pub struct RedisBroker {
    options: RedisOptions,
    publisher: Option<MultiplexedConnection>,
    reader: Option<JoinHandle<()>>,
}

impl RedisBroker {
    pub fn new(options: RedisOptions) -> Self {
        Self {
            options,
            publisher: None,
            reader: None,
        }
    }

    async fn open(&self) -> std::result::Result<(MultiplexedConnection, redis::aio::PubSub), redis::RedisError> {
        let client = redis::Client::open(self.options.url())?;
        let publisher = client.get_multiplexed_async_connection().await?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(REDIS_CHANNEL).await?;
        Ok((publisher, pubsub))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn connect_timeout(&self) -> Option<Duration> {
        Some(self.options.timeout())
    }

    async fn connect(&mut self, inbound: Inbound) -> Result<()> {
        let (publisher, pubsub) = timeout(self.options.timeout(), self.open())
            .await
            .map_err(|_| BusError::Connect("Redis connection timeout".to_string()))?
            .map_err(|e| BusError::Connect(e.to_string()))?;
        info!(target: "busline::transport", broker = "redis", channel = REDIS_CHANNEL, "Subscribed");

        self.publisher = Some(publisher);
        self.reader = Some(tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                if inbound.is_closed() {
                    return;
                }
                let _ = inbound.deliver(msg.get_payload_bytes());
            }
            if !inbound.is_closed() {
                inbound.connection_lost("Redis subscriber connection closed");
            }
            debug!(target: "busline::transport", broker = "redis", "Subscriber stopped");
        }));
        Ok(())
    }

    async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        let conn = self
            .publisher
            .as_mut()
            .ok_or_else(|| BusError::Publish("not connected".to_string()))?;
        let raw = envelope::encode(envelope)?;
        let _: () = conn
            .publish(REDIS_CHANNEL, raw)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.publisher = None;
        Ok(())
    }
}
