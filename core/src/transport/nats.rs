//! NATS adapter built on async-nats.
//!
//! Publishes to and subscribes on [`NATS_SUBJECT`], optionally as a member of
//! a queue group. Reconnects are handled by the client library; its
//! connection events drive the transport's link state. Messages carry
//! `event-type` and `correlation-id` headers next to any configured ones.

use std::time::Duration;

use async_nats::{Client, ConnectOptions, Event, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::broker::{Broker, Inbound};
use super::options::{NatsOptions, NATS_SUBJECT};
use crate::envelope;
use crate::{BusError, Envelope, Result};

pub struct NatsBroker {
    options: NatsOptions,
    client: Option<Client>,
    reader: Option<JoinHandle<()>>,
}

impl NatsBroker {
    pub fn new(options: NatsOptions) -> Self {
        Self {
            options,
            client: None,
            reader: None,
        }
    }

    fn connect_options(&self, inbound: Inbound) -> ConnectOptions {
        let opts = &self.options;
        let mut connect = ConnectOptions::new().connection_timeout(opts.timeout());
        if let Some(name) = &opts.name {
            connect = connect.name(name.clone());
        }
        if let (Some(user), Some(pass)) = (&opts.user, &opts.pass) {
            connect = connect.user_and_password(user.clone(), pass.clone());
        }
        if let Some(token) = &opts.token {
            connect = connect.token(token.clone());
        }
        if opts.no_echo {
            connect = connect.no_echo();
        }
        connect.event_callback(move |event| {
            let inbound = inbound.clone();
            async move {
                match event {
                    Event::Connected => inbound.connection_restored(),
                    Event::Disconnected => inbound.connection_lost("NATS connection lost"),
                    other => {
                        debug!(target: "busline::transport", broker = "nats", event = %other, "Client event");
                    }
                }
            }
        })
    }

    fn headers(&self, envelope: &Envelope) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (key, value) in &self.options.headers {
            headers.insert(key.as_str(), value.as_str());
        }
        headers.insert("event-type", envelope.r#type.as_str());
        if let Some(id) = envelope.correlation_id.as_deref() {
            headers.insert("correlation-id", id);
        }
        headers
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn name(&self) -> &'static str {
        "nats"
    }

    fn connect_timeout(&self) -> Option<Duration> {
        Some(self.options.timeout())
    }

    async fn connect(&mut self, inbound: Inbound) -> Result<()> {
        let servers = self.options.servers.join(",");
        let client = timeout(
            self.options.timeout(),
            self.connect_options(inbound.clone()).connect(servers.as_str()),
        )
        .await
        .map_err(|_| BusError::Connect("NATS connection timeout".to_string()))?
        .map_err(|e| BusError::Connect(e.to_string()))?;

        let subscribed = match &self.options.queue {
            Some(group) => client.queue_subscribe(NATS_SUBJECT, group.clone()).await,
            None => client.subscribe(NATS_SUBJECT).await,
        };
        let mut subscriber = subscribed.map_err(|e| BusError::Connect(e.to_string()))?;
        info!(target: "busline::transport", broker = "nats", subject = NATS_SUBJECT, queue = ?self.options.queue, "Subscribed");

        self.reader = Some(tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                if inbound.is_closed() {
                    return;
                }
                let _ = inbound.deliver(&message.payload);
            }
            debug!(target: "busline::transport", broker = "nats", "Subscription ended");
        }));
        self.client = Some(client);
        Ok(())
    }

    async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| BusError::Publish("not connected".to_string()))?;
        let raw = envelope::encode(envelope)?;
        client
            .publish_with_headers(NATS_SUBJECT, self.headers(envelope), raw.into())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(client) = self.client.take() {
            if let Err(e) = client.flush().await {
                warn!(target: "busline::transport", broker = "nats", error = %e, "Flush on close failed");
                return Err(BusError::Broker(e.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_message_carries_type_and_correlation_headers() {
        let broker = NatsBroker::new(NatsOptions::default());
        let headers = broker.headers(&Envelope::request("pay", json!(1), "c-9"));
        assert_eq!(headers.get("event-type").map(|v| v.as_str()), Some("pay"));
        assert_eq!(headers.get("correlation-id").map(|v| v.as_str()), Some("c-9"));

        let headers = broker.headers(&Envelope::event("tick", json!(1)));
        assert_eq!(headers.get("event-type").map(|v| v.as_str()), Some("tick"));
        assert!(headers.get("correlation-id").is_none());
    }
}
