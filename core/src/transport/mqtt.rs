//! MQTT adapter built on rumqttc.
//!
//! The rumqttc event loop is driven by a poller task. The first `ConnAck`
//! completes `connect`; later ones re-subscribe after the client library
//! reconnected on its own.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions as ClientOptions, Packet, QoS};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::broker::{Broker, Inbound};
use super::options::{MqttOptions, MQTT_TOPIC};
use crate::envelope;
use crate::{BusError, Envelope, Result};

const REQUEST_CAPACITY: usize = 64;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub struct MqttBroker {
    options: MqttOptions,
    client: Option<AsyncClient>,
    poller: Option<JoinHandle<()>>,
}

impl MqttBroker {
    pub fn new(options: MqttOptions) -> Self {
        Self {
            options,
            client: None,
            poller: None,
        }
    }

    fn qos(&self) -> QoS {
        qos_from(self.options.qos)
    }

    fn client_options(&self) -> ClientOptions {
        let (host, port) = self.options.host_port();
        let client_id = self
            .options
            .client_id
            .clone()
            .unwrap_or_else(|| format!("busline-{}", &envelope::new_correlation_id()[..8]));
        let mut opts = ClientOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(self.options.keepalive_secs.max(5)));
        opts.set_clean_session(self.options.clean_session);
        if let Some(username) = &self.options.username {
            opts.set_credentials(
                username.clone(),
                self.options.password.clone().unwrap_or_default(),
            );
        }
        opts
    }
}

fn qos_from(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

#[async_trait]
impl Broker for MqttBroker {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn connect_timeout(&self) -> Option<Duration> {
        Some(self.options.connect_timeout())
    }

    async fn connect(&mut self, inbound: Inbound) -> Result<()> {
        let (client, eventloop) = AsyncClient::new(self.client_options(), REQUEST_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let poller = tokio::spawn(poll(eventloop, client.clone(), self.qos(), inbound, ready_tx));

        let outcome = timeout(self.options.connect_timeout(), ready_rx).await;
        match outcome {
            Ok(Ok(Ok(()))) => {
                info!(target: "busline::transport", broker = "mqtt", topic = MQTT_TOPIC, "Subscribed");
                self.client = Some(client);
                self.poller = Some(poller);
                Ok(())
            }
            Ok(Ok(Err(message))) => {
                poller.abort();
                Err(BusError::Connect(message))
            }
            Ok(Err(_)) => {
                poller.abort();
                Err(BusError::Connect("MQTT event loop stopped".to_string()))
            }
            Err(_) => {
                poller.abort();
                Err(BusError::Connect("MQTT connection timeout".to_string()))
            }
        }
    }

    async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        let qos = self.qos();
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| BusError::Publish("not connected".to_string()))?;
        let raw = envelope::encode(envelope)?;
        client
            .publish(MQTT_TOPIC, qos, false, raw)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        let result = match self.client.take() {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| BusError::Broker(e.to_string())),
            None => Ok(()),
        };
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        result
    }
}

async fn poll(
    mut eventloop: EventLoop,
    client: AsyncClient,
    qos: QoS,
    inbound: Inbound,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Err(e) = client.try_subscribe(MQTT_TOPIC, qos) {
                    warn!(target: "busline::transport", broker = "mqtt", error = %e, "Subscribe request failed");
                }
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    None => inbound.connection_restored(),
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic == MQTT_TOPIC {
                    let _ = inbound.deliver(&publish.payload);
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                inbound.connection_lost("MQTT broker sent disconnect");
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e.to_string()));
                    return;
                }
                if inbound.is_closed() {
                    return;
                }
                inbound.connection_lost(e.to_string());
                debug!(target: "busline::transport", broker = "mqtt", "Reconnecting");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(9), QoS::AtMostOnce);
    }
}
