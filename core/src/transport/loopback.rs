//! In-process stand-in for a network broker.
//!
//! A [`LoopbackWire`] plays the role of a broker topic: every
//! [`LoopbackBroker`] attached to it sees the raw bytes any of them publishes,
//! including its own. Envelopes cross the wire in their JSON encoding, so the
//! full decode path and the [`BrokerTransport`](super::BrokerTransport) state
//! machine are exercised without external services. Raw frames can be
//! injected to simulate foreign or malformed publishers.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::broker::{Broker, Inbound, DEFAULT_CONNECT_TIMEOUT};
use crate::channel::DEFAULT_CAPACITY;
use crate::envelope;
use crate::{BusError, Envelope, Result};

/// Shared topic connecting loopback brokers.
#[derive(Clone)]
pub struct LoopbackWire {
    tx: broadcast::Sender<Vec<u8>>,
}

impl LoopbackWire {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Put raw bytes on the wire as if another publisher had sent them.
    pub fn inject(&self, raw: impl Into<Vec<u8>>) {
        let _ = self.tx.send(raw.into());
    }

    /// Number of brokers currently attached and reading.
    pub fn readers(&self) -> usize {
        self.tx.receiver_count()
    }

    /// New broker attached to this wire.
    pub fn broker(&self) -> LoopbackBroker {
        LoopbackBroker {
            wire: self.clone(),
            connect_delay: None,
            fail_connect: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            reader: None,
        }
    }
}

impl Default for LoopbackWire {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

pub struct LoopbackBroker {
    wire: LoopbackWire,
    connect_delay: Option<Duration>,
    fail_connect: Option<String>,
    connect_timeout: Option<Duration>,
    reader: Option<JoinHandle<()>>,
}

impl LoopbackBroker {
    /// Delay the handshake, to observe queueing while connecting.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Make the handshake fail with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_connect = Some(message.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Broker for LoopbackBroker {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    async fn connect(&mut self, inbound: Inbound) -> Result<()> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.fail_connect {
            return Err(BusError::Connect(message.clone()));
        }

        // Subscribe before reporting connected so nothing published after
        // connect can be missed
        let mut rx = self.wire.tx.subscribe();
        self.reader = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(raw) => {
                        if inbound.is_closed() {
                            break;
                        }
                        // Decode failures are already reported as faults
                        let _ = inbound.deliver(&raw);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "busline::transport", broker = "loopback", skipped, "Reader lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(target: "busline::transport", broker = "loopback", "Reader stopped");
        }));
        Ok(())
    }

    async fn publish(&mut self, envelope: &Envelope) -> Result<()> {
        let raw = envelope::encode(envelope)?;
        // No attached readers is fine, like a topic without subscribers
        let _ = self.wire.tx.send(raw);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        Ok(())
    }
}

impl Drop for LoopbackBroker {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
