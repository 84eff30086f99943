//! Transport contract shared by the in-memory channel and every broker adapter.
//!
//! Application code talks to a [`Transport`] only through the [`Bus`](crate::Bus).
//! The in-memory [`Channel`](crate::Channel) implements it directly; broker
//! adapters implement the much smaller [`Broker`] trait and are driven by
//! [`BrokerTransport`], which owns the connect/queue/fault state machine once
//! for all of them.

mod broker;
mod factory;
pub mod loopback;
pub mod options;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;

use crate::channel::{Fault, Subscription};
use crate::{Envelope, Result};

pub use broker::{Broker, BrokerTransport, Inbound, DEFAULT_CONNECT_TIMEOUT};
pub use factory::TransportConfig;
pub use loopback::{LoopbackBroker, LoopbackWire};
pub use options::{AmqpOptions, KafkaOptions, MqttOptions, NatsOptions, RedisOptions};

/// Lifecycle of a transport's link to its broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Initial connect sequence in flight
    Connecting,
    /// Handshake and initial subscribe succeeded
    Connected,
    /// Broker dropped the link after it had been established
    Disconnected,
    /// Initial connect failed; every publish fails with this message
    Failed(String),
    /// `complete()` ran
    Closed,
}

/// Publish/subscribe/lifecycle contract every transport satisfies.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short adapter name used in logs and fault messages
    fn name(&self) -> &'static str;

    /// Publish an envelope without waiting for the broker.
    ///
    /// Envelopes submitted before the link is up are queued and replayed in
    /// submission order once connected. Broker-side failures are reported as
    /// faults on the channel, not through this return value; only a closed
    /// transport is reported here.
    fn next(&self, envelope: Envelope) -> Result<()>;

    /// Observe every envelope flowing through the channel.
    fn subscribe(&self) -> Subscription;

    /// Signal a fault. Broker transports first publish a best-effort
    /// `system_error` envelope when connected.
    fn error(&self, fault: Fault);

    /// Release broker resources and close the channel.
    async fn complete(&self);

    fn state(&self) -> LinkState;

    fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Resolves once the initial connect sequence finished. A link that was
    /// established and later dropped still counts as connected here.
    async fn wait_for_connection(&self) -> Result<()>;
}
