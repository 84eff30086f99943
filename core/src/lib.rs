// Busline Core Library
// Transport-agnostic event/command bus

pub mod bus;
pub mod channel;
pub mod config;
pub mod envelope;
pub mod handler;
pub mod telemetry;
pub mod transport;

// Export core types
pub use bus::{Bus, BusOptions, BusStats, FaultStream, HandlerRegistration};
pub use channel::{Channel, Fault, FaultKind, Signal, Subscription};
pub use config::BuslineConfig;
pub use envelope::{Envelope, EnvelopeKind};
pub use handler::{FnHandler, Handler, HandlerError};
pub use transport::{LinkState, Transport, TransportConfig};

use std::time::Duration;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Connection not established within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Transport '{broker}' requires the '{feature}' feature")]
    MissingDependency {
        broker: &'static str,
        feature: &'static str,
    },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport closed")]
    Closed,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
