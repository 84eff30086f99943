// Bus configuration: env-driven defaults with an optional TOML overlay
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::{BusOptions, DEFAULT_EXECUTE_TIMEOUT};
use crate::channel::DEFAULT_CAPACITY;
use crate::transport::{Transport, TransportConfig};
use crate::{Bus, BusError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct BuslineConfig {
    pub transport: TransportConfig,
    /// Signals buffered per subscriber
    pub channel_capacity: usize,
    /// `None` disables the execute timeout
    pub execute_timeout_ms: Option<u64>,
}

impl Default for BuslineConfig {
    fn default() -> Self {
        Self {
            transport: transport_from_env(),
            channel_capacity: std::env::var("BUSLINE_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(DEFAULT_CAPACITY),
            execute_timeout_ms: match std::env::var("BUSLINE_EXECUTE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
            {
                Some(0) => None,
                Some(ms) => Some(ms),
                None => Some(DEFAULT_EXECUTE_TIMEOUT.as_millis() as u64),
            },
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn transport_from_env() -> TransportConfig {
    let name = env_nonempty("BUSLINE_TRANSPORT").unwrap_or_else(|| "memory".into());
    let mut transport = match TransportConfig::from_type_name(&name) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(target: "busline::config", error = %e, "Ignoring BUSLINE_TRANSPORT; using memory");
            TransportConfig::Memory
        }
    };
    match &mut transport {
        TransportConfig::Memory => {}
        TransportConfig::Redis(opts) => {
            if let Some(url) = env_nonempty("BUSLINE_REDIS_URL") {
                opts.url = Some(url);
            }
        }
        TransportConfig::Nats(opts) => {
            if let Some(urls) = env_nonempty("BUSLINE_NATS_URL") {
                opts.servers = split_list(&urls);
            }
        }
        TransportConfig::Mqtt(opts) => {
            if let Some(url) = env_nonempty("BUSLINE_MQTT_URL") {
                opts.url = url;
            }
        }
        TransportConfig::Amqp(opts) => {
            if let Some(urls) = env_nonempty("BUSLINE_AMQP_URL") {
                opts.urls = split_list(&urls);
            }
        }
        TransportConfig::Kafka(opts) => {
            if let Some(brokers) = env_nonempty("BUSLINE_KAFKA_BROKERS") {
                opts.brokers = split_list(&brokers);
            }
        }
    }
    transport
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl BuslineConfig {
    /// Load configuration from a TOML file (path via BUSLINE_CONFIG or ./busline.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("BUSLINE_CONFIG").unwrap_or_else(|_| "busline.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "busline::config", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<BuslineToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "busline::config", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "busline::config", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Strict variant of [`load`](Self::load) for an in-memory TOML document.
    ///
    /// ```
    /// use busline_core::BuslineConfig;
    ///
    /// let cfg = BuslineConfig::from_toml_str(r#"
    ///     execute_timeout_ms = 0
    ///
    ///     [transport]
    ///     type = "redis"
    ///     url = "redis://cache:6379"
    /// "#).unwrap();
    /// assert_eq!(cfg.transport.type_name(), "redis");
    /// assert_eq!(cfg.bus_options().execute_timeout, None);
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let t = toml::from_str::<BuslineToml>(s).map_err(|e| BusError::Config(e.to_string()))?;
        Ok(t.overlay(Self::default()))
    }

    pub fn bus_options(&self) -> BusOptions {
        BusOptions {
            execute_timeout: self
                .execute_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        }
    }

    pub fn build_transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport.build(self.channel_capacity)
    }

    /// Build the configured transport and a bus on top of it. Must be called
    /// inside a tokio runtime.
    pub fn build_bus(&self) -> Result<Bus> {
        Ok(Bus::with_options(self.build_transport()?, self.bus_options()))
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuslineToml {
    pub transport: Option<TransportConfig>,
    pub channel_capacity: Option<usize>,
    pub execute_timeout_ms: Option<u64>,
}

impl BuslineToml {
    fn overlay(self, mut base: BuslineConfig) -> BuslineConfig {
        if let Some(t) = self.transport {
            base.transport = t;
        }
        if let Some(c) = self.channel_capacity {
            base.channel_capacity = c.max(1);
        }
        if let Some(ms) = self.execute_timeout_ms {
            base.execute_timeout_ms = (ms > 0).then_some(ms);
        }
        base
    }
}
