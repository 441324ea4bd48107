use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::WireVersion;
use crate::envelope::Destination;
use crate::error::{MqError, Result};

/// Router settings.
///
/// Handlers and error collectors are code, not data, and are supplied on
/// [`RouterBuilder`](crate::router::RouterBuilder) instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Identity of this router; prefixes message ids and error origins.
    pub name: String,
    /// Broker address. The router never reads it; connectors built through
    /// [`RouterBuilder::connector_from`](crate::router::RouterBuilder::connector_from)
    /// do.
    pub mq_uri: String,
    /// Settings for the connector, handed over with `mq_uri`.
    pub connector_options: HashMap<String, String>,
    /// Own listen queue. Empty means `<name>-<nanos>`.
    pub queue: String,
    /// Topic the listen queue is bound with, and the topic of the return
    /// destination.
    pub topic: String,
    /// Exchange of the listen queue; empty is the default exchange.
    pub exchange: String,
    /// Ttl of requests and messages sent without an explicit one.
    pub default_ttl_secs: u64,
    /// Period of the pending-request sweep, which bounds timeout latency.
    pub sweep_interval_ms: u64,
    /// Version outgoing envelopes are encoded with.
    pub wire_version: WireVersion,
    /// Reports buffered per lagging [`Router::errors`](crate::router::Router::errors) receiver.
    pub error_channel_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            mq_uri: String::new(),
            connector_options: HashMap::new(),
            queue: String::new(),
            topic: String::new(),
            exchange: String::new(),
            default_ttl_secs: 5,
            sweep_interval_ms: 200,
            wire_version: WireVersion::V1,
            error_channel_capacity: 256,
        }
    }
}

impl RouterConfig {
    /// Defaults with `name` set.
    ///
    /// # Examples
    ///
    /// ```
    /// use mq_router_core::RouterConfig;
    ///
    /// let config = RouterConfig::new("billing");
    /// assert_eq!(config.default_ttl_secs, 5);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load from TOML (path via MQ_ROUTER_CONFIG or ./mq_router.toml), then
    /// apply environment overrides. A missing file means defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("MQ_ROUTER_CONFIG").unwrap_or_else(|_| "mq_router.toml".into());
        let mut config = if Path::new(&path).exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| MqError::Config(format!("failed to read {path}: {e}")))?;
            let config = Self::from_toml_str(&raw)?;
            tracing::info!(target: "mq_router", path = %path, "Loaded router config");
            config
        } else {
            tracing::info!(target: "mq_router", path = %path, "No TOML config found; using defaults/env");
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML; absent keys keep their defaults. Does not validate.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| MqError::Config(format!("invalid TOML: {e}")))
    }

    fn apply_env(&mut self) {
        let var = |key: &str| std::env::var(key).ok().filter(|s| !s.is_empty());

        if let Some(v) = var("MQ_ROUTER_NAME") {
            self.name = v;
        }
        if let Some(v) = var("MQ_URI") {
            self.mq_uri = v;
        }
        if let Some(v) = var("MQ_ROUTER_QUEUE") {
            self.queue = v;
        }
        if let Some(v) = var("MQ_ROUTER_TOPIC") {
            self.topic = v;
        }
        if let Some(v) = var("MQ_ROUTER_EXCHANGE") {
            self.exchange = v;
        }
        if let Some(v) = var("MQ_ROUTER_DEFAULT_TTL") {
            match v.parse() {
                Ok(secs) => self.default_ttl_secs = secs,
                Err(_) => {
                    tracing::warn!(target: "mq_router", value = %v, "Ignoring unparsable MQ_ROUTER_DEFAULT_TTL")
                }
            }
        }
        if let Some(v) = var("MQ_ROUTER_SWEEP_INTERVAL_MS") {
            match v.parse() {
                Ok(ms) => self.sweep_interval_ms = ms,
                Err(_) => {
                    tracing::warn!(target: "mq_router", value = %v, "Ignoring unparsable MQ_ROUTER_SWEEP_INTERVAL_MS")
                }
            }
        }
    }

    /// Rejects an empty name and zero ttl, sweep interval or channel
    /// capacity with [`MqError::Config`].
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MqError::Config("name must not be empty".into()));
        }
        if self.default_ttl_secs == 0 {
            return Err(MqError::Config("default_ttl_secs must be positive".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(MqError::Config("sweep_interval_ms must be positive".into()));
        }
        if self.error_channel_capacity == 0 {
            return Err(MqError::Config("error_channel_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Where this router listens, before the broker confirms the queue name.
    pub fn listen_destination(&self) -> Destination {
        Destination::new(&self.queue, &self.topic, &self.exchange)
    }
}
