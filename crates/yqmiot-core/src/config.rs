//! Endpoint configuration.
//!
//! Values come from a config file, the environment (`YQMIOT_*`), or code.
//! Everything except the channel and node ids has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::topic::Address;

/// Default configuration values.
pub mod defaults {
    pub const BROKER: &str = "localhost";
    pub const PORT: u16 = 1883;
    pub const KEEP_ALIVE_SECS: u64 = 60;
    pub const QOS: u8 = 0;
    pub const CALL_TIMEOUT_MS: u64 = 10_000;
    pub const REPORT_MIN_INTERVAL_MS: u64 = 10_000;
    pub const SWEEP_INTERVAL_MS: u64 = 1_000;
}

/// Environment variable names.
pub mod env_vars {
    pub const BROKER: &str = "YQMIOT_BROKER";
    pub const PORT: &str = "YQMIOT_PORT";
    pub const CHANNEL_ID: &str = "YQMIOT_CHANNEL_ID";
    pub const NODE_ID: &str = "YQMIOT_NODE_ID";
    pub const USERNAME: &str = "YQMIOT_USERNAME";
    pub const PASSWORD: &str = "YQMIOT_PASSWORD";
    pub const CALL_TIMEOUT_MS: &str = "YQMIOT_CALL_TIMEOUT_MS";
    pub const REPORT_MIN_INTERVAL_MS: &str = "YQMIOT_REPORT_MIN_INTERVAL_MS";
}

/// Opaque broker credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Configuration for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// MQTT broker host
    #[serde(default = "default_broker")]
    pub broker: String,

    /// MQTT broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Channel (tenant) id
    pub channel_id: u64,

    /// This endpoint's node id
    pub node_id: u64,

    /// Broker credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// QoS level for publish and subscribe
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// How long a call waits for its ack
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Minimum interval between unchanged property reports
    #[serde(default = "default_report_min_interval")]
    pub report_min_interval_ms: u64,

    /// How often expired calls are swept
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_broker() -> String {
    defaults::BROKER.to_string()
}
fn default_port() -> u16 {
    defaults::PORT
}
fn default_keep_alive() -> u64 {
    defaults::KEEP_ALIVE_SECS
}
fn default_qos() -> u8 {
    defaults::QOS
}
fn default_call_timeout() -> u64 {
    defaults::CALL_TIMEOUT_MS
}
fn default_report_min_interval() -> u64 {
    defaults::REPORT_MIN_INTERVAL_MS
}
fn default_sweep_interval() -> u64 {
    defaults::SWEEP_INTERVAL_MS
}

impl EndpointConfig {
    pub fn new(channel_id: u64, node_id: u64) -> Self {
        Self {
            broker: default_broker(),
            port: defaults::PORT,
            channel_id,
            node_id,
            credential: None,
            keep_alive_secs: defaults::KEEP_ALIVE_SECS,
            qos: defaults::QOS,
            call_timeout_ms: defaults::CALL_TIMEOUT_MS,
            report_min_interval_ms: defaults::REPORT_MIN_INTERVAL_MS,
            sweep_interval_ms: defaults::SWEEP_INTERVAL_MS,
        }
    }

    pub fn with_broker(mut self, broker: impl Into<String>, port: u16) -> Self {
        self.broker = broker.into();
        self.port = port;
        self
    }

    pub fn with_credential(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credential = Some(Credential {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_report_min_interval(mut self, interval: Duration) -> Self {
        self.report_min_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Load from `YQMIOT_*` environment variables.
    pub fn from_env() -> ProtocolResult<Self> {
        let channel_id = env_parse(env_vars::CHANNEL_ID)?.ok_or_else(|| {
            ProtocolError::Configuration(format!("{} is not set", env_vars::CHANNEL_ID))
        })?;
        let node_id = env_parse(env_vars::NODE_ID)?.ok_or_else(|| {
            ProtocolError::Configuration(format!("{} is not set", env_vars::NODE_ID))
        })?;
        Self::new(channel_id, node_id).apply_env()
    }

    /// Override fields with any `YQMIOT_*` variables that are set.
    pub fn apply_env(mut self) -> ProtocolResult<Self> {
        if let Ok(broker) = std::env::var(env_vars::BROKER) {
            self.broker = broker;
        }
        if let Some(port) = env_parse(env_vars::PORT)? {
            self.port = port;
        }
        if let Some(channel_id) = env_parse(env_vars::CHANNEL_ID)? {
            self.channel_id = channel_id;
        }
        if let Some(node_id) = env_parse(env_vars::NODE_ID)? {
            self.node_id = node_id;
        }
        if let (Ok(username), Ok(password)) = (
            std::env::var(env_vars::USERNAME),
            std::env::var(env_vars::PASSWORD),
        ) {
            self.credential = Some(Credential { username, password });
        }
        if let Some(ms) = env_parse(env_vars::CALL_TIMEOUT_MS)? {
            self.call_timeout_ms = ms;
        }
        if let Some(ms) = env_parse(env_vars::REPORT_MIN_INTERVAL_MS)? {
            self.report_min_interval_ms = ms;
        }
        Ok(self)
    }

    /// Check ids and intervals.
    pub fn validate(&self) -> ProtocolResult<()> {
        self.address()?;
        if self.broker.is_empty() {
            return Err(ProtocolError::Configuration("broker must not be empty".to_string()));
        }
        if self.qos > 2 {
            return Err(ProtocolError::Configuration(format!("invalid qos {}", self.qos)));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ProtocolError::Configuration(
                "sweep interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> ProtocolResult<Address> {
        Address::new(self.channel_id, self.node_id)
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn report_min_interval(&self) -> Duration {
        Duration::from_millis(self.report_min_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> ProtocolResult<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ProtocolError::Configuration(format!("invalid value for {}: {}", name, value))),
        Err(_) => Ok(None),
    }
}
