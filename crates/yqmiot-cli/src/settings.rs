//! Connection settings: config file, then `YQMIOT_*` environment, then flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use yqmiot_core::config::defaults;
use yqmiot_core::EndpointConfig;

/// Broker and identity flags shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// TOML config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Broker host.
    #[arg(long, global = true)]
    pub broker: Option<String>,

    /// Broker port.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Channel id.
    #[arg(long, global = true)]
    pub channel: Option<u64>,

    /// Node id of this endpoint.
    #[arg(long, global = true)]
    pub node: Option<u64>,

    /// Broker username.
    #[arg(long, global = true, requires = "password")]
    pub username: Option<String>,

    /// Broker password.
    #[arg(long, global = true, requires = "username")]
    pub password: Option<String>,

    /// Call timeout in milliseconds.
    #[arg(long, global = true)]
    pub call_timeout_ms: Option<u64>,

    /// Minimum interval between unchanged property reports, in milliseconds.
    #[arg(long, global = true)]
    pub report_interval_ms: Option<u64>,
}

/// Config file contents. Every field is optional so a file can hold just
/// the shared broker settings.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    broker: Option<String>,
    port: Option<u16>,
    channel_id: Option<u64>,
    node_id: Option<u64>,
    username: Option<String>,
    password: Option<String>,
    keep_alive_secs: Option<u64>,
    qos: Option<u8>,
    call_timeout_ms: Option<u64>,
    report_min_interval_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply(self, mut config: EndpointConfig) -> EndpointConfig {
        if let Some(broker) = self.broker {
            config.broker = broker;
        }
        config.port = self.port.unwrap_or(config.port);
        config.channel_id = self.channel_id.unwrap_or(config.channel_id);
        config.node_id = self.node_id.unwrap_or(config.node_id);
        if let (Some(username), Some(password)) = (self.username, self.password) {
            config = config.with_credential(username, password);
        }
        config.keep_alive_secs = self.keep_alive_secs.unwrap_or(config.keep_alive_secs);
        config.qos = self.qos.unwrap_or(config.qos);
        config.call_timeout_ms = self.call_timeout_ms.unwrap_or(config.call_timeout_ms);
        config.report_min_interval_ms = self
            .report_min_interval_ms
            .unwrap_or(config.report_min_interval_ms);
        config.sweep_interval_ms = self.sweep_interval_ms.unwrap_or(config.sweep_interval_ms);
        config
    }
}

impl ConnectionArgs {
    /// Merge all sources without validating, for the monitor which has no
    /// identity of its own.
    pub fn merge(&self) -> Result<EndpointConfig> {
        let mut config = EndpointConfig::new(0, 0);
        if let Some(path) = &self.config {
            config = FileConfig::load(path)?.apply(config);
        }
        let mut config = config.apply_env()?;

        if let Some(broker) = &self.broker {
            config.broker = broker.clone();
        }
        config.port = self.port.unwrap_or(config.port);
        config.channel_id = self.channel.unwrap_or(config.channel_id);
        config.node_id = self.node.unwrap_or(config.node_id);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            config = config.with_credential(username.clone(), password.clone());
        }
        config.call_timeout_ms = self.call_timeout_ms.unwrap_or(config.call_timeout_ms);
        config.report_min_interval_ms = self
            .report_interval_ms
            .unwrap_or(config.report_min_interval_ms);
        Ok(config)
    }

    /// Merged config for an endpoint, defaulting the node id to
    /// `default_node` when no source sets it.
    pub fn resolve(&self, default_node: u64) -> Result<EndpointConfig> {
        let mut config = self.merge()?;
        if config.channel_id == 0 {
            config.channel_id = 1;
        }
        if config.node_id == 0 {
            config.node_id = default_node;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Broker address shown in the startup banner.
pub fn describe(config: &EndpointConfig) -> String {
    if config.port == defaults::PORT {
        config.broker.clone()
    } else {
        config.broker_addr()
    }
}
