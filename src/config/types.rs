//! Core configuration types and loading.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::network::ParamValue;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Log output settings.
    #[serde(default)]
    pub log: LogConfig,
    /// Channel timer intervals.
    #[serde(default)]
    pub timers: TimersConfig,
    /// File-transfer socket settings.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Accounts connected at startup.
    #[serde(default)]
    pub accounts: Vec<AccountBlock>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Timer intervals, in seconds.
///
/// - `typing_resend`: how often a typing notification is repeated while
///   the local user stays in the composing state (default: 4)
/// - `typing_idle`: how long a remote contact may stay silent before
///   their composing state is considered over (default: 7)
/// - `empty_channel`: how long a multi-party conversation may live
///   without a session before it is closed (default: 300)
#[derive(Debug, Clone, Deserialize)]
pub struct TimersConfig {
    #[serde(default = "default_typing_resend")]
    pub typing_resend: u64,
    #[serde(default = "default_typing_idle")]
    pub typing_idle: u64,
    #[serde(default = "default_empty_channel")]
    pub empty_channel: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            typing_resend: default_typing_resend(),
            typing_idle: default_typing_idle(),
            empty_channel: default_empty_channel(),
        }
    }
}

impl TimersConfig {
    pub fn typing_resend(&self) -> Duration {
        Duration::from_secs(self.typing_resend)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_secs(self.typing_idle)
    }

    pub fn empty_channel(&self) -> Duration {
        Duration::from_secs(self.empty_channel)
    }
}

fn default_typing_resend() -> u64 {
    4
}

fn default_typing_idle() -> u64 {
    7
}

fn default_empty_channel() -> u64 {
    300
}

/// File-transfer rendezvous sockets.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Address local listeners bind to (default: 127.0.0.1).
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// An account the daemon connects at startup.
///
/// Everything besides `protocol` is handed to the gateway as connection
/// parameters (`account`, `password`, `server`, `port`, proxy settings).
#[derive(Debug, Clone, Deserialize)]
pub struct AccountBlock {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, ParamValue>,
}

fn default_protocol() -> String {
    crate::network::PROTOCOL.to_string()
}
