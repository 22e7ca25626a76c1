use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    pub name: String,
    pub api_key: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// CIDR networks admitted to administrative routes like loopback peers.
    pub local_networks: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            local_networks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub cooldown_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ExternalAccessConfig {
    pub enabled: bool,
    pub api_token: String,
    pub allowed_clients: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/usage.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub subscriptions: Vec<SubscriptionConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub external: ExternalAccessConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_priority() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load and validate a config document from disk.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriptions.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one subscription is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for sub in &self.subscriptions {
            if sub.name.is_empty() {
                return Err(ConfigError::Invalid(
                    "subscription name must not be empty".to_string(),
                ));
            }
            if !names.insert(sub.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate subscription name '{}'",
                    sub.name
                )));
            }
            if sub.api_key.is_empty() || !sub.api_key.bytes().all(|b| (0x21..=0x7e).contains(&b)) {
                return Err(ConfigError::Invalid(format!(
                    "subscription '{}' has an empty or non-printable api_key",
                    sub.name
                )));
            }
            if !(1..=50).contains(&sub.max_concurrent) {
                return Err(ConfigError::Invalid(format!(
                    "subscription '{}': max_concurrent must be within 1..=50",
                    sub.name
                )));
            }
            if sub.priority < 1 {
                return Err(ConfigError::Invalid(format!(
                    "subscription '{}': priority must be >= 1",
                    sub.name
                )));
            }
        }

        if self.rate_limit.cooldown_seconds < 1 {
            return Err(ConfigError::Invalid(
                "rate_limit.cooldown_seconds must be >= 1".to_string(),
            ));
        }

        for net in &self.server.local_networks {
            Network::parse(net).map_err(|e| {
                ConfigError::Invalid(format!("server.local_networks entry '{net}': {e}"))
            })?;
        }

        if self.external.enabled && self.external.api_token.is_empty() {
            return Err(ConfigError::Invalid(
                "external.enabled requires a non-empty external.api_token".to_string(),
            ));
        }

        Ok(())
    }
}

/// An IP network in CIDR notation. A bare address is a /32 (or /128) network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    pub fn parse(s: &str) -> Result<Network, String> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| format!("bad address '{addr}'"))?;
                let prefix: u8 = prefix.parse().map_err(|_| format!("bad prefix '{prefix}'"))?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| format!("bad address '{s}'"))?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                (addr, prefix)
            }
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("prefix /{prefix} out of range for {addr}"));
        }
        Ok(Network { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_v4(self.prefix);
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_v6(self.prefix);
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}
