//! Runtime configuration, loaded from TOML with `serde(default)` fields so a
//! partial file only overrides what it names.

use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_push_interval_ms() -> u64 {
    500
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    7400
}

fn default_coin_round_modulus() -> u64 {
    10
}

fn default_stake_default() -> u64 {
    1
}

fn default_database_path() -> String {
    "hashweave.db".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

/// How a producer behaves when the engine's inbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Back off and wait for room.
    #[default]
    Block,
    /// Drop the oldest buffered batch and enqueue the new one.
    DropOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_push_interval_ms")]
    pub push_interval_ms: u64,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// "host:port" to push to immediately at startup, if set.
    #[serde(default)]
    pub bootstrap_push: Option<String>,
    /// Skip signature reverification on load. Debug only.
    #[serde(default)]
    pub dirty: bool,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_coin_round_modulus")]
    pub coin_round_modulus: u64,
    #[serde(default = "default_stake_default")]
    pub stake_default: u64,
    #[serde(default = "default_queue_capacity")]
    pub inbound_queue_capacity: usize,
    #[serde(default)]
    pub queue_full_policy: QueueFullPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            push_interval_ms: default_push_interval_ms(),
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            bootstrap_push: None,
            dirty: false,
            database_path: default_database_path(),
            coin_round_modulus: default_coin_round_modulus(),
            stake_default: default_stake_default(),
            inbound_queue_capacity: default_queue_capacity(),
            queue_full_policy: QueueFullPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("bootstrap_push must be \"host:port\", got {0:?}")]
    BadBootstrapAddress(String),
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parses `bootstrap_push` into `(host, port)`, if set.
    pub fn bootstrap_address(&self) -> Result<Option<(String, u16)>, ConfigError> {
        let Some(addr) = &self.bootstrap_push else {
            return Ok(None);
        };
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::BadBootstrapAddress(addr.clone()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::BadBootstrapAddress(addr.clone()))?;
        Ok(Some((host.to_string(), port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.push_interval_ms, 500);
        assert_eq!(config.coin_round_modulus, 10);
        assert_eq!(config.stake_default, 1);
    }

    #[test]
    fn partial_toml_only_overrides_named_fields() {
        let config = Config::from_toml_str("listen_port = 9999\n").unwrap();
        assert_eq!(config.listen_port, 9999);
        assert_eq!(config.push_interval_ms, 500);
    }

    #[test]
    fn bootstrap_address_parses_host_port() {
        let mut config = Config::default();
        config.bootstrap_push = Some("peer.example:7400".to_string());
        assert_eq!(
            config.bootstrap_address().unwrap(),
            Some(("peer.example".to_string(), 7400))
        );
    }

    #[test]
    fn bootstrap_address_rejects_missing_port() {
        let mut config = Config::default();
        config.bootstrap_push = Some("peer.example".to_string());
        assert!(config.bootstrap_address().is_err());
    }
}
