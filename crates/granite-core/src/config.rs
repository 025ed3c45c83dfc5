//! Configuration for the Granite network layer.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GRANITE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/granite/config.toml
//!   3. ~/.config/granite/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level network configuration, resolved once at startup and passed
/// by reference thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub identity: IdentityConfig,
    pub listen: ListenConfig,
    pub peers: PeerConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the node's secp256k1 secret key. Auto-generated on first run.
    pub key_path: PathBuf,
    /// Client identifier advertised in the capability handshake.
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Bind address for both TCP sessions and UDP discovery.
    pub address: String,
    /// TCP port for encrypted sessions. 0 = OS-assigned.
    pub tcp_port: u16,
    /// UDP port for discovery. 0 = OS-assigned.
    pub udp_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Maximum concurrent sessions.
    pub max_peers: usize,
    /// Bootstrap nodes, `id-hex@ip:tcp-port` (discovery port assumed equal).
    pub bootnodes: Vec<String>,
    /// Seconds between outbound dial rounds.
    pub dial_interval_secs: u64,
    /// Seconds allowed for handshake plus capability negotiation.
    pub handshake_timeout_secs: u64,
    /// Seconds of frame silence before a session is dropped.
    pub read_timeout_secs: u64,
    /// Seconds between keepalive pings on an idle session.
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Disable to run with static bootnodes only.
    pub enabled: bool,
    /// Seconds between table refresh rounds.
    pub refresh_interval_secs: u64,
    /// Milliseconds to wait for a pong before a liveness probe fails.
    pub probe_timeout_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            listen: ListenConfig::default(),
            peers: PeerConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_path: config_dir().join("node.key"),
            client_id: format!("granite/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            tcp_port: 30303,
            udp_port: 30303,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_peers: 25,
            bootnodes: Vec::new(),
            dial_interval_secs: 10,
            handshake_timeout_secs: 10,
            read_timeout_secs: 60,
            ping_interval_secs: 15,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_secs: 30,
            probe_timeout_ms: 2000,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("granite")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NetConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            NetConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GRANITE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&NetConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply GRANITE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GRANITE_LISTEN__ADDRESS") {
            self.listen.address = v;
        }
        if let Ok(v) = std::env::var("GRANITE_LISTEN__TCP_PORT") {
            if let Ok(p) = v.parse() {
                self.listen.tcp_port = p;
            }
        }
        if let Ok(v) = std::env::var("GRANITE_LISTEN__UDP_PORT") {
            if let Ok(p) = v.parse() {
                self.listen.udp_port = p;
            }
        }
        if let Ok(v) = std::env::var("GRANITE_PEERS__MAX_PEERS") {
            if let Ok(n) = v.parse() {
                self.peers.max_peers = n;
            }
        }
        if let Ok(v) = std::env::var("GRANITE_PEERS__BOOTNODES") {
            self.peers.bootnodes = v
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(v) = std::env::var("GRANITE_DISCOVERY__ENABLED") {
            self.discovery.enabled = v == "true" || v == "1";
        }
    }
}
