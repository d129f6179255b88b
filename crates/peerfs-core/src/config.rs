//! Configuration system for peerfs.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PEERFS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/peerfs/config.toml
//!   3. ~/.config/peerfs/config.toml

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, MAX_PAYLOAD};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerfsConfig {
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the TCP listener and UDP sender bind to. The UDP receiver
    /// binds it only when `broadcast_addr` is loopback; otherwise it takes
    /// 0.0.0.0 so broadcasts reach it.
    pub bind_addr: Ipv4Addr,
    /// Address peers know this node by. Auto-detected when absent.
    pub advertise_addr: Option<Ipv4Addr>,
    /// Destination of UDP broadcasts.
    pub broadcast_addr: Ipv4Addr,
    /// TCP port for unicast requests. Must match every other node.
    pub tcp_port: u16,
    /// UDP port for broadcasts. Must match every other node.
    pub udp_port: u16,
    pub connect_timeout_ms: u64,
    /// Bound on every socket read of an accepted connection.
    pub recv_timeout_ms: u64,
    /// Frames declaring a larger payload are dropped unread.
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// New-node window during which HELLO_REPLY snapshots are merged.
    pub grace_period_ms: u64,
    /// Pause after discarding local files before handing them off.
    pub discard_propagation_ms: u64,
    /// Pause between DISCARD_DESCRIPTOR and DELETE_FILE.
    pub delete_fence_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Held file content, keyed by content hash.
    pub blob_dir: PathBuf,
    /// Files fetched with GET_FILE, keyed by name.
    pub download_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            advertise_addr: None,
            broadcast_addr: Ipv4Addr::BROADCAST,
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            connect_timeout_ms: 5_000,
            recv_timeout_ms: 5_000,
            max_payload_bytes: MAX_PAYLOAD,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            discard_propagation_ms: 100,
            delete_fence_ms: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_dir: data_dir().join("blobs"),
            download_dir: data_dir().join("downloads"),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

impl SessionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn discard_propagation(&self) -> Duration {
        Duration::from_millis(self.discard_propagation_ms)
    }

    pub fn delete_fence(&self) -> Duration {
        Duration::from_millis(self.delete_fence_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("peerfs")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("peerfs")
}

fn dirs_or_home() -> PathBuf {
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

impl PeerfsConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PeerfsConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PEERFS_CONFIG")
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
            let text = toml::to_string_pretty(&PeerfsConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PEERFS_* overrides. `lookup` is `std::env::var` outside tests.
    /// Values that fail to parse are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PEERFS_NETWORK__BIND_ADDR").and_then(|v| v.parse().ok()) {
            self.network.bind_addr = v;
        }
        if let Some(v) = lookup("PEERFS_NETWORK__ADVERTISE_ADDR").and_then(|v| v.parse().ok()) {
            self.network.advertise_addr = Some(v);
        }
        if let Some(v) = lookup("PEERFS_NETWORK__BROADCAST_ADDR").and_then(|v| v.parse().ok()) {
            self.network.broadcast_addr = v;
        }
        if let Some(p) = lookup("PEERFS_NETWORK__TCP_PORT").and_then(|v| v.parse().ok()) {
            self.network.tcp_port = p;
        }
        if let Some(p) = lookup("PEERFS_NETWORK__UDP_PORT").and_then(|v| v.parse().ok()) {
            self.network.udp_port = p;
        }
        if let Some(ms) = lookup("PEERFS_SESSION__GRACE_PERIOD_MS").and_then(|v| v.parse().ok()) {
            self.session.grace_period_ms = ms;
        }
        if let Some(v) = lookup("PEERFS_STORAGE__BLOB_DIR") {
            self.storage.blob_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PEERFS_STORAGE__DOWNLOAD_DIR") {
            self.storage.download_dir = PathBuf::from(v);
        }
    }
}
