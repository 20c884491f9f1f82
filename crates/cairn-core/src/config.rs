//! Configuration system for cairn.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::distance::{Distance, Radius};
use crate::enr::{Enr, EnrError};
use crate::wire::ProtocolId;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub overlay: OverlayConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the secp256k1 key. Auto-generated on first run.
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP listen socket.
    pub bind_address: String,
    /// Socket abstraction: "node" (native UDP), "web", or "mobile".
    pub transport: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Which overlays to instantiate.
    pub subprotocols: Vec<String>,
    /// Initial responsibility radius, 64 hex chars big-endian.
    pub radius: String,
    /// Seed records for table warm-up: hex-encoded signed ENR RLP.
    pub bootnodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for per-sub-protocol content databases. Empty =
    /// in-memory only.
    pub path: PathBuf,
    /// Byte high-watermark before eviction. 0 = unlimited.
    pub max_bytes: u64,
    /// Reload routing-table state from persistence on startup.
    pub rebuild_from_memory: bool,
}

/// Socket abstraction selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Node,
    Web,
    Mobile,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CairnConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            overlay: OverlayConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_path: config_dir().join("key"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9009".to_string(),
            transport: "node".to_string(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            subprotocols: vec!["history".to_string(), "state".to_string()],
            radius: "f".repeat(64),
            bootnodes: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("db"),
            max_bytes: 1_073_741_824, // 1 GB
            rebuild_from_memory: false,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cairn")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("cairn")
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
    #[error("invalid bind address: {0}")]
    BadBindAddress(String),
    #[error("unknown transport: {0} (expected node, web, or mobile)")]
    UnknownTransport(String),
    #[error("transport {0:?} is not supported by this build")]
    UnsupportedTransport(TransportKind),
    #[error("invalid radius: expected 64 hex characters")]
    BadRadius,
    #[error("unknown sub-protocol: {0}")]
    UnknownSubProtocol(String),
    #[error("invalid bootnode record: {0}")]
    BadBootnode(EnrError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CairnConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
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
            let text = toml::to_string_pretty(&CairnConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAIRN_NETWORK__BIND_ADDRESS") {
            self.network.bind_address = v;
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__TRANSPORT") {
            self.network.transport = v;
        }
        if let Ok(v) = std::env::var("CAIRN_OVERLAY__RADIUS") {
            self.overlay.radius = v;
        }
        if let Ok(v) = std::env::var("CAIRN_OVERLAY__SUBPROTOCOLS") {
            self.overlay.subprotocols = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("CAIRN_STORAGE__PATH") {
            self.storage.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CAIRN_STORAGE__MAX_BYTES") {
            if let Ok(n) = v.parse() {
                self.storage.max_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_STORAGE__REBUILD_FROM_MEMORY") {
            self.storage.rebuild_from_memory = v == "true" || v == "1";
        }
    }

    // ── Typed accessors ──────────────────────────────────────────────────────
    // Configuration errors are fatal at startup only; everything below is
    // called once during node assembly.

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.network
            .bind_address
            .parse()
            .map_err(|_| ConfigError::BadBindAddress(self.network.bind_address.clone()))
    }

    pub fn transport_kind(&self) -> Result<TransportKind, ConfigError> {
        match self.network.transport.as_str() {
            "node" => Ok(TransportKind::Node),
            "web" => Ok(TransportKind::Web),
            "mobile" => Ok(TransportKind::Mobile),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }

    pub fn radius(&self) -> Result<Radius, ConfigError> {
        let stripped = self.overlay.radius.trim_start_matches("0x");
        let bytes = hex::decode(stripped).map_err(|_| ConfigError::BadRadius)?;
        if bytes.len() != 32 {
            return Err(ConfigError::BadRadius);
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Distance(out))
    }

    pub fn subprotocols(&self) -> Result<Vec<ProtocolId>, ConfigError> {
        self.overlay
            .subprotocols
            .iter()
            .map(|name| match name.as_str() {
                "history" => Ok(ProtocolId::History),
                "state" => Ok(ProtocolId::State),
                "beacon" => Ok(ProtocolId::Beacon),
                "canonical-indices" => Ok(ProtocolId::CanonicalIndices),
                other => Err(ConfigError::UnknownSubProtocol(other.to_string())),
            })
            .collect()
    }

    pub fn bootnodes(&self) -> Result<Vec<Enr>, ConfigError> {
        self.overlay
            .bootnodes
            .iter()
            .map(|text| Enr::from_hex(text).map_err(ConfigError::BadBootnode))
            .collect()
    }
}
