//! Node configuration and CLI wiring (spec §6, §4.J).
//!
//! `NodeConfig` is loaded from an optional TOML file, then overridden by
//! `PEERVAULT_*` environment variables, then validated — mirroring the
//! teacher's layered config-then-env-then-validate load order.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::HandshakeMode;

fn default_storage_root() -> String {
    "peervault-data".to_string()
}

fn default_max_file_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_chunk_size() -> usize {
    crate::chunk::DEFAULT_CHUNK_SIZE
}

fn default_max_concurrent_streams_per_peer() -> usize {
    8
}

fn default_stream_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_handshake_mode() -> HandshakeModeConfig {
    HandshakeModeConfig::Authenticated
}

/// Serde-friendly mirror of `transport::HandshakeMode` (kept distinct so the
/// transport module doesn't need to derive `Deserialize`/`clap::ValueEnum`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeModeConfig {
    Authenticated,
    Nop,
}

impl From<HandshakeModeConfig> for HandshakeMode {
    fn from(value: HandshakeModeConfig) -> Self {
        match value {
            HandshakeModeConfig::Authenticated => HandshakeMode::Authenticated,
            HandshakeModeConfig::Nop => HandshakeMode::Nop,
        }
    }
}

/// Every option in spec.md §6's configuration table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,

    #[serde(default)]
    pub bootstrap_nodes: Vec<SocketAddr>,

    #[serde(default = "default_storage_root")]
    pub storage_root: String,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// 32-byte secret, hex-encoded in TOML/env. Randomly generated if absent.
    #[serde(default)]
    pub encryption_key: Option<String>,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_max_concurrent_streams_per_peer")]
    pub max_concurrent_streams_per_peer: usize,

    #[serde(default = "default_stream_timeout", with = "humantime_serde")]
    pub stream_timeout: Duration,

    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,

    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,

    #[serde(default = "default_keep_alive_interval", with = "humantime_serde")]
    pub keep_alive_interval: Duration,

    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub health_timeout: Duration,

    #[serde(default = "default_reconnect_backoff", with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_handshake_mode")]
    pub handshake: HandshakeModeConfig,

    /// Strict mode: a `store` with at least one peer failure returns an
    /// aggregate error instead of succeeding best-effort (spec §4.F step 4).
    #[serde(default)]
    pub strict_replication: bool,
}

impl NodeConfig {
    /// Loads a config from a TOML file at `path`, applies `PEERVAULT_*`
    /// environment overrides, then validates.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(Error::Io)?;
        let mut config: NodeConfig = toml::from_str(&text)
            .map_err(|e| Error::ConfigInvalid(format!("failed to parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Builds a config with no file backing, from defaults plus environment
    /// overrides — used when `--config` is not passed on the CLI.
    pub fn from_env(listen_addr: SocketAddr) -> Result<Self> {
        let mut config = Self {
            listen_addr,
            bootstrap_nodes: Vec::new(),
            storage_root: default_storage_root(),
            max_file_size: default_max_file_size(),
            encryption_key: None,
            chunk_size: default_chunk_size(),
            max_concurrent_streams_per_peer: default_max_concurrent_streams_per_peer(),
            stream_timeout: default_stream_timeout(),
            connection_timeout: default_connection_timeout(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            keep_alive_interval: default_keep_alive_interval(),
            health_timeout: default_health_timeout(),
            reconnect_backoff: default_reconnect_backoff(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            handshake: default_handshake_mode(),
            strict_replication: false,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PEERVAULT_LISTEN_ADDR") {
            if let Ok(addr) = v.parse() {
                self.listen_addr = addr;
            }
        }
        if let Ok(v) = std::env::var("PEERVAULT_STORAGE_ROOT") {
            self.storage_root = v;
        }
        if let Ok(v) = std::env::var("PEERVAULT_ENCRYPTION_KEY") {
            self.encryption_key = Some(v);
        }
        if let Ok(v) = std::env::var("PEERVAULT_CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("PEERVAULT_STRICT_REPLICATION") {
            self.strict_replication = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::ConfigInvalid("chunk_size must be non-zero".into()));
        }
        if self.max_concurrent_streams_per_peer == 0 {
            return Err(Error::ConfigInvalid(
                "max_concurrent_streams_per_peer must be non-zero".into(),
            ));
        }
        if let Some(key) = &self.encryption_key {
            let bytes = hex::decode(key)
                .map_err(|e| Error::ConfigInvalid(format!("encryption_key is not valid hex: {e}")))?;
            if bytes.len() != 32 {
                return Err(Error::ConfigInvalid("encryption_key must decode to 32 bytes".into()));
            }
        }
        Ok(())
    }

    /// Decodes `encryption_key` into raw bytes, if present.
    pub fn encryption_key_bytes(&self) -> Result<Option<[u8; 32]>> {
        match &self.encryption_key {
            None => Ok(None),
            Some(hexstr) => {
                let raw = hex::decode(hexstr)
                    .map_err(|e| Error::ConfigInvalid(format!("encryption_key is not valid hex: {e}")))?;
                let arr: [u8; 32] = raw
                    .try_into()
                    .map_err(|_| Error::ConfigInvalid("encryption_key must decode to 32 bytes".into()))?;
                Ok(Some(arr))
            }
        }
    }
}

/// CLI flags for the `peervault` binary (spec §4.J).
#[derive(Debug, clap::Parser)]
#[command(name = "peervault", about = "Peer-to-peer, content-addressable distributed file store")]
pub struct Cli {
    /// Path to a TOML config file. If omitted, defaults plus env vars are used.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    /// Overrides `listen_addr` from the config file.
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,

    /// Adds a bootstrap peer address (repeatable).
    #[arg(long = "bootstrap")]
    pub bootstrap: Vec<SocketAddr>,

    /// Overrides `storage_root` from the config file.
    #[arg(long)]
    pub storage_root: Option<String>,

    /// Overrides the handshake mode; `nop` is for local testing only.
    #[arg(long)]
    pub handshake: Option<HandshakeModeConfig>,
}

impl Cli {
    /// Resolves a `NodeConfig` from `--config` (if given) plus CLI overrides.
    pub fn resolve(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => {
                let addr = self
                    .listen_addr
                    .ok_or_else(|| Error::ConfigInvalid("--listen-addr or --config is required".into()))?;
                NodeConfig::from_env(addr)?
            }
        };
        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if !self.bootstrap.is_empty() {
            config.bootstrap_nodes = self.bootstrap.clone();
        }
        if let Some(root) = &self.storage_root {
            config.storage_root = root.clone();
        }
        if let Some(mode) = self.handshake {
            config.handshake = mode;
        }
        config.validate()?;
        Ok(config)
    }
}
