//! Error types for PeerVault
//!
//! A single `thiserror` enum covers every failure surfaced at the core
//! boundary (spec §7). No panics escape a public operation; callers match on
//! these variants or simply propagate them with `?`.

use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found locally or on any peer: {0}")]
    NotFound(String),

    #[error("leaf already exists for key: {0}")]
    AlreadyExists(String),

    #[error("too many concurrent streams on peer {peer}")]
    TooManyStreams { peer: SocketAddr },

    #[error("peer {peer} is not ready ({state})")]
    NotReady { peer: SocketAddr, state: String },

    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("peer {peer} failed during {operation}: {detail}")]
    PeerFailure {
        peer: SocketAddr,
        operation: &'static str,
        detail: String,
    },

    #[error("decryption integrity check failed for key {0}")]
    CryptoIntegrity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("server already running")]
    AlreadyRunning,

    #[error("protocol decode error: {0}")]
    Protocol(String),

    #[error("server is stopped")]
    ServerStopped,
}

impl Error {
    /// Short machine-stable tag, handy for log fields and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::TooManyStreams { .. } => "too_many_streams",
            Error::NotReady { .. } => "not_ready",
            Error::Cancelled { .. } => "cancelled",
            Error::PeerFailure { .. } => "peer_failure",
            Error::CryptoIntegrity(_) => "crypto_integrity",
            Error::Io(_) => "io_failure",
            Error::ConfigInvalid(_) => "config_invalid",
            Error::AlreadyRunning => "already_running",
            Error::Protocol(_) => "protocol",
            Error::ServerStopped => "server_stopped",
        }
    }
}
