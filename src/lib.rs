//! PeerVault — a peer-to-peer, content-addressable distributed file store.
//!
//! Nodes form a mesh over TCP, authenticate each other, and cooperatively
//! store, retrieve, and replicate encrypted byte streams keyed by
//! client-supplied logical names. See [`FileServer`] for the collaborator
//! facing surface.

pub mod cancel;
pub mod cas;
pub mod chunk;
pub mod config;
pub mod content;
pub mod crypto;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod transport;

pub use error::{Error, Result};
pub use server::FileServer;
