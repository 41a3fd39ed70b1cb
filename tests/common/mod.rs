use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use peervault::config::{HandshakeModeConfig, NodeConfig};
use peervault::server::FileServer;

pub const SHARED_KEY: [u8; 32] = [0x42u8; 32];

/// Starts a node on `listen`, bootstrapped to `bootstrap`, rooted at `root`.
/// All nodes in a test share `SHARED_KEY` since replication depends on every
/// node being able to decrypt what another node encrypted for the wire.
pub async fn spin_up(listen: &str, bootstrap: &[&str], root: &Path) -> Arc<FileServer> {
    let mut config = NodeConfig::from_env(listen.parse::<SocketAddr>().unwrap()).unwrap();
    config.bootstrap_nodes = bootstrap.iter().map(|a| a.parse().unwrap()).collect();
    config.storage_root = root.to_string_lossy().into_owned();
    config.encryption_key = Some(hex::encode(SHARED_KEY));
    config.handshake = HandshakeModeConfig::Nop;
    config.reconnect_backoff = std::time::Duration::from_millis(20);
    let server = FileServer::new(config).unwrap();
    server.start().await.unwrap();
    server
}
