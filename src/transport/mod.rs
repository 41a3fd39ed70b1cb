//! Framed TCP transport (spec §4.D).
//!
//! A listener accepts connections, a dialer initiates them. Every accepted
//! or dialed connection is wrapped in a `Peer`, handshaked, and offered to
//! the owning file server through the `PeerObserver` callback — the
//! cyclic transport/server reference the source had is avoided by making
//! the transport generic over that callback and injecting the server at
//! construction (spec §9).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::crypto::NodeId;
use crate::error::{Error, Result};
use crate::peer::{Peer, PeerState};
use crate::protocol::{self, Frame, Handshake, Payload, PROTOCOL_VERSION};

/// How a peer's identity is established at connection open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    /// Production: exchange and validate `Handshake` DTOs.
    Authenticated,
    /// Tests only: skip the exchange, synthesize a random remote id.
    Nop,
}

/// Injected at `Transport` construction so new peers can be offered to
/// their owner without the transport needing to know what that owner is.
#[async_trait::async_trait]
pub trait PeerObserver: Send + Sync {
    /// Called once a peer has completed its handshake and is `Ready`.
    /// Returning `Err` causes the transport to close the connection
    /// (`onPeerError` in spec terms) — used to reject duplicate node ids.
    /// Takes `Arc<Self>` so implementors (always held as `Arc<FileServer>`)
    /// can spawn tasks that outlive this call without a second reference
    /// type to the same server.
    async fn on_peer(self: Arc<Self>, peer: Arc<Peer>) -> Result<()>;
}

pub struct TransportConfig {
    pub listen_addr: SocketAddr,
    pub handshake_mode: HandshakeMode,
    pub handshake_timeout: Duration,
    pub max_concurrent_streams_per_peer: usize,
}

pub struct Transport {
    config: TransportConfig,
    local_node_id: NodeId,
    observer: Arc<dyn PeerObserver>,
}

impl Transport {
    pub fn new(config: TransportConfig, local_node_id: NodeId, observer: Arc<dyn PeerObserver>) -> Self {
        Self {
            config,
            local_node_id,
            observer,
        }
    }

    /// Binds the listener and runs the accept loop until the socket errors
    /// or is dropped. Spawns itself onto the current runtime; callers keep
    /// the returned `JoinHandle` to know when the listener has yielded.
    pub async fn listen(self: Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "transport listening");
        let this = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.accept_one(stream, addr).await {
                                warn!(peer = %addr, error = %e, "inbound handshake failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "listener accept failed, stopping");
                        break;
                    }
                }
            }
        }))
    }

    async fn accept_one(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let peer = Peer::new(stream, addr, self.config.max_concurrent_streams_per_peer);
        self.handshake(&peer, true).await?;
        self.observer.clone().on_peer(peer.clone()).await.map_err(|e| {
            // `onPeerError`: observer rejected the peer (e.g. duplicate id).
            Error::PeerFailure {
                peer: addr,
                operation: "on_peer",
                detail: e.to_string(),
            }
        })
    }

    /// Dials a single bootstrap address, handshakes, and offers the new
    /// peer to the observer. Retried by the file server's bootstrap loop.
    pub async fn dial(&self, addr: SocketAddr) -> Result<Arc<Peer>> {
        let stream = timeout(self.config.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Cancelled {
                reason: format!("connect to {addr} timed out"),
            })??;
        let peer = Peer::new(stream, addr, self.config.max_concurrent_streams_per_peer);
        self.handshake(&peer, false).await?;
        self.observer.clone().on_peer(peer.clone()).await.map_err(|e| Error::PeerFailure {
            peer: addr,
            operation: "on_peer",
            detail: e.to_string(),
        })?;
        Ok(peer)
    }

    async fn handshake(&self, peer: &Arc<Peer>, inbound: bool) -> Result<()> {
        peer.set_state(PeerState::Handshaking);
        match self.config.handshake_mode {
            HandshakeMode::Nop => {
                *peer.remote_node_id.write() = Some(NodeId::generate());
            }
            HandshakeMode::Authenticated => {
                let local = Handshake {
                    node_id: self.local_node_id,
                    protocol_version: PROTOCOL_VERSION,
                    capabilities: vec!["store".into(), "get".into()],
                };
                let exchange = async {
                    // Order doesn't need to be fixed across both sides —
                    // each half writes then reads on its own connection
                    // object, and TCP delivers both independently.
                    peer.send_handshake(&Payload::Handshake(local.clone())).await?;
                    let mut read_half = peer.read_half.lock().await.take().expect("read half present before handshake");
                    let frame = protocol::read_frame(&mut read_half).await?;
                    *peer.read_half.lock().await = Some(read_half);
                    match frame {
                        Frame::Message(Payload::Handshake(remote)) => Ok(remote),
                        _ => Err(Error::Protocol("expected handshake frame".into())),
                    }
                };
                let remote = timeout(self.config.handshake_timeout, exchange)
                    .await
                    .map_err(|_| Error::Cancelled {
                        reason: "handshake timed out".into(),
                    })??;
                if remote.protocol_version != PROTOCOL_VERSION {
                    return Err(Error::Protocol(format!(
                        "unsupported protocol version {}",
                        remote.protocol_version
                    )));
                }
                *peer.remote_node_id.write() = Some(remote.node_id);
            }
        }
        peer.set_state(PeerState::Ready);
        peer.touch();
        debug!(
            peer = %peer.address,
            node_id = %peer.node_id().unwrap(),
            inbound,
            "handshake complete"
        );
        Ok(())
    }
}
