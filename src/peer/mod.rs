//! Peer session (spec §4.E).
//!
//! Each peer runs under a single TCP connection, exposing `send`,
//! `send_stream`, and a read loop, guarded by a small state machine and a
//! per-peer stream semaphore.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncRead, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};

use crate::crypto::{self, EncryptionKey, NodeId};
use crate::error::{Error, Result};
use crate::protocol::{self, Payload};

/// `Dialing -> Handshaking -> Ready -> {Closing -> Closed | Failed}`.
/// Only in `Ready` may `send`/`send_stream` succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Dialing,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Decrements a peer's in-flight stream count on drop, so a cancelled
/// `send_stream`/`send_announced_stream` (e.g. dropped mid-`.await` by a
/// `tokio::select!` losing to shutdown) still releases its slot instead of
/// leaking it.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Read-only projection of a `Peer`, safe to hand out from `peers()`.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub id: NodeId,
    pub address: SocketAddr,
    pub last_seen: Instant,
    pub in_flight_streams: usize,
}

/// A counterparty node known to this node: an active connection plus
/// metadata. Owned by the transport, referenced (non-owning) by the file
/// server.
pub struct Peer {
    pub remote_node_id: RwLock<Option<NodeId>>,
    pub address: SocketAddr,
    write_half: Mutex<WriteHalf<TcpStream>>,
    pub(crate) read_half: Mutex<Option<ReadHalf<TcpStream>>>,
    state: RwLock<PeerState>,
    last_seen_millis: AtomicU64,
    started_at: Instant,
    stream_semaphore: Arc<Semaphore>,
    max_concurrent_streams: usize,
    in_flight: AtomicUsize,
}

impl Peer {
    pub fn new(stream: TcpStream, address: SocketAddr, max_concurrent_streams: usize) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        Arc::new(Self {
            remote_node_id: RwLock::new(None),
            address,
            write_half: Mutex::new(write_half),
            read_half: Mutex::new(Some(read_half)),
            state: RwLock::new(PeerState::Dialing),
            last_seen_millis: AtomicU64::new(0),
            started_at: Instant::now(),
            stream_semaphore: Arc::new(Semaphore::new(max_concurrent_streams)),
            max_concurrent_streams,
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.write() = state;
    }

    pub fn node_id(&self) -> Option<NodeId> {
        *self.remote_node_id.read()
    }

    pub fn touch(&self) {
        let elapsed = self.started_at.elapsed().as_millis() as u64;
        self.last_seen_millis.store(elapsed, Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> Instant {
        self.started_at + Duration::from_millis(self.last_seen_millis.load(Ordering::Relaxed))
    }

    pub fn in_flight_streams(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> Option<PeerSummary> {
        self.node_id().map(|id| PeerSummary {
            id,
            address: self.address,
            last_seen: self.last_seen(),
            in_flight_streams: self.in_flight_streams(),
        })
    }

    fn require_ready(&self) -> Result<()> {
        let state = self.state();
        if state != PeerState::Ready {
            return Err(Error::NotReady {
                peer: self.address,
                state: state.to_string(),
            });
        }
        Ok(())
    }

    /// Writes a framed `Payload`, serialized on the peer's write lock.
    pub async fn send(&self, payload: &Payload) -> Result<()> {
        self.require_ready()?;
        let mut write_half = self.write_half.lock().await;
        protocol::write_message(&mut *write_half, payload).await
    }

    /// Writes a handshake message even before the peer reaches `Ready`
    /// (handshakes happen in the `Handshaking` state, not `Ready`).
    pub async fn send_handshake(&self, payload: &Payload) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        protocol::write_message(&mut *write_half, payload).await
    }

    async fn acquire_stream_permit(&self, blocking: bool) -> Result<tokio::sync::OwnedSemaphorePermit> {
        if blocking {
            self.stream_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::PeerFailure {
                    peer: self.address,
                    operation: "send_stream",
                    detail: "semaphore closed".into(),
                })
        } else {
            self.stream_semaphore
                .clone()
                .try_acquire_owned()
                .map_err(|_| Error::TooManyStreams { peer: self.address })
        }
    }

    /// Acquires a stream permit, writes the stream frame header, then
    /// `copy_encrypt`s `reader` into the connection. Fails with
    /// `TooManyStreams` if the semaphore is exhausted and `blocking` is
    /// false; otherwise waits for a permit to free up.
    pub async fn send_stream<R>(&self, key: &EncryptionKey, reader: R, blocking: bool) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.require_ready()?;
        let permit = self.acquire_stream_permit(blocking).await?;
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let _guard = InFlightGuard(&self.in_flight);
        let mut write_half = self.write_half.lock().await;
        protocol::write_stream_header(&mut *write_half).await?;
        let result = crypto::copy_encrypt(key, reader, &mut *write_half).await;
        drop(permit);
        result
    }

    /// As `send_stream`, but writes `announce` first under the same hold of
    /// the write lock, so the stream frame immediately follows its own
    /// announce on the wire with no other `send`/`send_stream` call able to
    /// interleave a frame in between. The receiver relies on this pairing:
    /// it reads one `Stream` frame right after a `StoreFile` message and
    /// assumes it belongs to that announce.
    pub async fn send_announced_stream<R>(
        &self,
        announce: &Payload,
        key: &EncryptionKey,
        reader: R,
        blocking: bool,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.require_ready()?;
        let permit = self.acquire_stream_permit(blocking).await?;
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let _guard = InFlightGuard(&self.in_flight);
        let mut write_half = self.write_half.lock().await;
        protocol::write_message(&mut *write_half, announce).await?;
        protocol::write_stream_header(&mut *write_half).await?;
        let result = crypto::copy_encrypt(key, reader, &mut *write_half).await;
        drop(permit);
        result
    }

    pub fn max_concurrent_streams(&self) -> usize {
        self.max_concurrent_streams
    }

    pub fn stream_semaphore(&self) -> Arc<Semaphore> {
        self.stream_semaphore.clone()
    }

    /// Closes the connection. Idempotent.
    pub async fn close(&self) {
        self.set_state(PeerState::Closing);
        let mut write_half = self.write_half.lock().await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut *write_half).await;
        self.set_state(PeerState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display_matches_debug() {
        assert_eq!(PeerState::Ready.to_string(), "Ready");
    }
}
