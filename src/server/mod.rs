//! File server (spec §4.F) — the core: owns the peer table, the CAS store,
//! the encryption key, the optional dedup layer, and the store/get event
//! loop.

use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::cas::CasStore;
use crate::chunk::{ChunkStore, Deduplicator};
use crate::config::NodeConfig;
use crate::crypto::{self, EncryptionKey, NodeId};
use crate::error::{Error, Result};
use crate::peer::{Peer, PeerState, PeerSummary};
use crate::protocol::Payload;
use crate::transport::{HandshakeMode, PeerObserver, Transport, TransportConfig};

struct Tasks {
    listener: Option<JoinHandle<()>>,
    health_sweep: Option<JoinHandle<()>>,
}

/// The collaborator-facing node (spec §6's `peervault::Node`). One per
/// process; construct with `FileServer::new`, then `start()`.
pub struct FileServer {
    config: NodeConfig,
    node_id: NodeId,
    encryption_key: EncryptionKey,
    cas: CasStore,
    dedup: Option<Deduplicator>,
    peers: RwLock<HashMap<SocketAddr, Arc<Peer>>>,
    pending_gets: DashMap<String, Vec<oneshot::Sender<Vec<u8>>>>,
    running: AtomicBool,
    transport: RwLock<Option<Arc<Transport>>>,
    tasks: tokio::sync::Mutex<Tasks>,
    /// Cancelled by `stop()`; raced against every in-flight `store`/`get` so
    /// a shutdown doesn't have to wait for them to finish on their own.
    shutdown: CancellationToken,
}

impl FileServer {
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        let encryption_key = match config.encryption_key_bytes()? {
            Some(bytes) => EncryptionKey::from_bytes(bytes),
            None => EncryptionKey::generate(),
        };
        let cas = CasStore::new(config.storage_root.as_str());
        let dedup = {
            let chunk_root = cas.root().join("chunks");
            Some(Deduplicator::new(Arc::new(ChunkStore::new(chunk_root)), config.chunk_size))
        };
        Ok(Arc::new(Self {
            node_id: NodeId::generate(),
            encryption_key,
            cas,
            dedup,
            peers: RwLock::new(HashMap::new()),
            pending_gets: DashMap::new(),
            running: AtomicBool::new(false),
            transport: RwLock::new(None),
            tasks: tokio::sync::Mutex::new(Tasks {
                listener: None,
                health_sweep: None,
            }),
            shutdown: CancellationToken::new(),
            config,
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Deadline `main` passes to `stop()` for an orderly shutdown; exposed
    /// since `config` is otherwise private.
    pub fn connection_timeout(&self) -> Duration {
        self.config.connection_timeout
    }

    fn require_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::ServerStopped)
        }
    }

    /// Binds the transport, dials bootstrap addresses, and starts the
    /// health sweep. Idempotent: a second call fails with `AlreadyRunning`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            self.running.store(true, Ordering::Release);
            return Err(Error::AlreadyRunning);
        }

        let transport_config = TransportConfig {
            listen_addr: self.config.listen_addr,
            handshake_mode: HandshakeMode::from(self.config.handshake),
            handshake_timeout: self.config.connection_timeout,
            max_concurrent_streams_per_peer: self.config.max_concurrent_streams_per_peer,
        };
        let transport = Arc::new(Transport::new(transport_config, self.node_id, self.clone()));
        let listener = transport.clone().listen().await?;
        *self.transport.write() = Some(transport.clone());

        self.bootstrap(transport.clone());

        let health_sweep = tokio::spawn(self.clone().run_health_sweep());

        let mut tasks = self.tasks.lock().await;
        tasks.listener = Some(listener);
        tasks.health_sweep = Some(health_sweep);
        info!(addr = %self.config.listen_addr, node_id = %self.node_id, "file server started");
        Ok(())
    }

    /// Dials every bootstrap address concurrently with exponential backoff,
    /// retrying up to `max_reconnect_attempts`. Failures are logged and do
    /// not prevent the server from being `Ready` (spec §4.F "bootstrap").
    fn bootstrap(self: &Arc<Self>, transport: Arc<Transport>) {
        for addr in self.config.bootstrap_nodes.clone() {
            let transport = transport.clone();
            let base_backoff = self.config.reconnect_backoff;
            let max_attempts = self.config.max_reconnect_attempts;
            tokio::spawn(async move {
                let mut attempt = 0u32;
                loop {
                    match transport.dial(addr).await {
                        Ok(_) => {
                            info!(peer = %addr, "bootstrap dial succeeded");
                            return;
                        }
                        Err(e) => {
                            attempt += 1;
                            if attempt >= max_attempts {
                                warn!(peer = %addr, error = %e, attempt, "bootstrap dial giving up");
                                return;
                            }
                            let backoff = base_backoff * 2u32.pow(attempt.min(16));
                            debug!(peer = %addr, error = %e, attempt, ?backoff, "bootstrap dial failed, retrying");
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            });
        }
    }

    async fn run_health_sweep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.health_timeout / 2);
        loop {
            interval.tick().await;
            let stale: Vec<SocketAddr> = self
                .peers
                .read()
                .values()
                .filter(|p| p.last_seen().elapsed() > self.config.health_timeout)
                .map(|p| p.address)
                .collect();
            for addr in stale {
                warn!(peer = %addr, "evicting peer on health timeout");
                self.remove_peer(addr).await;
            }
        }
    }

    /// Stops accepting new streams, cancels every in-flight `store`/`get`
    /// (they return `Error::Cancelled` rather than hang), and closes all
    /// peers, waiting at most `deadline` for each to finish closing.
    /// Guarantees no new peers are admitted after this returns.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();

        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.listener.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.health_sweep.take() {
            handle.abort();
        }
        drop(tasks);

        let peers: Vec<Arc<Peer>> = self.peers.write().drain().map(|(_, p)| p).collect();
        for peer in peers {
            if tokio::time::timeout(deadline, peer.close()).await.is_err() {
                warn!(peer = %peer.address, "peer close did not finish before shutdown deadline");
            }
        }
        *self.transport.write() = None;
        info!("file server stopped");
        Ok(())
    }

    async fn remove_peer(&self, addr: SocketAddr) {
        if let Some(peer) = self.peers.write().remove(&addr) {
            peer.close().await;
        }
    }

    fn peer_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.peer_snapshot().iter().filter_map(|p| p.summary()).collect()
    }

    pub async fn has(&self, key: &str) -> bool {
        self.cas.has(key).await
    }

    /// Writes locally, then replicates to every peer (spec §4.F "store
    /// protocol"). Best-effort by default; `strict_replication` in config
    /// turns a partial replication failure into an error. Races the whole
    /// operation against shutdown: a `stop()` call cancels it in place of
    /// letting it run to completion, dropping the in-flight peer streams so
    /// `stop()` isn't left waiting behind a write lock they hold.
    pub async fn store<R>(&self, key: &str, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        self.require_running()?;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Cancelled {
                reason: "server stopping".into(),
            }),
            result = self.store_inner(key, reader) => result,
        }
    }

    async fn store_inner<R>(&self, key: &str, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext).await?;
        if plaintext.len() as u64 > self.config.max_file_size {
            return Err(Error::ConfigInvalid(format!(
                "payload of {} bytes exceeds max_file_size ({} bytes)",
                plaintext.len(),
                self.config.max_file_size
            )));
        }

        self.cas.write_encrypted(key, &plaintext, &self.encryption_key).await?;

        if let Some(dedup) = &self.dedup {
            dedup.process_file(Cursor::new(plaintext.clone()), &self.shutdown).await?;
        }

        let size_on_wire = crypto::encrypted_len(plaintext.len() as u64);
        let announce = Payload::StoreFile {
            node_id: self.node_id,
            key: key.to_string(),
            size: size_on_wire,
        };
        let peers = self.peer_snapshot();

        let plaintext = Arc::new(plaintext);
        let key_owned = Arc::new(key.to_string());
        let fanout = self.config.max_concurrent_streams_per_peer;
        let peer_count = peers.len();
        let results: Vec<_> = stream::iter(peers.into_iter())
            .map(|peer| {
                let plaintext = plaintext.clone();
                let key_owned = key_owned.clone();
                let announce = announce.clone();
                async move {
                    // Announce and stream are written under one hold of the
                    // peer's write lock so a concurrent store/get to the same
                    // peer can't interleave a frame between the two.
                    let r = peer
                        .send_announced_stream(&announce, &self.encryption_key, Cursor::new(plaintext.as_slice()), true)
                        .await;
                    (peer, key_owned, r)
                }
            })
            .buffer_unordered(fanout.max(1))
            .collect()
            .await;

        let mut failures = Vec::new();
        for (peer, key_owned, result) in results {
            if let Err(e) = result {
                warn!(peer = %peer.address, key = %key_owned, error = %e, "store replication failed, continuing with remaining peers");
                failures.push((peer.address, e));
            }
        }

        if self.config.strict_replication && !failures.is_empty() {
            let (addr, _) = &failures[0];
            return Err(Error::PeerFailure {
                peer: *addr,
                operation: "store",
                detail: format!("{} of {} peer(s) failed replication", failures.len(), peer_count),
            });
        }
        Ok(())
    }

    /// Returns locally if present; otherwise broadcasts a request and waits
    /// for the first peer response (spec §4.F "get protocol"). Races against
    /// shutdown the same way `store` does.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.require_running()?;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Cancelled {
                reason: "server stopping".into(),
            }),
            result = self.get_inner(key) => result,
        }
    }

    async fn get_inner(&self, key: &str) -> Result<Vec<u8>> {
        if self.cas.has(key).await {
            return self.cas.read_decrypted(key, &self.encryption_key).await;
        }

        let (tx, rx) = oneshot::channel();
        self.pending_gets.entry(key.to_string()).or_default().push(tx);

        let request = Payload::GetFile {
            node_id: self.node_id,
            key: key.to_string(),
        };
        let peers = self.peer_snapshot();
        self.broadcast(&request, &peers).await;

        match tokio::time::timeout(self.config.stream_timeout, rx).await {
            Ok(Ok(plaintext)) => Ok(plaintext),
            _ => {
                self.pending_gets.remove(key);
                Err(Error::NotFound(key.to_string()))
            }
        }
    }

    /// Removes the CAS leaf for `key`. Whether this also releases dedup
    /// chunk refcounts is left a per-deployment decision (spec §9 open
    /// question) — see DESIGN.md; this implementation does not maintain a
    /// key-to-chunks index, so dedup refcounts are unaffected by `delete`.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.require_running()?;
        self.cas.delete(key).await
    }

    async fn broadcast(&self, payload: &Payload, peers: &[Arc<Peer>]) {
        for peer in peers {
            if let Err(e) = peer.send(payload).await {
                warn!(peer = %peer.address, error = %e, "broadcast to peer failed, continuing");
            }
        }
    }

    /// Decrypts an inbound ciphertext stream and re-encrypts it fresh for
    /// local persistence (spec §1: "re-encrypting for local persistence on
    /// arrival"), then delivers the plaintext to the first caller waiting
    /// on a matching `get`, if any.
    async fn handle_incoming_stream<R>(&self, key: &str, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut ciphertext = Vec::new();
        reader.read_to_end(&mut ciphertext).await?;
        let plaintext = self
            .cas
            .write_decrypt(key, Cursor::new(ciphertext), &self.encryption_key)
            .await?;

        if let Some((_, waiters)) = self.pending_gets.remove(key) {
            if let Some(first) = waiters.into_iter().next() {
                let _ = first.send(plaintext);
            }
        }
        Ok(())
    }

    /// Services a `GetFile` request from a peer: if this node has the key,
    /// responds with the same announce-then-stream shape used by `store`.
    async fn handle_get_request(&self, peer: &Arc<Peer>, key: &str) {
        if !self.cas.has(key).await {
            return;
        }
        let plaintext = match self.cas.read_decrypted(key, &self.encryption_key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %peer.address, key, error = %e, "failed to serve get request");
                return;
            }
        };
        let size_on_wire = crypto::encrypted_len(plaintext.len() as u64);
        let announce = Payload::StoreFile {
            node_id: self.node_id,
            key: key.to_string(),
            size: size_on_wire,
        };
        if let Err(e) = peer
            .send_announced_stream(&announce, &self.encryption_key, Cursor::new(plaintext), true)
            .await
        {
            warn!(peer = %peer.address, key, error = %e, "failed to stream get response");
        }
    }

    /// Continuously decodes frames off one peer's connection, dispatching
    /// control messages and their paired data streams, until the connection
    /// errors or closes. Spawned once per peer from `on_peer`.
    async fn run_peer_reader(self: Arc<Self>, peer: Arc<Peer>) {
        let mut read_half = match peer.read_half.lock().await.take() {
            Some(rh) => rh,
            None => return,
        };
        loop {
            let frame = match crate::protocol::read_frame(&mut read_half).await {
                Ok(f) => f,
                Err(e) => {
                    debug!(peer = %peer.address, error = %e, "peer read loop ending");
                    break;
                }
            };
            peer.touch();
            match frame {
                crate::protocol::Frame::Message(Payload::StoreFile { key, size, .. }) => {
                    match crate::protocol::read_frame(&mut read_half).await {
                        Ok(crate::protocol::Frame::Stream) => {
                            let limited = (&mut read_half).take(size);
                            if let Err(e) = self.handle_incoming_stream(&key, limited).await {
                                warn!(peer = %peer.address, key, error = %e, "failed to land incoming stream");
                            }
                        }
                        _ => {
                            warn!(peer = %peer.address, "expected stream frame after StoreFile announce");
                            break;
                        }
                    }
                }
                crate::protocol::Frame::Message(Payload::GetFile { key, .. }) => {
                    self.handle_get_request(&peer, &key).await;
                }
                crate::protocol::Frame::Message(Payload::Handshake(_)) => {
                    debug!(peer = %peer.address, "ignoring post-handshake handshake frame");
                }
                crate::protocol::Frame::Stream => {
                    warn!(peer = %peer.address, "unsolicited stream frame with no announce, dropping connection");
                    break;
                }
            }
        }
        self.remove_peer(peer.address).await;
    }
}

#[async_trait::async_trait]
impl PeerObserver for FileServer {
    async fn on_peer(self: Arc<Self>, peer: Arc<Peer>) -> Result<()> {
        if let Some(id) = peer.node_id() {
            let duplicate = self.peers.read().values().any(|p| p.node_id() == Some(id));
            if duplicate {
                return Err(Error::PeerFailure {
                    peer: peer.address,
                    operation: "on_peer",
                    detail: "duplicate node id already connected".into(),
                });
            }
        }
        self.peers.write().insert(peer.address, peer.clone());
        peer.set_state(PeerState::Ready);
        tokio::spawn(self.clone().run_peer_reader(peer));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_server(storage_root: &std::path::Path) -> Arc<FileServer> {
        let mut config = NodeConfig::from_env("127.0.0.1:0".parse().unwrap()).unwrap();
        config.storage_root = storage_root.to_string_lossy().into_owned();
        FileServer::new(config).unwrap()
    }

    /// A `Peer` wired to a real (but otherwise unused) loopback connection,
    /// so it's a legitimate `Arc<Peer>` for the peer table without needing
    /// a full transport/handshake round trip. `addr` is the logical key the
    /// table is keyed on — independent of the loopback port underneath.
    async fn bare_peer(addr: SocketAddr) -> Arc<Peer> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let accept_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut stream, &mut sink).await;
            }
        });
        let stream = TcpStream::connect(accept_addr).await.unwrap();
        Peer::new(stream, addr, 1)
    }

    /// Spec §5/§8: the peer table is protected by a reader/writer mutex;
    /// concurrent add/remove across many threads must leave
    /// `|peers| == |{added} - {removed}|` with no duplicate address.
    #[tokio::test]
    async fn peer_table_concurrent_add_remove_maintains_count_and_uniqueness() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path()).await;

        const N: usize = 64;
        let addrs: Vec<SocketAddr> = (0..N)
            .map(|i| format!("127.0.0.1:{}", 45000 + i).parse().unwrap())
            .collect();

        let mut peers = Vec::with_capacity(N);
        for &addr in &addrs {
            peers.push(bare_peer(addr).await);
        }

        // Even-indexed addresses are added and kept; odd-indexed ones are
        // added and then removed by the same thread, racing every other
        // thread's add/remove against this table's single RwLock.
        std::thread::scope(|scope| {
            for (i, (addr, peer)) in addrs.iter().copied().zip(peers).enumerate() {
                let server = &server;
                scope.spawn(move || {
                    server.peers.write().insert(addr, peer);
                    if i % 2 == 1 {
                        server.peers.write().remove(&addr);
                    }
                });
            }
        });

        let table = server.peers.read();
        let expected: HashSet<SocketAddr> = addrs
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 2 == 0)
            .map(|(_, a)| *a)
            .collect();
        let actual: HashSet<SocketAddr> = table.keys().copied().collect();
        assert_eq!(actual, expected, "surviving addresses must be exactly the added-and-not-removed set");
        assert_eq!(table.len(), expected.len(), "no duplicate address collapsed the count");
    }
}
