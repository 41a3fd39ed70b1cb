//! Chunk store and deduplicator (spec §4.C).
//!
//! Separate from the CAS store: splits a plaintext stream into fixed-size
//! chunks, content-addresses each one by SHA-256, and persists a unique
//! chunk exactly once regardless of how many logical files reference it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

use crate::cancel::CancellationToken;
use crate::content::{generate_content_id, ContentId};
use crate::error::{Error, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A fixed-size slice of a plaintext file, stored once and referenced by any
/// number of logical files via refcount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub content_id: ContentId,
}

struct ChunkEntry {
    ref_count: u32,
}

/// Content-addressed, refcounted chunk store. Safe for concurrent
/// `store`/`get`/`inc_ref`/`dec_ref`: refcount transitions are serialized
/// per chunk hash via a per-entry async mutex, the map itself via `DashMap`.
pub struct ChunkStore {
    root: PathBuf,
    entries: DashMap<String, Arc<Mutex<ChunkEntry>>>,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: DashMap::new(),
        }
    }

    fn chunk_path(&self, content_id: &ContentId) -> PathBuf {
        let (dir, file) = content_id.storage_path();
        self.root.join(dir).join(file)
    }

    fn entry_lock(&self, hash: &str) -> Arc<Mutex<ChunkEntry>> {
        self.entries
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ChunkEntry { ref_count: 0 })))
            .clone()
    }

    /// Stores `bytes` under its content id if new, otherwise bumps the
    /// refcount of the existing chunk. Returns the chunk either way.
    pub async fn store(&self, bytes: &[u8]) -> Result<Chunk> {
        let content_id = generate_content_id(bytes);
        let lock = self.entry_lock(&content_id.digest);
        let mut entry = lock.lock().await;
        if entry.ref_count == 0 {
            let path = self.chunk_path(&content_id);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, bytes).await?;
        }
        entry.ref_count += 1;
        Ok(Chunk { content_id })
    }

    pub async fn get(&self, content_id: &ContentId) -> Result<Vec<u8>> {
        if !self.entries.contains_key(&content_id.digest) {
            return Err(Error::NotFound(content_id.digest.clone()));
        }
        let path = self.chunk_path(content_id);
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(content_id.digest.clone())
            } else {
                Error::Io(e)
            }
        })
    }

    pub async fn ref_count(&self, content_id: &ContentId) -> u32 {
        match self.entries.get(&content_id.digest) {
            Some(lock) => lock.lock().await.ref_count,
            None => 0,
        }
    }

    /// Decrements the refcount, removing the chunk once it reaches zero.
    pub async fn dec_ref(&self, content_id: &ContentId) -> Result<()> {
        let Some(lock) = self.entries.get(&content_id.digest).map(|e| e.clone()) else {
            return Ok(());
        };
        let mut entry = lock.lock().await;
        if entry.ref_count > 0 {
            entry.ref_count -= 1;
        }
        if entry.ref_count == 0 {
            let path = self.chunk_path(content_id);
            let _ = fs::remove_file(&path).await;
            drop(entry);
            self.entries.remove(&content_id.digest);
        }
        Ok(())
    }
}

/// Splits plaintext into fixed-size chunks and deduplicates them through a
/// shared `ChunkStore`.
pub struct Deduplicator {
    store: Arc<ChunkStore>,
    chunk_size: usize,
}

impl Deduplicator {
    pub fn new(store: Arc<ChunkStore>, chunk_size: usize) -> Self {
        Self { store, chunk_size }
    }

    /// For each chunk of `reader`, stores it (incrementing refcount if it
    /// already existed) and returns one `Chunk` per logical slice in order.
    /// Checks `cancel` between chunks; chunks already persisted before a
    /// cancellation remain (append-only; pruned only via `delete_file`).
    pub async fn process_file<R>(&self, mut reader: R, cancel: &CancellationToken) -> Result<Vec<Chunk>>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunks = Vec::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    reason: "chunking cancelled".into(),
                });
            }
            let mut filled = 0;
            while filled < buf.len() {
                let n = reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            let chunk = self.store.store(&buf[..filled]).await?;
            chunks.push(chunk);
            if filled < buf.len() {
                break;
            }
        }
        Ok(chunks)
    }

    /// Lazily concatenates chunk bytes in order into one owned buffer.
    /// (A fully lazy `AsyncRead` adapter is unnecessary here: chunk reads
    /// are already bounded by `chunk_size` and the caller controls when
    /// reconstruction happens.)
    pub async fn reconstruct_file(&self, chunks: &[Chunk]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(self.store.get(&chunk.content_id).await?);
        }
        Ok(out)
    }

    /// Decrements the refcount for each referenced chunk, removing any whose
    /// refcount reaches zero.
    pub async fn delete_file(&self, chunks: &[Chunk]) -> Result<()> {
        // Collapse duplicate references within the same file so a repeated
        // chunk inside one logical file is only decremented once per
        // occurrence, matching how process_file incremented it.
        let mut counts: HashMap<String, (ContentId, u32)> = HashMap::new();
        for chunk in chunks {
            counts
                .entry(chunk.content_id.digest.clone())
                .and_modify(|(_, n)| *n += 1)
                .or_insert((chunk.content_id.clone(), 1));
        }
        for (_, (content_id, n)) in counts {
            for _ in 0..n {
                self.store.dec_ref(&content_id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn new_dedup(dir: &std::path::Path, chunk_size: usize) -> Deduplicator {
        Deduplicator::new(Arc::new(ChunkStore::new(dir.to_path_buf())), chunk_size)
    }

    #[tokio::test]
    async fn dedup_refcounts_across_two_stores_and_deletes() {
        let dir = tempdir().unwrap();
        let dedup = new_dedup(dir.path(), 8);
        let data = b"abcdefghijklmnop".to_vec(); // two 8-byte chunks

        let chunks_a = dedup.process_file(Cursor::new(data.clone()), &CancellationToken::new()).await.unwrap();
        let chunks_b = dedup.process_file(Cursor::new(data.clone()), &CancellationToken::new()).await.unwrap();
        assert_eq!(chunks_a.len(), 2);
        assert_eq!(chunks_a, chunks_b);

        for c in &chunks_a {
            assert_eq!(dedup.store.ref_count(&c.content_id).await, 2);
        }

        dedup.delete_file(&chunks_a).await.unwrap();
        for c in &chunks_a {
            assert_eq!(dedup.store.ref_count(&c.content_id).await, 1);
        }

        dedup.delete_file(&chunks_b).await.unwrap();
        for c in &chunks_a {
            let err = dedup.store.get(&c.content_id).await.unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn reconstruct_file_returns_original_bytes() {
        let dir = tempdir().unwrap();
        let dedup = new_dedup(dir.path(), 4);
        let data = b"0123456789".to_vec();
        let chunks = dedup.process_file(Cursor::new(data.clone()), &CancellationToken::new()).await.unwrap();
        let reconstructed = dedup.reconstruct_file(&chunks).await.unwrap();
        assert_eq!(reconstructed, data);
    }

    #[tokio::test]
    async fn cancellation_stops_early_but_keeps_persisted_chunks() {
        let dir = tempdir().unwrap();
        let dedup = new_dedup(dir.path(), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dedup
            .process_file(Cursor::new(b"some bytes".to_vec()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}
