//! Content-addressable store (spec §4.B).
//!
//! Maps a `LogicalKey` to a file under a per-node root directory. The path
//! is derived purely from `hash_key(logical_key)`; two nodes with the same
//! key resolve to the same path modulo their private roots.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncRead;

use crate::crypto::{self, hash_key, EncryptionKey};
use crate::error::{Error, Result};

const PREFIX_GROUPS: usize = 8;
const PREFIX_LEN: usize = 5;

/// `(pathName, filename)` derived from `SHA1(logicalKey)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub path_name: String,
    pub filename: String,
}

impl PathKey {
    pub fn for_logical_key(logical_key: &str) -> Self {
        let digest = hash_key(logical_key);
        let mut groups = Vec::with_capacity(PREFIX_GROUPS);
        for i in 0..PREFIX_GROUPS {
            let start = i * PREFIX_LEN;
            groups.push(&digest[start..start + PREFIX_LEN]);
        }
        PathKey {
            path_name: groups.join("/"),
            filename: digest,
        }
    }

    pub fn full_path(&self, root: &Path) -> PathBuf {
        root.join(&self.path_name).join(&self.filename)
    }

    /// First directory segment of the derived path (used by `delete`, which
    /// removes the whole 5-hex prefix subtree rather than just the leaf).
    fn first_segment(&self, root: &Path) -> PathBuf {
        let first = &self.path_name[..PREFIX_LEN];
        root.join(first)
    }
}

/// Maps `< > : " | ? * \ /` to `_`, strips leading/trailing spaces and dots,
/// and substitutes `default` for an otherwise empty name. Makes node-id and
/// address-derived roots safe on any filesystem, including Windows.
pub fn sanitize(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\\' | '/' => '_',
            other => other,
        })
        .collect();
    let trimmed = mapped.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A node-private content-addressable store rooted at `root`. `root` is
/// taken as a literal filesystem path (an operator-configured directory
/// typically holds real separators); callers that derive a root from an
/// untrusted identifier such as a node-id or peer address should pass it
/// through `sanitize` themselves first.
pub struct CasStore {
    root: PathBuf,
}

impl CasStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn has(&self, key: &str) -> bool {
        let path = PathKey::for_logical_key(key).full_path(&self.root);
        fs::metadata(path).await.is_ok()
    }

    /// Creates the leaf file exclusively (`O_CREAT | O_EXCL`), streaming
    /// `reader` into it verbatim. Fails with `AlreadyExists` if the leaf is
    /// already present.
    pub async fn write<R>(&self, key: &str, mut reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let path_key = PathKey::for_logical_key(key);
        let path = path_key.full_path(&self.root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = self.create_exclusive(&path).await?;
        let result = tokio::io::copy(&mut reader, &mut file).await;
        match result {
            Ok(n) => Ok(n),
            Err(e) => {
                let _ = fs::remove_file(&path).await;
                Err(Error::Io(e))
            }
        }
    }

    /// As `write`, but decrypts `enc_reader` (ciphertext as received from a
    /// peer) and re-encrypts it fresh before persisting, so every CAS leaf
    /// keeps the same at-rest invariant regardless of provenance: a random
    /// IV this node generated itself (spec §4.F step 4, resolving the
    /// source's inconsistent `WriteDecrypt` call sites — see DESIGN.md).
    /// Returns the decrypted plaintext so callers that also need it (e.g. to
    /// satisfy a waiting local `get`) don't have to decrypt twice. A leaf
    /// that already exists (this node already had the key) is not an error
    /// here: the caller still gets the plaintext back.
    pub async fn write_decrypt<R>(&self, key: &str, enc_reader: R, enc_key: &EncryptionKey) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut plaintext = Vec::new();
        crypto::copy_decrypt(enc_key, enc_reader, &mut plaintext).await?;
        match self.write_encrypted(key, &plaintext, enc_key).await {
            Ok(_) | Err(Error::AlreadyExists(_)) => Ok(plaintext),
            Err(e) => Err(e),
        }
    }

    async fn create_exclusive(&self, path: &Path) -> Result<File> {
        match OpenOptions::new().write(true).create_new(true).open(path).await {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::AlreadyExists(path.display().to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Opens the leaf for reading, returning its size and a reader.
    pub async fn read(&self, key: &str) -> Result<(u64, File)> {
        let path = PathKey::for_logical_key(key).full_path(&self.root);
        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(key.to_string())
            } else {
                Error::Io(e)
            }
        })?;
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Removes the first 5-hex prefix subtree of the derived path.
    /// Best-effort: a missing path surfaces the platform `NotFound` error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path_key = PathKey::for_logical_key(key);
        let dir = path_key.first_segment(&self.root);
        fs::remove_dir_all(dir).await.map_err(Error::Io)
    }

    /// Opens a decrypted reader over a stored leaf (used by `get`).
    pub async fn read_decrypted(&self, key: &str, enc_key: &EncryptionKey) -> Result<Vec<u8>> {
        let (_, file) = self.read(key).await?;
        let mut out = Vec::new();
        crypto::copy_decrypt(enc_key, file, &mut out).await?;
        Ok(out)
    }

    /// Encrypts `plaintext` under `enc_key` and stores it at `key`.
    pub async fn write_encrypted(&self, key: &str, plaintext: &[u8], enc_key: &EncryptionKey) -> Result<u64> {
        let path_key = PathKey::for_logical_key(key);
        let path = path_key.full_path(&self.root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = self.create_exclusive(&path).await?;
        let n = crypto::copy_encrypt(enc_key, plaintext, &mut file).await;
        match n {
            Ok(n) => Ok(n),
            Err(e) => {
                let _ = fs::remove_file(&path).await;
                Err(e)
            }
        }
    }
}
