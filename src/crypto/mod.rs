//! Streaming encryption pipeline (spec §4.A).
//!
//! Generates the per-node `NodeId` and `EncryptionKey`, and exposes
//! `copy_encrypt` / `copy_decrypt` / `hash_key` as the three primitives the
//! rest of the crate builds on. The pipeline never buffers an entire
//! plaintext: it reads and writes in fixed-size blocks, authenticating each
//! block independently with AES-256-GCM.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use sha1::{Digest as Sha1Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Plaintext block size the streaming cipher operates on. Independent from
/// the dedup chunk size in `crate::chunk` even though both default to 64 KiB.
pub const CRYPTO_BLOCK_SIZE: usize = 64 * 1024;
pub const IV_SIZE: usize = 16;
const TAG_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;

/// 32-byte random identifier, stable for a node's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// 32-byte symmetric secret. Encrypts any plaintext leaving the node's
/// process boundary and any plaintext at rest.
#[derive(Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&self.0).expect("key is exactly 32 bytes")
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Derives a per-block 96-bit nonce from the stream salt and a block
/// counter. The salt is random per stream; XORing the counter into its
/// trailing bytes keeps every block's nonce unique without needing a
/// separate nonce per block on the wire.
fn derive_nonce(salt: &[u8; IV_SIZE], counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&salt[..NONCE_SIZE]);
    let counter_bytes = counter.to_be_bytes();
    for i in 0..8 {
        nonce[NONCE_SIZE - 8 + i] ^= counter_bytes[i];
    }
    nonce
}

/// Reads into `buf` until it is full or the source reaches EOF, returning
/// the number of bytes actually read (may be less than `buf.len()` at EOF).
async fn read_block<R: AsyncRead + Unpin>(src: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Encrypts `src` into `dst`, writing a random 16-byte salt first. Returns
/// the number of plaintext bytes copied. Never buffers more than one block.
pub async fn copy_encrypt<R, W>(key: &EncryptionKey, mut src: R, mut dst: W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut salt = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    dst.write_all(&salt).await?;

    let cipher = key.cipher();
    let mut buf = vec![0u8; CRYPTO_BLOCK_SIZE];
    let mut counter: u64 = 0;
    let mut total: u64 = 0;

    loop {
        let n = read_block(&mut src, &mut buf).await?;
        let nonce_bytes = derive_nonce(&salt, counter);
        let aad = counter.to_be_bytes();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &buf[..n],
                    aad: &aad,
                },
            )
            .map_err(|_| Error::CryptoIntegrity("encryption failure".into()))?;
        dst.write_all(&ciphertext).await?;
        total += n as u64;
        counter += 1;
        if n < buf.len() {
            break;
        }
    }
    dst.flush().await?;
    Ok(total)
}

/// Decrypts `src` (as produced by `copy_encrypt`) into `dst`. Returns the
/// number of plaintext bytes written. Any tampering with the ciphertext
/// surfaces as `Error::CryptoIntegrity`.
pub async fn copy_decrypt<R, W>(key: &EncryptionKey, mut src: R, mut dst: W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut salt = [0u8; IV_SIZE];
    src.read_exact(&mut salt).await?;

    let cipher = key.cipher();
    let block_on_wire = CRYPTO_BLOCK_SIZE + TAG_SIZE;
    let mut buf = vec![0u8; block_on_wire];
    let mut counter: u64 = 0;
    let mut total: u64 = 0;

    loop {
        let n = read_block(&mut src, &mut buf).await?;
        if n < TAG_SIZE {
            if n == 0 && counter > 0 {
                break;
            }
            return Err(Error::CryptoIntegrity("truncated ciphertext block".into()));
        }
        let nonce_bytes = derive_nonce(&salt, counter);
        let aad = counter.to_be_bytes();
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &buf[..n],
                    aad: &aad,
                },
            )
            .map_err(|_| Error::CryptoIntegrity("AEAD verification failed".into()))?;
        dst.write_all(&plaintext).await?;
        total += plaintext.len() as u64;
        counter += 1;
        if n < buf.len() {
            break;
        }
    }
    dst.flush().await?;
    Ok(total)
}

/// Total wire size (including the salt and per-block GCM tags) produced by
/// encrypting `plaintext_len` bytes. Lets the file server announce a
/// `StoreFile.size` before it has re-read the ciphertext from disk.
pub fn encrypted_len(plaintext_len: u64) -> u64 {
    let block = CRYPTO_BLOCK_SIZE as u64;
    // Mirrors copy_encrypt's loop: it always reads one more block than the
    // exact quotient to observe EOF, even when the source divides evenly.
    let blocks = plaintext_len / block + 1;
    IV_SIZE as u64 + plaintext_len + blocks * TAG_SIZE as u64
}

/// SHA-1 of a logical key, as 40 lowercase hex characters (spec §4.B `PathKey`).
pub fn hash_key(logical_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(logical_key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn roundtrip(plaintext: &[u8]) -> Vec<u8> {
        let key = EncryptionKey::generate();
        let mut ciphertext = Vec::new();
        copy_encrypt(&key, Cursor::new(plaintext), &mut ciphertext)
            .await
            .unwrap();
        let mut decrypted = Vec::new();
        copy_decrypt(&key, Cursor::new(ciphertext), &mut decrypted)
            .await
            .unwrap();
        decrypted
    }

    #[tokio::test]
    async fn roundtrips_empty() {
        assert_eq!(roundtrip(b"").await, b"");
    }

    #[tokio::test]
    async fn roundtrips_small() {
        assert_eq!(roundtrip(b"hello").await, b"hello");
    }

    #[tokio::test]
    async fn roundtrips_multi_block() {
        let data = vec![7u8; CRYPTO_BLOCK_SIZE * 3 + 42];
        assert_eq!(roundtrip(&data).await, data);
    }

    #[tokio::test]
    async fn two_encryptions_differ() {
        let key = EncryptionKey::generate();
        let mut c1 = Vec::new();
        let mut c2 = Vec::new();
        copy_encrypt(&key, Cursor::new(b"same plaintext"), &mut c1)
            .await
            .unwrap();
        copy_encrypt(&key, Cursor::new(b"same plaintext"), &mut c2)
            .await
            .unwrap();
        assert_ne!(c1, c2);
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        let key = EncryptionKey::generate();
        let mut ciphertext = Vec::new();
        copy_encrypt(&key, Cursor::new(b"integrity please"), &mut ciphertext)
            .await
            .unwrap();
        *ciphertext.last_mut().unwrap() ^= 0xFF;
        let mut out = Vec::new();
        let err = copy_decrypt(&key, Cursor::new(ciphertext), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CryptoIntegrity(_)));
    }

    #[test]
    fn hash_key_is_deterministic_and_40_hex() {
        let h1 = hash_key("picture_0.png");
        let h2 = hash_key("picture_0.png");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 40);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn encrypted_len_matches_actual_overhead() {
        for len in [0u64, 1, CRYPTO_BLOCK_SIZE as u64, CRYPTO_BLOCK_SIZE as u64 * 2 + 5] {
            let predicted = encrypted_len(len);
            assert!(predicted >= len + IV_SIZE as u64 + TAG_SIZE as u64);
        }
    }
}
