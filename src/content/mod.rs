//! Content addresser (spec §4.H).
//!
//! Derives a `ContentId` from the SHA-256 of plaintext bytes and provides
//! the on-disk path layout the chunk store uses to place unique chunks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// (algorithm, hex digest, size). Uniquely identifies a byte sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentId {
    pub algorithm: &'static str,
    pub digest: String,
    pub size: u64,
}

impl ContentId {
    /// Two-hex/rest-hex directory layout used to place a chunk on disk.
    pub fn storage_path(&self) -> (String, String) {
        let (first, rest) = self.digest.split_at(2.min(self.digest.len()));
        (first.to_string(), rest.to_string())
    }

    /// A self-describing multihash envelope: one varint-style byte for the
    /// algorithm code (0x12 = sha2-256 per the multihash table), one byte
    /// for digest length, then the raw digest. Optional interop surface;
    /// only sha2-256 is required by the spec.
    pub fn to_multihash(&self) -> Vec<u8> {
        let raw = hex::decode(&self.digest).expect("digest is always valid hex");
        let mut out = Vec::with_capacity(2 + raw.len());
        out.push(0x12);
        out.push(raw.len() as u8);
        out.extend_from_slice(&raw);
        out
    }
}

/// Computes the `ContentId` of a byte slice.
pub fn generate_content_id(bytes: &[u8]) -> ContentId {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentId {
        algorithm: "sha256",
        digest: hex::encode(hasher.finalize()),
        size: bytes.len() as u64,
    }
}

/// Verifies that `bytes` hashes to `expected`.
pub fn verify_content(bytes: &[u8], expected: &ContentId) -> bool {
    generate_content_id(bytes) == expected.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_id() {
        let a = generate_content_id(b"hello world");
        let b = generate_content_id(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.algorithm, "sha256");
        assert_eq!(a.size, 11);
    }

    #[test]
    fn verify_rejects_mismatch() {
        let id = generate_content_id(b"hello world");
        assert!(!verify_content(b"goodbye world", &id));
        assert!(verify_content(b"hello world", &id));
    }

    #[test]
    fn storage_path_splits_first_two_hex() {
        let id = generate_content_id(b"chunk data");
        let (first, rest) = id.storage_path();
        assert_eq!(first.len(), 2);
        assert_eq!(format!("{}{}", first, rest), id.digest);
    }
}
