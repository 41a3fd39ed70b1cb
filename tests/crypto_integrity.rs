//! Spec scenario 4: flipping a bit in a stored ciphertext file must fail
//! `get` with `CryptoIntegrity` and never yield plaintext.

mod common;

use std::io::Cursor;
use std::time::Duration;

use peervault::cas::PathKey;
use peervault::Error;

#[tokio::test]
async fn bit_flip_on_disk_is_detected_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let node = common::spin_up("127.0.0.1:39301", &[], dir.path()).await;

    node.store("secret.bin", Cursor::new(b"integrity matters".to_vec()))
        .await
        .unwrap();

    let path_key = PathKey::for_logical_key("secret.bin");
    let leaf = path_key.full_path(dir.path());
    let mut bytes = std::fs::read(&leaf).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&leaf, bytes).unwrap();

    let err = node.get("secret.bin").await.unwrap_err();
    assert!(matches!(err, Error::CryptoIntegrity(_)));

    node.stop(Duration::from_secs(5)).await.unwrap();
}
