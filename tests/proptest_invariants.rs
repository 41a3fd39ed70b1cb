//! Property-based checks called out explicitly in spec.md §8.

use peervault::cas::sanitize;
use peervault::crypto::{hash_key, EncryptionKey};
use peervault::protocol::{decode_message, encode_message, Payload};
use proptest::prelude::*;

proptest! {
    #[test]
    fn hash_key_is_deterministic_40_hex(s in ".*") {
        let a = hash_key(&s);
        let b = hash_key(&s);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.len(), 40);
        prop_assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sanitizer_is_idempotent(s in ".*") {
        let once = sanitize(&s);
        let twice = sanitize(&once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn sanitizer_never_leaves_forbidden_chars(s in ".*") {
        let sanitized = sanitize(&s);
        prop_assert!(!sanitized.chars().any(|c| matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\\' | '/')));
    }

    #[test]
    fn store_file_dto_roundtrips(key in "[a-zA-Z0-9_.]{0,64}", size in 0u64..(1u64 << 40)) {
        let payload = Payload::StoreFile {
            node_id: peervault::crypto::NodeId([4u8; 32]),
            key,
            size,
        };
        let encoded = encode_message(&payload).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        prop_assert_eq!(payload, decoded);
    }
}

#[tokio::test]
async fn encrypt_decrypt_roundtrips_for_varied_lengths() {
    use std::io::Cursor;
    let key = EncryptionKey::generate();
    for len in [0usize, 1, 17, 1000, 70_000, 131_073] {
        let plaintext: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        let mut ciphertext = Vec::new();
        peervault::crypto::copy_encrypt(&key, Cursor::new(plaintext.clone()), &mut ciphertext)
            .await
            .unwrap();
        let mut decrypted = Vec::new();
        peervault::crypto::copy_decrypt(&key, Cursor::new(ciphertext), &mut decrypted)
            .await
            .unwrap();
        assert_eq!(decrypted, plaintext, "length {len} failed to roundtrip");
    }
}
