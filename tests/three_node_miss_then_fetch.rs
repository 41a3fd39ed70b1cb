//! Spec scenario 2: three-node miss-then-fetch.

mod common;

use std::io::Cursor;
use std::time::Duration;

#[tokio::test]
async fn node_without_the_key_fetches_it_from_a_peer() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let dir_c = tempfile::tempdir().unwrap();

    // Star-then-chain: C joins only via B, after A has already replicated to
    // B, so C never receives "k" directly from A — it must fetch it from B.
    let node_a = common::spin_up("127.0.0.1:39201", &[], dir_a.path()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let node_b = common::spin_up("127.0.0.1:39202", &["127.0.0.1:39201"], dir_b.path()).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    node_a.store("k", Cursor::new(payload.clone())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node_b.has("k").await);

    let node_c = common::spin_up("127.0.0.1:39203", &["127.0.0.1:39202"], dir_c.path()).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(!node_c.has("k").await);
    let fetched = node_c.get("k").await.unwrap();
    assert_eq!(fetched, payload);
    assert!(node_c.has("k").await);

    node_a.stop(Duration::from_secs(5)).await.unwrap();
    node_b.stop(Duration::from_secs(5)).await.unwrap();
    node_c.stop(Duration::from_secs(5)).await.unwrap();
}
