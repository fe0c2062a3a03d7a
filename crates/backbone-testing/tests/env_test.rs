//! Tests for the in-memory test environment.

use std::time::Duration;

use backbone_channel::StreamStore;
use backbone_core::{Clock, StreamKey};
use backbone_testing::TestEnv;

#[tokio::test]
async fn publish_writes_entry_and_segments() {
    let env = TestEnv::new();
    let key = StreamKey::new("orders", "1");

    let id = env.publish(&key, "m-1", "OrderPlaced").await;

    env.store.create_group_if_absent(&key, "billing").await.unwrap();
    let entries = env.store.read_new(&key, "billing", "c-1", 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
    assert_eq!(entries[0].field("Operation"), Some("OrderPlaced"));

    let segments = env.store.hash_entries("Segments~m-1").await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].0, "body");
}

#[tokio::test]
async fn publish_many_numbers_from_one() {
    let env = TestEnv::new();
    let key = StreamKey::new("orders", "1");

    let ids = env.publish_many(&key, "m", "OrderPlaced", 3).await;

    assert_eq!(ids.len(), 3);
    assert_eq!(env.store.hash_entries("Segments~m-3").await.unwrap().len(), 1);
}

#[tokio::test]
async fn shared_clock_follows_virtual_time() {
    let env = TestEnv::new();
    let shared = env.shared_clock();
    let before = shared.now();

    env.clock.advance(Duration::from_secs(5));

    assert_eq!(shared.now().duration_since(before), Duration::from_secs(5));
}
