//! Metadata cache tests

use super::*;
use nostr_client::{ApplyOutcome, ConnectBehavior, Metadata, RecordStatus};
use proptest::prelude::*;
use std::time::Duration;

fn named(name: &str) -> Metadata {
    Metadata {
        name: Some(name.to_string()),
        ..Metadata::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_ensure_fresh_is_single_flight() {
    let network = MemoryNetwork::new();
    let relay = network.relay(&relay_url("slow"));
    relay.set_silent(true);
    let client = test_client(&network, &["slow"]);
    client.connect_all().await;
    let cache = client.metadata().clone();

    let first = tokio::spawn({
        let cache = cache.clone();
        async move { cache.ensure_fresh("hank").await }
    });
    // Let the first batch go out, then ask again while it is in flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.req_count(), 1);
    let second = tokio::spawn({
        let cache = cache.clone();
        async move { cache.ensure_fresh("hank").await }
    });

    let (first, second) = (first.await.unwrap(), second.await.unwrap());
    assert_eq!(relay.req_count(), 1);
    assert_eq!(first, second);
    assert_eq!(first.unwrap().status, RecordStatus::Failed);
}

#[tokio::test]
async fn test_batch_refill_fans_results_out() {
    let network = MemoryNetwork::new();
    let relay = network.relay(&relay_url("a"));
    let keys: Vec<String> = (0..40).map(|i| format!("user{:02}", i)).collect();
    for (i, key) in keys.iter().enumerate() {
        if i % 2 == 0 {
            relay.store(profile(key, key, 100));
        }
    }
    let client = test_client(&network, &["a"]);
    client.connect_all().await;

    let records = client.metadata().ensure_fresh_batch(&keys).await;
    assert_eq!(records.len(), keys.len());
    assert_eq!(relay.req_count(), 1);
    for (i, key) in keys.iter().enumerate() {
        let record = &records[key];
        if i % 2 == 0 {
            assert_eq!(record.status, RecordStatus::Fresh);
            assert_eq!(record.payload, Some(named(key)));
        } else {
            assert_eq!(record.status, RecordStatus::Failed);
            assert_eq!(record.failures, 1);
        }
    }
}

#[tokio::test]
async fn test_oversized_batch_is_split() {
    let network = MemoryNetwork::new();
    let relay = network.relay(&relay_url("a"));
    let client = test_client_with(&network, &["a"], |config| config.cache.max_batch_size = 10);
    client.connect_all().await;

    let keys: Vec<String> = (0..25).map(|i| format!("k{}", i)).collect();
    client.metadata().ensure_fresh_batch(&keys).await;
    assert_eq!(relay.req_count(), 3);
}

#[tokio::test]
async fn test_live_update_does_not_regress_fetched_record() {
    let network = MemoryNetwork::new();
    network.relay(&relay_url("a")).store(profile("ivy", "fetched", 50));
    let client = test_client(&network, &["a"]);
    client.connect_all().await;

    client.metadata().ensure_fresh("ivy").await;
    let outcome = client.metadata().apply_live_update("ivy", named("older"), 40);
    assert_eq!(outcome, ApplyOutcome::StaleIgnored);
    assert_eq!(
        client.metadata().get("ivy").unwrap().payload,
        Some(named("fetched"))
    );
}

#[tokio::test]
async fn test_offline_fetches_keep_key_fetchable() {
    let network = MemoryNetwork::new();
    let relay = network.relay(&relay_url("a"));
    relay.set_connect_behavior(ConnectBehavior::Refuse);
    relay.store(profile("zed", "zed", 7));
    let client = test_client(&network, &["a"]);
    client.connect_all().await;

    for _ in 0..4 {
        let record = client.metadata().ensure_fresh("zed").await.unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.failures, 0);
    }
    assert_eq!(relay.req_count(), 0);

    relay.set_connect_behavior(ConnectBehavior::Accept);
    client.supervisor().reconnect(&relay_url("a")).await.unwrap();

    let record = client.metadata().ensure_fresh("zed").await.unwrap();
    assert_eq!(record.status, RecordStatus::Fresh);
    assert_eq!(record.payload, Some(named("zed")));
    assert_eq!(relay.req_count(), 1);
}

proptest! {
    #[test]
    fn prop_newest_asserted_time_wins(
        times in proptest::collection::hash_set(0u64..10_000, 1..12)
            .prop_map(|set| set.into_iter().collect::<Vec<_>>())
            .prop_shuffle(),
    ) {
        let network = MemoryNetwork::new();
        let client = test_client(&network, &["a"]);
        let cache = client.metadata();

        for t in &times {
            cache.apply_live_update("key", named(&t.to_string()), *t);
        }

        let newest = *times.iter().max().unwrap();
        let record = cache.get("key").unwrap();
        prop_assert_eq!(record.asserted_at, Some(newest));
        prop_assert_eq!(record.payload, Some(named(&newest.to_string())));
    }
}
