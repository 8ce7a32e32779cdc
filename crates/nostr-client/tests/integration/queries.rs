//! One-shot query tests

use super::*;
use nostr_client::{ClientError, ConnectBehavior, Filter, QueryOptions};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_timeout_bound_with_unresponsive_relays() {
    let network = MemoryNetwork::new();
    let names = ["quiet1", "quiet2", "quiet3", "answers"];
    for name in &names[..3] {
        network.relay(&relay_url(name)).set_silent(true);
    }
    network.relay(&relay_url("answers")).store(note("n1", "erin", 1));
    let client = test_client(&network, &names);
    client.connect_all().await;

    for timeout_ms in [1u64, 250, 3000] {
        let timeout = Duration::from_millis(timeout_ms);
        let started = Instant::now();
        let events = client
            .fetch_many(vec![Filter::new().kinds([1])], QueryOptions::timeout(timeout))
            .await
            .unwrap();
        assert!(started.elapsed() <= timeout + Duration::from_millis(5));
        assert!(events.len() <= 1);
    }
}

#[tokio::test]
async fn test_no_connected_relays_fails_fast() {
    let network = MemoryNetwork::new();
    network
        .relay(&relay_url("a"))
        .set_connect_behavior(ConnectBehavior::Refuse);
    let client = test_client(&network, &["a"]);
    client.connect_all().await;

    let result = client
        .fetch_many(vec![Filter::new().kinds([1])], QueryOptions::default())
        .await;
    assert!(matches!(result, Err(ClientError::NoEndpointsAvailable)));
}

#[tokio::test]
async fn test_rate_limited_relay_is_soft() {
    let network = MemoryNetwork::new();
    network.relay(&relay_url("limited")).set_rate_limited(true);
    network.relay(&relay_url("open")).store(note("n1", "frank", 1));
    let client = test_client(&network, &["limited", "open"]);
    client.connect_all().await;

    let events = client
        .fetch_many(vec![Filter::new().authors(["frank"])], QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);

    // Completes on CLOSED rather than waiting for the timeout.
    let all_limited = test_client(&network, &["limited"]);
    all_limited.connect_all().await;
    let events = all_limited
        .fetch_many(vec![Filter::new().authors(["frank"])], QueryOptions::default())
        .await
        .unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_read_disabled_relays_not_queried() {
    let network = MemoryNetwork::new();
    network.relay(&relay_url("reader")).store(note("r", "gina", 1));
    network.relay(&relay_url("writer")).store(note("w", "gina", 2));
    let client = test_client_with(&network, &["reader"], |config| {
        config
            .relays
            .push(RelayConfig::write_only(relay_url("writer")));
    });
    client.connect_all().await;

    let event = client
        .fetch_one(vec![Filter::new().authors(["gina"])], QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(event.map(|e| e.id), Some("r".to_string()));
    assert_eq!(network.relay(&relay_url("writer")).req_count(), 0);
}
