//! Connection supervision tests

use super::*;
use nostr_client::{ConnectBehavior, EndpointState, Filter, QueryOptions, StatusEvent};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_two_connect_one_times_out_then_query_returns_union() {
    let network = MemoryNetwork::new();
    network
        .relay(&relay_url("a"))
        .store(profile("abc123", "from-a", 10));
    network
        .relay(&relay_url("b"))
        .store(profile("abc123", "from-a", 10));
    network
        .relay(&relay_url("b"))
        .store(profile("abc123", "from-b", 20));
    network
        .relay(&relay_url("c"))
        .set_connect_behavior(ConnectBehavior::Hang);
    let client = test_client(&network, &["a", "b", "c"]);

    let results = client.connect_all().await;
    assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 2);

    let hung = client.supervisor().endpoint(&relay_url("c")).unwrap();
    assert_eq!(hung.state, EndpointState::Errored);
    assert_eq!(hung.consecutive_failures, 1);

    let started = Instant::now();
    let events = client
        .fetch_many(
            vec![Filter::new().kinds([0]).authors(["abc123"])],
            QueryOptions::timeout(Duration::from_millis(3000)),
        )
        .await
        .unwrap();

    assert!(started.elapsed() <= Duration::from_millis(3000));
    let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["profile-abc123-20", "profile-abc123-10"]);
    assert_eq!(network.relay(&relay_url("c")).req_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_timers_are_bounded() {
    let network = MemoryNetwork::new();
    let relay = network.relay(&relay_url("down"));
    relay.set_connect_behavior(ConnectBehavior::Refuse);
    let client = test_client(&network, &["down"]);
    let max_attempts = client.config().connection.max_reconnect_attempts;

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    client.on_status(move |event| sink.lock().push(event.clone()));
    let errors = Arc::new(Mutex::new(0usize));
    let error_sink = Arc::clone(&errors);
    client.on_error(move |_| *error_sink.lock() += 1);

    client.connect_all().await;
    tokio::time::sleep(Duration::from_secs(600)).await;

    let endpoint = client.supervisor().endpoint(&relay_url("down")).unwrap();
    assert_eq!(endpoint.reconnect_attempts, max_attempts);
    assert!(endpoint.suspended);
    assert_eq!(relay.connect_attempts(), 1 + max_attempts as usize);
    assert_eq!(*errors.lock(), 1 + max_attempts as usize);
    assert_eq!(
        statuses
            .lock()
            .iter()
            .filter(|e| matches!(e, StatusEvent::Suspended { .. }))
            .count(),
        1
    );

    // Suspended endpoints stay addressable.
    assert_eq!(client.statuses().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_single_retry_timer_per_endpoint() {
    let network = MemoryNetwork::new();
    let relay = network.relay(&relay_url("flaky"));
    let client = test_client(&network, &["flaky"]);
    client.connect_all().await;

    relay.set_connect_behavior(ConnectBehavior::Refuse);
    relay.drop_connection("first");
    tokio::time::sleep(Duration::from_secs(1)).await;

    // A manual attempt replaces the pending timer instead of adding one.
    client.connect_all().await;
    assert_eq!(relay.connect_attempts(), 2);

    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert_eq!(relay.connect_attempts(), 2);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(relay.connect_attempts(), 3);
}

#[tokio::test]
async fn test_manual_reconnect_of_unknown_relay() {
    let network = MemoryNetwork::new();
    let client = test_client(&network, &["a"]);
    let result = client.supervisor().reconnect("ws://nowhere.test").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_health_reflects_states() {
    let network = MemoryNetwork::new();
    network
        .relay(&relay_url("bad"))
        .set_connect_behavior(ConnectBehavior::Refuse);
    let client = test_client(&network, &["good", "bad"]);
    client.connect_all().await;

    let health = client.health();
    assert_eq!(health.total, 2);
    assert_eq!(health.connected, 1);
    assert_eq!(health.errored, 1);
    assert!(health.is_healthy());

    client.disconnect_all().await;
    assert!(!client.health().is_healthy());
}
