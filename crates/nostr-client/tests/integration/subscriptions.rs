//! Live subscription tests

use super::*;
use nostr_client::{Filter, RelayMessage, SubscribeOptions, SubscriptionHandlers};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

fn recorder() -> (Arc<Mutex<Vec<String>>>, SubscriptionHandlers) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handlers = SubscriptionHandlers::new(move |event| sink.lock().push(event.id.clone()));
    (seen, handlers)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_each_event_delivered_once_across_relays() {
    for relay_count in 1..=5 {
        let network = MemoryNetwork::new();
        let names: Vec<String> = (0..relay_count).map(|i| format!("r{}", i)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        for name in &names {
            let relay = network.relay(&relay_url(name));
            relay.store(note("shared-1", "alice", 1));
            relay.store(note("shared-2", "alice", 2));
        }
        let client = test_client(&network, &names);
        client.connect_all().await;

        let (seen, handlers) = recorder();
        client
            .subscribe(vec![Filter::new().authors(["alice"])], handlers, SubscribeOptions::new())
            .await
            .unwrap();

        // Live copies from every relay as well.
        let live = note("live-1", "alice", 3);
        for name in &names {
            network.relay(&relay_url(name)).broadcast(&live);
        }
        settle().await;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for id in seen.lock().iter() {
            *counts.entry(id.clone()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3, "relays: {}", relay_count);
        assert!(counts.values().all(|&c| c == 1), "relays: {}", relay_count);
    }
}

#[tokio::test]
async fn test_cap_with_auto_close_tears_down() {
    let network = MemoryNetwork::new();
    let relay = network.relay(&relay_url("a"));
    let client = test_client(&network, &["a"]);
    client.connect_all().await;

    let (seen, handlers) = recorder();
    let id = client
        .subscribe(
            vec![Filter::new().kinds([1])],
            handlers,
            SubscribeOptions::new().max_events(3).auto_close(true),
        )
        .await
        .unwrap();

    for i in 0..10 {
        relay.push(RelayMessage::Event {
            subscription_id: id.clone(),
            event: note(&format!("n{}", i), "bob", i),
        });
    }
    settle().await;

    assert_eq!(seen.lock().clone(), vec!["n0", "n1", "n2"]);
    assert!(!client.subscriptions().is_active(&id));
    assert!(relay.open_subscriptions().is_empty());

    relay.broadcast(&note("late", "bob", 99));
    settle().await;
    assert_eq!(seen.lock().len(), 3);
}

#[tokio::test]
async fn test_reissued_to_relay_that_reconnects() {
    let network = MemoryNetwork::new();
    let relay = network.relay(&relay_url("a"));
    let client = test_client(&network, &["a", "b"]);
    client.connect_all().await;

    let (seen, handlers) = recorder();
    let id = client
        .subscribe(vec![Filter::new().kinds([1])], handlers, SubscribeOptions::new())
        .await
        .unwrap();

    relay.drop_connection("restart");
    settle().await;
    let info = client.subscriptions().snapshot(&id).unwrap();
    assert_eq!(info.relays, vec![relay_url("b")]);

    client.supervisor().reconnect(&relay_url("a")).await.unwrap();
    settle().await;
    assert_eq!(relay.open_subscriptions(), vec![id.clone()]);

    relay.broadcast(&note("after", "carol", 5));
    settle().await;
    assert_eq!(seen.lock().clone(), vec!["after"]);
}

#[tokio::test]
async fn test_disconnect_all_clears_relay_bookkeeping() {
    let network = MemoryNetwork::new();
    let client = test_client(&network, &["a", "b"]);
    client.connect_all().await;

    let (_, handlers) = recorder();
    let id = client
        .subscribe(vec![Filter::new().kinds([1])], handlers, SubscribeOptions::new())
        .await
        .unwrap();
    assert_eq!(client.subscriptions().snapshot(&id).unwrap().relays.len(), 2);

    client.disconnect_all().await;
    assert!(client.subscriptions().snapshot(&id).unwrap().relays.is_empty());
}

#[tokio::test]
async fn test_close_on_eose() {
    let network = MemoryNetwork::new();
    network.relay(&relay_url("a")).store(note("stored", "dave", 1));
    let client = test_client(&network, &["a"]);
    client.connect_all().await;

    let eose = Arc::new(Mutex::new(0));
    let eose_sink = Arc::clone(&eose);
    let (seen, handlers) = recorder();
    let handlers = handlers.on_eose(move || *eose_sink.lock() += 1);
    let id = client
        .subscribe(
            vec![Filter::new().authors(["dave"])],
            handlers,
            SubscribeOptions::new().close_on_eose(true),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(seen.lock().clone(), vec!["stored"]);
    assert_eq!(*eose.lock(), 1);
    assert!(!client.subscriptions().is_active(&id));
}
