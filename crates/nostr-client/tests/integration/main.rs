//! Integration tests for the relay access layer
//!
//! Every test runs against in-memory relays, so relay behavior (refusing,
//! hanging, staying silent, rate limiting) is scripted per test.

mod connection;
mod metadata;
mod queries;
mod subscriptions;

use nostr_client::{ClientConfig, Event, MemoryNetwork, NostrClient, RelayConfig};
use std::sync::{Arc, Once};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn relay_url(name: &str) -> String {
    format!("ws://{}.relay.test", name)
}

/// A client over `network` with one relay per name, not yet connected.
pub fn test_client(network: &Arc<MemoryNetwork>, names: &[&str]) -> NostrClient {
    test_client_with(network, names, |_| {})
}

pub fn test_client_with(
    network: &Arc<MemoryNetwork>,
    names: &[&str],
    customize: impl FnOnce(&mut ClientConfig),
) -> NostrClient {
    init_tracing();
    let mut config = ClientConfig::with_relays(names.iter().map(|n| RelayConfig::new(relay_url(n))));
    customize(&mut config);
    NostrClient::with_transport(config, network.clone()).unwrap()
}

pub fn note(id: &str, author: &str, created_at: u64) -> Event {
    Event {
        id: id.to_string(),
        pubkey: author.to_string(),
        created_at,
        kind: 1,
        tags: vec![],
        content: format!("note {}", id),
        sig: "sig".to_string(),
    }
}

pub fn profile(author: &str, name: &str, created_at: u64) -> Event {
    Event {
        id: format!("profile-{}-{}", author, created_at),
        pubkey: author.to_string(),
        created_at,
        kind: 0,
        tags: vec![],
        content: serde_json::json!({ "name": name }).to_string(),
        sig: "sig".to_string(),
    }
}
