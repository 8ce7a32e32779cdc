//! Multi-relay Nostr access layer for OpenAgents.
//!
//! This crate provides:
//! - Connection supervision across many relays with bounded reconnects
//! - Live subscriptions deduplicated across relays, with EOSE and caps
//! - One-shot queries that merge and deduplicate results under a timeout
//! - A metadata cache with batched refill and staleness tracking
//! - Publishing through an external signer
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_client::{ClientConfig, Filter, NostrClient, QueryOptions};
//! use nostr_client::{SubscribeOptions, SubscriptionHandlers};
//!
//! #[tokio::main]
//! async fn main() -> nostr_client::Result<()> {
//!     let client = NostrClient::new(ClientConfig::with_relays([
//!         "wss://relay.damus.io",
//!         "wss://nos.lol",
//!     ]))?;
//!     client.connect_all().await;
//!
//!     // Recent text notes, merged across relays
//!     let notes = client
//!         .fetch_many(vec![Filter::new().kinds([1]).limit(10)], QueryOptions::default())
//!         .await?;
//!     println!("Fetched {} notes", notes.len());
//!
//!     // Follow new notes live
//!     let handlers = SubscriptionHandlers::new(|event| println!("Received event: {}", event.id))
//!         .on_eose(|| println!("Got all stored events"));
//!     client
//!         .subscribe(vec![Filter::new().kinds([1])], handlers, SubscribeOptions::new())
//!         .await?;
//!
//!     // Profile metadata, fetched once and cached
//!     if let Some(record) = client.metadata().ensure_fresh("npub-hex").await {
//!         println!("{:?}", record.payload.and_then(|m| m.name));
//!     }
//!     Ok(())
//! }
//! ```

mod cache;
mod client;
mod config;
mod endpoint;
mod error;
mod memory;
mod message;
mod observer;
mod publish;
mod query;
mod signer;
mod subscription;
mod supervisor;
mod task;
mod transport;

// Re-export main types
pub use cache::{ApplyOutcome, CachedMetadataRecord, KIND_METADATA, Metadata, MetadataCache, RecordStatus};
pub use client::{DEFAULT_RELAYS, NostrClient, default_client};
pub use config::{
    CacheConfig, ClientConfig, ConnectionConfig, QueryConfig, RelayConfig, SubscriptionConfig,
    validate_relay_url,
};
pub use endpoint::{Endpoint, EndpointState, PoolHealth};
pub use error::{ClientError, Result};
pub use memory::{ConnectBehavior, MemoryNetwork, MemoryRelay};
pub use message::{ClientMessage, CloseReason, Event, Filter, MessageError, RelayMessage};
pub use observer::{ObserverHandle, ObserverList};
pub use publish::{DEFAULT_CONFIRMATION_TIMEOUT, PublishOutcome, Publisher};
pub use query::{QueryExecutor, QueryOptions};
pub use signer::{EventTemplate, Signer, UnsignedEvent};
pub use subscription::{
    SubscribeOptions, SubscriptionHandlers, SubscriptionInfo, SubscriptionRegistry,
    SubscriptionTracker, generate_subscription_id,
};
pub use supervisor::{ConnectionSupervisor, EndpointError, InboundFrame, StatusEvent};
pub use task::ScheduledTask;
pub use transport::{
    Transport, TransportEvent, TransportFactory, TransportReceiver, WebSocketFactory,
    WebSocketTransport,
};
