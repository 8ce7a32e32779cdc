//! Caller-facing service object.

use crate::cache::MetadataCache;
use crate::config::ClientConfig;
use crate::endpoint::{Endpoint, PoolHealth};
use crate::error::{ClientError, Result};
use crate::message::{Event, Filter};
use crate::observer::ObserverHandle;
use crate::publish::{PublishOutcome, Publisher};
use crate::query::{QueryExecutor, QueryOptions};
use crate::signer::{EventTemplate, Signer};
use crate::subscription::{SubscribeOptions, SubscriptionHandlers, SubscriptionRegistry};
use crate::supervisor::{ConnectionSupervisor, EndpointError, StatusEvent};
use crate::transport::{TransportFactory, WebSocketFactory};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default relays for OpenAgents.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

/// One relay access layer: supervisor, registry, query executor and
/// metadata cache wired together over the same relays.
///
/// Construct one and pass it (or clones of it) to whatever needs relay
/// access.
#[derive(Clone)]
pub struct NostrClient {
    config: ClientConfig,
    supervisor: ConnectionSupervisor,
    registry: SubscriptionRegistry,
    query: QueryExecutor,
    cache: MetadataCache,
    publisher: Option<Publisher>,
}

impl NostrClient {
    /// Client over WebSocket relays.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(WebSocketFactory))
    }

    /// Client over any transport, e.g. [`MemoryNetwork`](crate::MemoryNetwork).
    pub fn with_transport(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        config.validate()?;
        let supervisor = ConnectionSupervisor::new(config.connection.clone(), factory);
        supervisor.configure(config.relays.iter().cloned())?;
        let registry = SubscriptionRegistry::new(supervisor.clone(), config.subscriptions.clone());
        let query = QueryExecutor::new(supervisor.clone(), config.query.clone());
        let cache = MetadataCache::new(query.clone(), registry.clone(), config.cache.clone());
        info!("Client configured with {} relays", config.relays.len());

        Ok(Self {
            config,
            supervisor,
            registry,
            query,
            cache,
            publisher: None,
        })
    }

    /// Enable publishing through `signer`.
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.publisher = Some(Publisher::new(self.supervisor.clone(), signer));
        self
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Relay connections.
    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Live subscriptions.
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// One-shot queries.
    pub fn queries(&self) -> &QueryExecutor {
        &self.query
    }

    /// Profile metadata cache.
    pub fn metadata(&self) -> &MetadataCache {
        &self.cache
    }

    /// Connect every configured relay not already connected or connecting.
    pub async fn connect_all(&self) -> Vec<(String, Result<()>)> {
        self.supervisor.connect_all().await
    }

    /// Close every connection and cancel pending retries.
    pub async fn disconnect_all(&self) {
        self.supervisor.disconnect_all().await
    }

    /// Relays connected right now.
    pub fn connected_endpoints(&self) -> Vec<String> {
        self.supervisor.connected_endpoints()
    }

    /// Snapshot of every relay in configuration order.
    pub fn statuses(&self) -> Vec<Endpoint> {
        self.supervisor.statuses()
    }

    /// Relay counts by connection state.
    pub fn health(&self) -> PoolHealth {
        self.supervisor.health()
    }

    /// Observe connection status changes.
    pub fn on_status(&self, callback: impl Fn(&StatusEvent) + Send + Sync + 'static) -> ObserverHandle {
        self.supervisor.on_status(callback)
    }

    /// Observe relay transport failures.
    pub fn on_error(&self, callback: impl Fn(&EndpointError) + Send + Sync + 'static) -> ObserverHandle {
        self.supervisor.on_error(callback)
    }

    /// Open a live subscription on every readable relay.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        handlers: SubscriptionHandlers,
        options: SubscribeOptions,
    ) -> Result<String> {
        self.registry.subscribe(filters, handlers, options).await
    }

    /// Close a subscription. Unknown ids return `false`.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        self.registry.unsubscribe(id).await
    }

    /// Matching events from every readable relay, newest first.
    pub async fn fetch_many(&self, filters: Vec<Filter>, options: QueryOptions) -> Result<Vec<Event>> {
        self.query.fetch_many(filters, options).await
    }

    /// The newest matching event, if any.
    pub async fn fetch_one(&self, filters: Vec<Filter>, options: QueryOptions) -> Result<Option<Event>> {
        self.query.fetch_one(filters, options).await
    }

    /// Sign `template` and publish it to every writable relay. Fails when
    /// the client has no signer.
    pub async fn publish(&self, template: EventTemplate, timeout: Option<Duration>) -> Result<PublishOutcome> {
        let publisher = self
            .publisher
            .as_ref()
            .ok_or_else(|| ClientError::Signer("no signer configured".to_string()))?;
        publisher.publish(template, timeout).await
    }
}

/// Create a client with default OpenAgents relays.
pub fn default_client() -> Result<NostrClient> {
    NostrClient::new(ClientConfig::with_relays(DEFAULT_RELAYS.iter().copied()))
}
