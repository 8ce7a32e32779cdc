//! Connection supervision for a set of relays.
//!
//! The supervisor owns every [`Endpoint`] and its transport, drives
//! connect/reconnect with a bounded retry budget, and is the only component
//! that sends or receives protocol frames. Everything above it observes
//! inbound frames and status changes through observer lists.

use crate::config::{ConnectionConfig, RelayConfig, validate_relay_url};
use crate::endpoint::{Endpoint, EndpointState, PoolHealth};
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::observer::{ObserverHandle, ObserverList};
use crate::task::ScheduledTask;
use crate::transport::{Transport, TransportEvent, TransportFactory, TransportReceiver};
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// A relay frame tagged with the relay it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub relay_url: String,
    pub message: RelayMessage,
}

/// Connection status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Connected { relay_url: String },
    Disconnected { relay_url: String, reason: String },
    /// A connect attempt or a live connection failed
    Errored { relay_url: String, error: String },
    /// Retry budget exhausted; only a manual reconnect will try again
    Suspended { relay_url: String },
    Removed { relay_url: String },
}

impl StatusEvent {
    pub fn relay_url(&self) -> &str {
        match self {
            StatusEvent::Connected { relay_url }
            | StatusEvent::Disconnected { relay_url, .. }
            | StatusEvent::Errored { relay_url, .. }
            | StatusEvent::Suspended { relay_url }
            | StatusEvent::Removed { relay_url } => relay_url,
        }
    }
}

/// A transport failure attributed to one relay.
#[derive(Debug)]
pub struct EndpointError {
    pub relay_url: String,
    pub error: ClientError,
}

struct Slot {
    endpoint: Endpoint,
    transport: Option<Arc<dyn Transport>>,
    /// Bumped on every connect attempt and teardown; stale readers and
    /// attempts compare against it
    session: u64,
    retry: Option<ScheduledTask>,
    reader: Option<ScheduledTask>,
}

impl Slot {
    fn new(config: &RelayConfig) -> Self {
        Self {
            endpoint: Endpoint::new(config),
            transport: None,
            session: 0,
            retry: None,
            reader: None,
        }
    }

    /// Stop the retry timer and reader and invalidate in-flight work.
    fn teardown(&mut self) -> Option<Arc<dyn Transport>> {
        self.session += 1;
        self.retry = None;
        self.reader = None;
        if self.endpoint.is_connected() {
            self.transport.clone()
        } else {
            None
        }
    }
}

struct SupervisorInner {
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    slots: Mutex<IndexMap<String, Slot>>,
    frames: ObserverList<InboundFrame>,
    status: ObserverList<StatusEvent>,
    errors: ObserverList<EndpointError>,
}

/// Owns the relay set and every relay connection.
///
/// Cloning is cheap; clones share the same relays.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    pub fn new(config: ConnectionConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                factory,
                slots: Mutex::new(IndexMap::new()),
                frames: ObserverList::new("frame"),
                status: ObserverList::new("status"),
                errors: ObserverList::new("error"),
            }),
        }
    }

    /// Connection settings this supervisor was built with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Register relays without connecting. Already known relays keep their
    /// connection and take the new read/write flags.
    pub fn configure<I, R>(&self, relays: I) -> Result<()>
    where
        I: IntoIterator<Item = R>,
        R: Into<RelayConfig>,
    {
        let relays: Vec<RelayConfig> = relays.into_iter().map(Into::into).collect();
        for relay in &relays {
            validate_relay_url(&relay.url)?;
        }
        for relay in relays {
            self.add_endpoint(relay)?;
        }
        Ok(())
    }

    /// Register one relay. Returns whether it was new.
    pub fn add_endpoint(&self, relay: impl Into<RelayConfig>) -> Result<bool> {
        let relay = relay.into();
        validate_relay_url(&relay.url)?;

        let mut slots = self.inner.slots.lock();
        match slots.get_mut(&relay.url) {
            Some(slot) => {
                slot.endpoint.read = relay.read;
                slot.endpoint.write = relay.write;
                Ok(false)
            }
            None => {
                info!("Adding relay: {}", relay.url);
                slots.insert(relay.url.clone(), Slot::new(&relay));
                Ok(true)
            }
        }
    }

    /// Forget a relay, cancelling its retry timer and closing its connection.
    pub async fn remove_endpoint(&self, url: &str) -> bool {
        let Some(mut slot) = self.inner.slots.lock().shift_remove(url) else {
            return false;
        };
        info!("Removing relay: {}", url);
        slot.teardown();
        if let Some(transport) = slot.transport.take() {
            transport.close().await;
        }
        self.inner.status.notify(&StatusEvent::Removed {
            relay_url: url.to_string(),
        });
        true
    }

    /// Connect every relay that is neither connected nor connecting.
    ///
    /// Suspended relays are included and get a fresh retry budget. Returns
    /// the outcome per attempted relay; failures are also reported to error
    /// observers and scheduled for retry.
    pub async fn connect_all(&self) -> Vec<(String, Result<()>)> {
        let urls: Vec<String> = {
            let mut slots = self.inner.slots.lock();
            slots
                .values_mut()
                .filter(|slot| !slot.endpoint.is_busy())
                .map(|slot| {
                    if slot.endpoint.suspended {
                        slot.endpoint.reset_retry_budget();
                    }
                    slot.endpoint.url.clone()
                })
                .collect()
        };
        info!("Connecting to {} relays", urls.len());

        let attempts = urls.iter().map(|url| connect_endpoint(&self.inner, url));
        let results = join_all(attempts).await;
        urls.into_iter().zip(results).collect()
    }

    /// Manually connect one relay, resetting its retry budget.
    pub async fn reconnect(&self, url: &str) -> Result<()> {
        {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .get_mut(url)
                .ok_or_else(|| ClientError::UnknownRelay(url.to_string()))?;
            slot.endpoint.reset_retry_budget();
        }
        connect_endpoint(&self.inner, url).await
    }

    /// Manual sweep over relays whose automatic retry was suspended.
    pub async fn reprobe_suspended(&self) -> Vec<(String, Result<()>)> {
        let urls: Vec<String> = self
            .inner
            .slots
            .lock()
            .values()
            .filter(|slot| slot.endpoint.suspended && !slot.endpoint.is_busy())
            .map(|slot| slot.endpoint.url.clone())
            .collect();

        let mut results = Vec::with_capacity(urls.len());
        for url in urls {
            let result = self.reconnect(&url).await;
            results.push((url, result));
        }
        results
    }

    /// Cancel pending retries and close every connection.
    pub async fn disconnect_all(&self) {
        let closing: Vec<(String, Arc<dyn Transport>)> = {
            let mut slots = self.inner.slots.lock();
            slots
                .iter_mut()
                .filter_map(|(url, slot)| {
                    let transport = slot.teardown();
                    slot.endpoint.state = EndpointState::Disconnected;
                    transport.map(|t| (url.clone(), t))
                })
                .collect()
        };
        info!("Disconnecting from {} relays", closing.len());

        for (url, transport) in closing {
            transport.close().await;
            self.inner.status.notify(&StatusEvent::Disconnected {
                relay_url: url,
                reason: "disconnected by client".to_string(),
            });
        }
    }

    /// Relays currently connected. Re-derive before every send.
    pub fn connected_endpoints(&self) -> Vec<String> {
        self.collect_urls(|e| e.is_connected())
    }

    /// Connected relays that serve queries and subscriptions.
    pub fn readable_endpoints(&self) -> Vec<String> {
        self.collect_urls(|e| e.is_connected() && e.read)
    }

    /// Connected relays that accept published events.
    pub fn writable_endpoints(&self) -> Vec<String> {
        self.collect_urls(|e| e.is_connected() && e.write)
    }

    fn collect_urls(&self, keep: impl Fn(&Endpoint) -> bool) -> Vec<String> {
        self.inner
            .slots
            .lock()
            .values()
            .filter(|slot| keep(&slot.endpoint))
            .map(|slot| slot.endpoint.url.clone())
            .collect()
    }

    /// Send `message` to each of `urls`. Relays that are unknown or not
    /// connected are skipped. Returns the relays the message was handed to.
    pub async fn send(&self, urls: &[String], message: &ClientMessage) -> Vec<String> {
        let targets: Vec<(String, Arc<dyn Transport>, u64)> = {
            let slots = self.inner.slots.lock();
            urls.iter()
                .filter_map(|url| {
                    let slot = slots.get(url)?;
                    if !slot.endpoint.is_connected() {
                        debug!("Skipping send to disconnected relay {}", url);
                        return None;
                    }
                    let transport = slot.transport.clone()?;
                    Some((url.clone(), transport, slot.session))
                })
                .collect()
        };

        let sends = targets.iter().map(|(_, transport, _)| transport.send(message));
        let results = join_all(sends).await;

        let mut sent = Vec::with_capacity(targets.len());
        for ((url, _, session), result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => sent.push(url),
                Err(e) => handle_connection_error(&self.inner, &url, session, e).await,
            }
        }
        sent
    }

    /// Snapshot of every endpoint in configuration order.
    pub fn statuses(&self) -> Vec<Endpoint> {
        self.inner
            .slots
            .lock()
            .values()
            .map(|slot| slot.endpoint.clone())
            .collect()
    }

    /// Snapshot of one endpoint.
    pub fn endpoint(&self, url: &str) -> Option<Endpoint> {
        self.inner
            .slots
            .lock()
            .get(url)
            .map(|slot| slot.endpoint.clone())
    }

    /// Endpoint counts by state.
    pub fn health(&self) -> PoolHealth {
        let slots = self.inner.slots.lock();
        PoolHealth::from_endpoints(slots.values().map(|slot| &slot.endpoint))
    }

    /// Observe every inbound frame from every relay.
    pub fn on_frame(&self, callback: impl Fn(&InboundFrame) + Send + Sync + 'static) -> ObserverHandle {
        self.inner.frames.register(callback)
    }

    /// Observe connect, disconnect, error, suspension and removal events.
    pub fn on_status(&self, callback: impl Fn(&StatusEvent) + Send + Sync + 'static) -> ObserverHandle {
        self.inner.status.register(callback)
    }

    /// Observe transport failures with the relay they happened on.
    pub fn on_error(&self, callback: impl Fn(&EndpointError) + Send + Sync + 'static) -> ObserverHandle {
        self.inner.errors.register(callback)
    }

    /// Remove an observer registered through any `on_*` method.
    pub fn unobserve(&self, handle: ObserverHandle) -> bool {
        self.inner.frames.remove(handle)
            || self.inner.status.remove(handle)
            || self.inner.errors.remove(handle)
    }
}

/// One connect attempt. A relay already connected or connecting is left
/// alone, which keeps at most one attempt outstanding per relay.
async fn connect_endpoint(inner: &Arc<SupervisorInner>, url: &str) -> Result<()> {
    let (transport, session) = {
        let mut slots = inner.slots.lock();
        let slot = slots
            .get_mut(url)
            .ok_or_else(|| ClientError::UnknownRelay(url.to_string()))?;
        if slot.endpoint.is_busy() {
            debug!("Relay {} already {:?}", url, slot.endpoint.state);
            return Ok(());
        }
        let transport = match &slot.transport {
            Some(transport) => Arc::clone(transport),
            None => {
                let transport = inner.factory.create(url)?;
                slot.transport = Some(Arc::clone(&transport));
                transport
            }
        };
        slot.retry = None;
        slot.session += 1;
        slot.endpoint.state = EndpointState::Connecting;
        (transport, slot.session)
    };

    debug!("Connecting to relay: {}", url);
    let started = Instant::now();
    let connect_timeout = inner.config.connect_timeout();

    match timeout(connect_timeout, transport.connect()).await {
        Ok(Ok(receiver)) => {
            let accepted = {
                let mut slots = inner.slots.lock();
                match slots.get_mut(url) {
                    Some(slot) if slot.session == session => {
                        slot.endpoint.record_success(started.elapsed());
                        slot.reader = Some(spawn_reader(inner, url, session, receiver));
                        true
                    }
                    _ => false,
                }
            };
            if !accepted {
                // Removed or disconnected while the attempt was in flight.
                transport.close().await;
                return Err(ClientError::NotConnected);
            }
            info!("Connected to relay: {}", url);
            inner.status.notify(&StatusEvent::Connected {
                relay_url: url.to_string(),
            });
            Ok(())
        }
        Ok(Err(e)) => {
            let reported = e.to_transport(url);
            record_connect_failure(inner, url, session, reported);
            Err(e)
        }
        Err(_) => {
            transport.close().await;
            let message = format!("Connection timeout after {:?}", connect_timeout);
            record_connect_failure(inner, url, session, ClientError::Timeout(message.clone()));
            Err(ClientError::Timeout(message))
        }
    }
}

fn record_connect_failure(inner: &Arc<SupervisorInner>, url: &str, session: u64, error: ClientError) {
    let message = error.to_string();
    {
        let mut slots = inner.slots.lock();
        match slots.get_mut(url) {
            Some(slot) if slot.session == session => slot.endpoint.record_failure(&message),
            _ => return,
        }
    }
    warn!("Failed to connect to {}: {}", url, message);
    report_error(inner, url, error);
    schedule_retry(inner, url);
}

/// A live connection failed (send error). Tear it down and retry.
async fn handle_connection_error(inner: &Arc<SupervisorInner>, url: &str, session: u64, error: ClientError) {
    let message = error.to_string();
    let transport = {
        let mut slots = inner.slots.lock();
        match slots.get_mut(url) {
            Some(slot) if slot.session == session && slot.endpoint.is_connected() => {
                let transport = slot.teardown();
                slot.endpoint.state = EndpointState::Errored;
                slot.endpoint.last_error = Some(message.clone());
                transport
            }
            _ => return,
        }
    };
    warn!("Connection to {} failed: {}", url, message);
    if let Some(transport) = transport {
        transport.close().await;
    }
    report_error(inner, url, error);
    schedule_retry(inner, url);
}

fn report_error(inner: &SupervisorInner, url: &str, error: ClientError) {
    let message = error.to_string();
    inner.errors.notify(&EndpointError {
        relay_url: url.to_string(),
        error,
    });
    inner.status.notify(&StatusEvent::Errored {
        relay_url: url.to_string(),
        error: message,
    });
}

fn spawn_reader(inner: &Arc<SupervisorInner>, url: &str, session: u64, mut receiver: TransportReceiver) -> ScheduledTask {
    let weak = Arc::downgrade(inner);
    let url = url.to_string();
    ScheduledTask::spawn(async move {
        let reason = loop {
            match receiver.recv().await {
                Some(TransportEvent::Message(message)) => {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    deliver(&inner, &url, session, message);
                }
                Some(TransportEvent::Disconnected { reason }) => break reason,
                None => break "connection closed".to_string(),
            }
        };
        if let Some(inner) = weak.upgrade() {
            handle_disconnect(&inner, &url, session, reason);
        }
    })
}

fn deliver(inner: &SupervisorInner, url: &str, session: u64, message: RelayMessage) {
    {
        let mut slots = inner.slots.lock();
        match slots.get_mut(url) {
            Some(slot) if slot.session == session => slot.endpoint.messages_received += 1,
            _ => return,
        }
    }
    inner.frames.notify(&InboundFrame {
        relay_url: url.to_string(),
        message,
    });
}

/// Runs on the reader task itself, so it must not await.
fn handle_disconnect(inner: &Arc<SupervisorInner>, url: &str, session: u64, reason: String) {
    {
        let mut slots = inner.slots.lock();
        match slots.get_mut(url) {
            Some(slot) if slot.session == session => {
                slot.session += 1;
                slot.reader = None;
                slot.endpoint.state = EndpointState::Disconnected;
                slot.endpoint.last_error = Some(reason.clone());
            }
            _ => return,
        }
    }
    warn!("Relay {} disconnected: {}", url, reason);
    inner.status.notify(&StatusEvent::Disconnected {
        relay_url: url.to_string(),
        reason,
    });
    schedule_retry(inner, url);
}

/// Arm the retry timer unless one is pending or the budget is spent.
fn schedule_retry(inner: &Arc<SupervisorInner>, url: &str) {
    let max_attempts = inner.config.max_reconnect_attempts;
    let suspended = {
        let mut slots = inner.slots.lock();
        let Some(slot) = slots.get_mut(url) else {
            return;
        };
        if slot.retry.is_some() || slot.endpoint.is_busy() || slot.endpoint.suspended {
            return;
        }
        if slot.endpoint.reconnect_attempts >= max_attempts {
            slot.endpoint.suspended = true;
            true
        } else {
            slot.endpoint.reconnect_attempts += 1;
            let delay = inner.config.reconnect_delay();
            info!(
                "Scheduling reconnect to {} in {:?} (attempt {}/{})",
                url, delay, slot.endpoint.reconnect_attempts, max_attempts
            );
            slot.retry = Some(ScheduledTask::after(delay, retry(Arc::downgrade(inner), url.to_string())));
            false
        }
    };

    if suspended {
        warn!("Giving up on {} after {} reconnect attempts", url, max_attempts);
        inner.status.notify(&StatusEvent::Suspended {
            relay_url: url.to_string(),
        });
    }
}

async fn retry(weak: Weak<SupervisorInner>, url: String) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    // The attempt clears the timer slot, which would abort this task, so it
    // runs on its own task.
    tokio::spawn(async move {
        if let Err(e) = connect_endpoint(&inner, &url).await {
            debug!("Reconnect to {} failed: {}", url, e);
        }
    });
}
