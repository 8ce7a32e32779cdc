//! In-memory relays implementing the transport boundary.
//!
//! Each [`MemoryRelay`] answers REQ with its stored events followed by EOSE,
//! acknowledges published events with OK, and records every message it was
//! sent. Behavior is scriptable so failure paths can be exercised without
//! sockets.

use crate::config::validate_relay_url;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Event, Filter, RelayMessage, any_matches};
use crate::transport::{Transport, TransportEvent, TransportFactory, TransportReceiver};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// How a relay reacts to connect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    #[default]
    Accept,
    /// Fail immediately
    Refuse,
    /// Never complete; the caller's timeout decides
    Hang,
}

#[derive(Default)]
struct RelayState {
    connect: ConnectBehavior,
    stored: Vec<Event>,
    /// Do not answer REQ at all
    silent: bool,
    /// Answer every REQ and EVENT with a `rate-limited:` rejection
    rate_limited: bool,
    inbound: Option<mpsc::UnboundedSender<TransportEvent>>,
    sent: Vec<ClientMessage>,
    open: IndexMap<String, Vec<Filter>>,
}

/// A scripted relay living in process memory.
pub struct MemoryRelay {
    url: String,
    state: Mutex<RelayState>,
    connect_attempts: AtomicUsize,
}

impl MemoryRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(RelayState::default()),
            connect_attempts: AtomicUsize::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state.lock().connect = behavior;
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    pub fn set_rate_limited(&self, rate_limited: bool) {
        self.state.lock().rate_limited = rate_limited;
    }

    /// Add an event to the relay's stored history.
    pub fn store(&self, event: Event) {
        self.state.lock().stored.push(event);
    }

    /// Deliver `event` live to every open subscription it matches.
    pub fn broadcast(&self, event: &Event) {
        let state = self.state.lock();
        let Some(tx) = state.inbound.as_ref() else {
            return;
        };
        for (subscription_id, filters) in &state.open {
            if any_matches(filters, event) {
                let _ = tx.send(TransportEvent::Message(RelayMessage::Event {
                    subscription_id: subscription_id.clone(),
                    event: event.clone(),
                }));
            }
        }
    }

    /// Push an arbitrary frame to the client.
    pub fn push(&self, message: RelayMessage) -> bool {
        match self.state.lock().inbound.as_ref() {
            Some(tx) => tx.send(TransportEvent::Message(message)).is_ok(),
            None => false,
        }
    }

    /// Simulate the relay dropping the connection.
    pub fn drop_connection(&self, reason: &str) {
        let mut state = self.state.lock();
        state.open.clear();
        if let Some(tx) = state.inbound.take() {
            let _ = tx.send(TransportEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().inbound.is_some()
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Every message the client sent, in order.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.state.lock().sent.clone()
    }

    /// Number of REQ messages received.
    pub fn req_count(&self) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|m| matches!(m, ClientMessage::Req { .. }))
            .count()
    }

    /// Filters of every REQ received, in order.
    pub fn requests(&self) -> Vec<(String, Vec<Filter>)> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|m| match m {
                ClientMessage::Req {
                    subscription_id,
                    filters,
                } => Some((subscription_id.clone(), filters.clone())),
                _ => None,
            })
            .collect()
    }

    /// Subscription ids currently open on this relay.
    pub fn open_subscriptions(&self) -> Vec<String> {
        self.state.lock().open.keys().cloned().collect()
    }

    fn answer(&self, state: &mut RelayState, message: &ClientMessage) {
        let Some(tx) = state.inbound.clone() else {
            return;
        };
        let send = |msg: RelayMessage| {
            let _ = tx.send(TransportEvent::Message(msg));
        };

        match message {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                if state.rate_limited {
                    send(RelayMessage::Closed {
                        subscription_id: subscription_id.clone(),
                        message: "rate-limited: slow down".to_string(),
                    });
                    return;
                }
                state.open.insert(subscription_id.clone(), filters.clone());
                if state.silent {
                    return;
                }
                for event in state.stored.iter().filter(|e| any_matches(filters, e)) {
                    send(RelayMessage::Event {
                        subscription_id: subscription_id.clone(),
                        event: event.clone(),
                    });
                }
                send(RelayMessage::Eose {
                    subscription_id: subscription_id.clone(),
                });
            }
            ClientMessage::Close { subscription_id } => {
                state.open.shift_remove(subscription_id);
            }
            ClientMessage::Event(event) => {
                if state.rate_limited {
                    send(RelayMessage::Ok {
                        event_id: event.id.clone(),
                        success: false,
                        message: "rate-limited: slow down".to_string(),
                    });
                    return;
                }
                if !state.stored.iter().any(|e| e.id == event.id) {
                    state.stored.push(event.clone());
                }
                if !state.silent {
                    send(RelayMessage::Ok {
                        event_id: event.id.clone(),
                        success: true,
                        message: String::new(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryRelay {
    async fn connect(&self) -> Result<TransportReceiver> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = self.state.lock().connect;
        match behavior {
            ConnectBehavior::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                let mut state = self.state.lock();
                state.inbound = Some(tx);
                state.open.clear();
                Ok(rx)
            }
            ConnectBehavior::Refuse => Err(ClientError::transport(&self.url, "connection refused")),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        let mut state = self.state.lock();
        if state.inbound.is_none() {
            return Err(ClientError::NotConnected);
        }
        state.sent.push(message.clone());
        self.answer(&mut state, message);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.inbound = None;
        state.open.clear();
    }
}

/// A set of memory relays addressed by URL.
#[derive(Default)]
pub struct MemoryNetwork {
    relays: Mutex<HashMap<String, Arc<MemoryRelay>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create the relay at `url`.
    pub fn relay(&self, url: &str) -> Arc<MemoryRelay> {
        Arc::clone(
            self.relays
                .lock()
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(MemoryRelay::new(url))),
        )
    }

    /// Total REQ messages received across all relays.
    pub fn total_req_count(&self) -> usize {
        self.relays.lock().values().map(|r| r.req_count()).sum()
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(&self, url: &str) -> Result<Arc<dyn Transport>> {
        validate_relay_url(url)?;
        Ok(self.relay(url))
    }
}
