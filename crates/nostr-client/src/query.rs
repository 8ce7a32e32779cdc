//! One-shot queries across every readable relay.

use crate::config::QueryConfig;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, CloseReason, Event, Filter, RelayMessage, any_matches, split_filters};
use crate::observer::ObserverHandle;
use crate::subscription::generate_subscription_id;
use crate::supervisor::{ConnectionSupervisor, InboundFrame, StatusEvent};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Overrides the configured query timeout
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

enum QueryUpdate {
    Frame(InboundFrame),
    /// The relay went away before finishing
    Lost(String),
}

struct QueryInner {
    supervisor: ConnectionSupervisor,
    config: QueryConfig,
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<QueryUpdate>>>,
    observers: Mutex<Vec<ObserverHandle>>,
}

impl Drop for QueryInner {
    fn drop(&mut self) {
        for handle in self.observers.get_mut().drain(..) {
            self.supervisor.unobserve(handle);
        }
    }
}

/// Unregisters a query's channel, also when the caller stops waiting.
struct PendingQuery<'a> {
    inner: &'a QueryInner,
    id: String,
}

impl Drop for PendingQuery<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

/// Runs point-in-time queries without leaving a subscription open.
#[derive(Clone)]
pub struct QueryExecutor {
    inner: Arc<QueryInner>,
}

impl QueryExecutor {
    pub fn new(supervisor: ConnectionSupervisor, config: QueryConfig) -> Self {
        let inner = Arc::new(QueryInner {
            supervisor: supervisor.clone(),
            config,
            pending: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let frames = supervisor.on_frame(move |frame| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let Some(id) = frame.message.subscription_id() else {
                return;
            };
            if let Some(tx) = inner.pending.lock().get(id) {
                let _ = tx.send(QueryUpdate::Frame(frame.clone()));
            }
        });
        let weak = Arc::downgrade(&inner);
        let status = supervisor.on_status(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match event {
                StatusEvent::Disconnected { relay_url, .. }
                | StatusEvent::Errored { relay_url, .. }
                | StatusEvent::Removed { relay_url } => {
                    for tx in inner.pending.lock().values() {
                        let _ = tx.send(QueryUpdate::Lost(relay_url.clone()));
                    }
                }
                _ => {}
            }
        });
        inner.observers.lock().extend([frames, status]);

        Self { inner }
    }

    /// Collect every matching event from every readable relay.
    ///
    /// Waits until each queried relay has sent EOSE, closed the request or
    /// disconnected, or until the timeout, whichever comes first. A timeout
    /// returns what arrived so far. Results are deduplicated by id and
    /// ordered newest first.
    pub async fn fetch_many(&self, filters: Vec<Filter>, options: QueryOptions) -> Result<Vec<Event>> {
        if filters.is_empty() {
            return Err(ClientError::Configuration(
                "query requires at least one filter".to_string(),
            ));
        }
        let relays = self.inner.supervisor.readable_endpoints();
        if relays.is_empty() {
            return Err(ClientError::NoEndpointsAvailable);
        }

        let deadline = Instant::now() + options.timeout.unwrap_or(self.inner.config.timeout());
        let id = generate_subscription_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.pending.lock().insert(id.clone(), tx);
        let pending = PendingQuery {
            inner: &self.inner,
            id: id.clone(),
        };

        let req = ClientMessage::Req {
            subscription_id: id.clone(),
            filters: split_filters(&filters, self.inner.config.batch_size),
        };
        let sent = self.inner.supervisor.send(&relays, &req).await;
        debug!("Query {} sent to {} relays", id, sent.len());

        let mut waiting: HashSet<String> = sent.iter().cloned().collect();
        let mut closed_by_relay = HashSet::new();
        let mut events: IndexMap<String, Event> = IndexMap::new();

        while !waiting.is_empty() {
            let update = match timeout_at(deadline, rx.recv()).await {
                Ok(Some(update)) => update,
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        "Query {} timed out waiting on {} relays",
                        id,
                        waiting.len()
                    );
                    break;
                }
            };
            match update {
                QueryUpdate::Frame(InboundFrame { relay_url, message }) => match message {
                    RelayMessage::Event { event, .. } => {
                        if any_matches(&filters, &event) {
                            events.entry(event.id.clone()).or_insert(event);
                        }
                    }
                    RelayMessage::Eose { .. } => {
                        waiting.remove(&relay_url);
                    }
                    RelayMessage::Closed { message, .. } => {
                        if CloseReason::from_message(&message).is_rate_limited() {
                            warn!("Query {} rate limited by {}: {}", id, relay_url, message);
                        } else {
                            warn!("Query {} closed by {}: {}", id, relay_url, message);
                        }
                        waiting.remove(&relay_url);
                        closed_by_relay.insert(relay_url);
                    }
                    _ => {}
                },
                QueryUpdate::Lost(relay_url) => {
                    waiting.remove(&relay_url);
                }
            }
        }

        drop(pending);
        let open: Vec<String> = sent
            .into_iter()
            .filter(|relay| !closed_by_relay.contains(relay))
            .collect();
        if !open.is_empty() {
            let close = ClientMessage::Close {
                subscription_id: id,
            };
            self.inner.supervisor.send(&open, &close).await;
        }

        let mut events: Vec<Event> = events.into_values().collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events)
    }

    /// The most recent matching event, if any relay has one.
    pub async fn fetch_one(&self, filters: Vec<Filter>, options: QueryOptions) -> Result<Option<Event>> {
        let filters = filters
            .into_iter()
            .map(|filter| match filter.limit {
                Some(_) => filter,
                None => filter.limit(1),
            })
            .collect();
        let events = self.fetch_many(filters, options).await?;
        Ok(events.into_iter().next())
    }

    /// Queries currently waiting on relays.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.lock().len()
    }
}
