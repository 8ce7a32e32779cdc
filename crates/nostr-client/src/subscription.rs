//! Live subscriptions multiplexed over every connected relay.
//!
//! One logical subscription is issued to each readable relay. Inbound events
//! are matched against every active subscription's filters and delivered at
//! most once per event id, no matter how many relays return them.

use crate::config::SubscriptionConfig;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, CloseReason, Event, Filter, RelayMessage, any_matches, split_filters};
use crate::observer::ObserverHandle;
use crate::supervisor::{ConnectionSupervisor, InboundFrame, StatusEvent};
use crate::task::ScheduledTask;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;
type EoseCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Callbacks of one subscription.
#[derive(Clone)]
pub struct SubscriptionHandlers {
    on_event: EventCallback,
    on_eose: Option<EoseCallback>,
    on_error: Option<ErrorCallback>,
}

impl SubscriptionHandlers {
    pub fn new(on_event: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        Self {
            on_event: Arc::new(on_event),
            on_eose: None,
            on_error: None,
        }
    }

    /// Called once every issued relay has finished sending stored events,
    /// or when the EOSE deadline passes first.
    pub fn on_eose(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_eose = Some(Arc::new(callback));
        self
    }

    /// Called when a relay closes the subscription.
    pub fn on_error(mut self, callback: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// Per-subscription overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Caller-chosen id; generated when absent
    pub id: Option<String>,
    /// Overrides the configured EOSE deadline
    pub eose_timeout: Option<Duration>,
    pub max_events: Option<usize>,
    /// Tear down on reaching `max_events`, or on an EOSE timeout when
    /// nothing arrived
    pub auto_close: bool,
    /// Tear down once stored events are complete
    pub close_on_eose: bool,
}

impl SubscribeOptions {
    /// Options with every default: generated id, configured EOSE deadline,
    /// no cap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `id` instead of a generated subscription id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Deadline for stored events, overriding the configured one.
    pub fn eose_timeout(mut self, timeout: Duration) -> Self {
        self.eose_timeout = Some(timeout);
        self
    }

    /// Stop delivering after `max` distinct events.
    pub fn max_events(mut self, max: usize) -> Self {
        self.max_events = Some(max);
        self
    }

    /// Tear down at the cap or at an EOSE deadline that saw nothing.
    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    /// Tear down once every relay has finished sending stored events.
    pub fn close_on_eose(mut self, close: bool) -> Self {
        self.close_on_eose = close;
        self
    }
}

/// Tracks which relays were issued a subscription and which are done with
/// stored events (EOSE or CLOSED).
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTracker {
    pub relays: HashSet<String>,
    pub done_relays: HashSet<String>,
}

impl SubscriptionTracker {
    /// Track a relay the subscription was issued to.
    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        let relay_url = relay_url.into();
        self.done_relays.remove(&relay_url);
        self.relays.insert(relay_url);
    }

    /// Stop tracking a relay. Returns whether it was tracked.
    pub fn remove_relay(&mut self, relay_url: &str) -> bool {
        self.done_relays.remove(relay_url);
        self.relays.remove(relay_url)
    }

    /// Record EOSE or CLOSED from a tracked relay.
    pub fn mark_done(&mut self, relay_url: &str) {
        if self.relays.contains(relay_url) {
            self.done_relays.insert(relay_url.to_string());
        }
    }

    pub fn has_relay(&self, relay_url: &str) -> bool {
        self.relays.contains(relay_url)
    }

    /// Every tracked relay is done. False while nothing is tracked.
    pub fn all_done(&self) -> bool {
        !self.relays.is_empty() && self.relays.len() == self.done_relays.len()
    }
}

/// Event ids already delivered to one subscription. Holds at most
/// `capacity` ids; the oldest are forgotten first.
#[derive(Debug)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` when `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Read-only view of an active subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub filters: Vec<Filter>,
    pub delivered: usize,
    pub created_at: Instant,
    pub last_event_at: Option<Instant>,
    pub relays: Vec<String>,
    pub eose_relays: Vec<String>,
    pub eose_received: bool,
    pub max_events: Option<usize>,
    pub auto_close: bool,
    /// Reached `max_events` without auto-close; open but silent
    pub capped: bool,
}

struct ActiveSubscription {
    id: String,
    filters: Vec<Filter>,
    /// Filters as sent on the wire, batched
    wire_filters: Vec<Filter>,
    handlers: SubscriptionHandlers,
    options: SubscribeOptions,
    seen: SeenIds,
    delivered: usize,
    created_at: Instant,
    last_event_at: Option<Instant>,
    tracker: SubscriptionTracker,
    eose_fired: bool,
    capped: bool,
    eose_timer: Option<ScheduledTask>,
}

impl ActiveSubscription {
    fn info(&self) -> SubscriptionInfo {
        let mut relays: Vec<String> = self.tracker.relays.iter().cloned().collect();
        let mut eose_relays: Vec<String> = self.tracker.done_relays.iter().cloned().collect();
        relays.sort();
        eose_relays.sort();
        SubscriptionInfo {
            id: self.id.clone(),
            filters: self.filters.clone(),
            delivered: self.delivered,
            created_at: self.created_at,
            last_event_at: self.last_event_at,
            relays,
            eose_relays,
            eose_received: self.eose_fired,
            max_events: self.options.max_events,
            auto_close: self.options.auto_close,
            capped: self.capped,
        }
    }

    /// Fire the completion callback at most once.
    fn take_eose(&mut self) -> Option<Option<EoseCallback>> {
        if self.eose_fired {
            return None;
        }
        self.eose_fired = true;
        self.eose_timer = None;
        Some(self.handlers.on_eose.clone())
    }
}

/// Work collected under the lock and run after it is released.
#[derive(Default)]
struct Deferred {
    events: Vec<(EventCallback, Event)>,
    eose: Vec<EoseCallback>,
    errors: Vec<(ErrorCallback, ClientError)>,
    close: Vec<(String, Vec<String>)>,
    reissue: Vec<(String, Vec<Filter>, String)>,
}

struct RegistryInner {
    supervisor: ConnectionSupervisor,
    config: SubscriptionConfig,
    subscriptions: Mutex<IndexMap<String, ActiveSubscription>>,
    observers: Mutex<Vec<ObserverHandle>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for handle in self.observers.get_mut().drain(..) {
            self.supervisor.unobserve(handle);
        }
    }
}

/// Owns every live subscription.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(supervisor: ConnectionSupervisor, config: SubscriptionConfig) -> Self {
        let inner = Arc::new(RegistryInner {
            supervisor: supervisor.clone(),
            config,
            subscriptions: Mutex::new(IndexMap::new()),
            observers: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let frames = supervisor.on_frame(move |frame| {
            if let Some(inner) = weak.upgrade() {
                handle_frame(&inner, frame);
            }
        });
        let weak = Arc::downgrade(&inner);
        let status = supervisor.on_status(move |event| {
            if let Some(inner) = weak.upgrade() {
                handle_status(&inner, event);
            }
        });
        inner.observers.lock().extend([frames, status]);

        Self { inner }
    }

    /// Open a subscription on every connected, read-enabled relay.
    ///
    /// Fails with [`ClientError::Configuration`] for an empty filter set or
    /// an id already in use, and with [`ClientError::NoEndpointsAvailable`]
    /// when no relay can serve it. Neither case touches the network.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        handlers: SubscriptionHandlers,
        options: SubscribeOptions,
    ) -> Result<String> {
        if filters.is_empty() {
            return Err(ClientError::Configuration(
                "subscription requires at least one filter".to_string(),
            ));
        }
        if options.max_events == Some(0) {
            return Err(ClientError::Configuration(
                "max_events must be greater than zero".to_string(),
            ));
        }

        let relays = self.inner.supervisor.readable_endpoints();
        if relays.is_empty() {
            return Err(ClientError::NoEndpointsAvailable);
        }

        let id = options.id.clone().unwrap_or_else(generate_subscription_id);
        let wire_filters = split_filters(&filters, self.inner.config.batch_size);
        let eose_timeout = options.eose_timeout.or(self.inner.config.eose_timeout());

        {
            let mut subscriptions = self.inner.subscriptions.lock();
            if subscriptions.contains_key(&id) {
                return Err(ClientError::Configuration(format!(
                    "subscription id {} is already active",
                    id
                )));
            }
            let mut tracker = SubscriptionTracker::default();
            for relay in &relays {
                tracker.add_relay(relay.clone());
            }
            let eose_timer = eose_timeout.map(|timeout| {
                ScheduledTask::after(timeout, eose_deadline(Arc::downgrade(&self.inner), id.clone()))
            });
            subscriptions.insert(
                id.clone(),
                ActiveSubscription {
                    id: id.clone(),
                    filters,
                    wire_filters: wire_filters.clone(),
                    handlers,
                    options,
                    seen: SeenIds::new(self.inner.config.dedup_capacity),
                    delivered: 0,
                    created_at: Instant::now(),
                    last_event_at: None,
                    tracker,
                    eose_fired: false,
                    capped: false,
                    eose_timer,
                },
            );
        }

        info!(
            "Subscribing {} with {} filters on {} relays",
            id,
            wire_filters.len(),
            relays.len()
        );
        let req = ClientMessage::Req {
            subscription_id: id.clone(),
            filters: wire_filters,
        };
        let sent = self.inner.supervisor.send(&relays, &req).await;
        if sent.len() < relays.len() {
            // Drop relays the REQ never reached so completion only waits on
            // the rest.
            let mut subscriptions = self.inner.subscriptions.lock();
            if let Some(sub) = subscriptions.get_mut(&id) {
                for relay in relays.iter().filter(|r| !sent.contains(r)) {
                    sub.tracker.remove_relay(relay);
                }
            }
        }
        Ok(id)
    }

    /// Close a subscription. Unknown ids return `false`.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        let Some(sub) = self.inner.subscriptions.lock().shift_remove(id) else {
            return false;
        };
        info!("Unsubscribing {}", id);
        let relays: Vec<String> = sub.tracker.relays.into_iter().collect();
        drop(sub.eose_timer);
        let close = ClientMessage::Close {
            subscription_id: id.to_string(),
        };
        self.inner.supervisor.send(&relays, &close).await;
        true
    }

    /// Close every active subscription.
    pub async fn unsubscribe_all(&self) {
        for id in self.subscription_ids() {
            self.unsubscribe(&id).await;
        }
    }

    /// Ids of active subscriptions in creation order.
    pub fn subscription_ids(&self) -> Vec<String> {
        self.inner.subscriptions.lock().keys().cloned().collect()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.inner.subscriptions.lock().contains_key(id)
    }

    /// Current state of one subscription.
    pub fn snapshot(&self, id: &str) -> Option<SubscriptionInfo> {
        self.inner.subscriptions.lock().get(id).map(ActiveSubscription::info)
    }

    pub fn len(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn handle_frame(inner: &Arc<RegistryInner>, frame: &InboundFrame) {
    let mut deferred = Deferred::default();
    {
        let mut subscriptions = inner.subscriptions.lock();
        match &frame.message {
            RelayMessage::Event { event, .. } => {
                dispatch_event(&mut subscriptions, event, &mut deferred);
            }
            RelayMessage::Eose { subscription_id } => {
                if let Some(sub) = subscriptions.get_mut(subscription_id) {
                    debug!("EOSE for {} from {}", subscription_id, frame.relay_url);
                    sub.tracker.mark_done(&frame.relay_url);
                    check_complete(&mut subscriptions, subscription_id, &mut deferred);
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                if let Some(sub) = subscriptions.get_mut(subscription_id) {
                    warn!(
                        "Relay {} closed subscription {}: {}",
                        frame.relay_url, subscription_id, message
                    );
                    sub.tracker.mark_done(&frame.relay_url);
                    if let Some(on_error) = sub.handlers.on_error.clone() {
                        deferred.errors.push((on_error, closed_error(&frame.relay_url, subscription_id, message)));
                    }
                    check_complete(&mut subscriptions, subscription_id, &mut deferred);
                }
            }
            RelayMessage::Notice { message } => {
                debug!("Notice from {}: {}", frame.relay_url, message);
            }
            _ => {}
        }
    }
    run_deferred(inner, deferred);
}

fn closed_error(relay_url: &str, subscription_id: &str, message: &str) -> ClientError {
    if CloseReason::from_message(message).is_rate_limited() {
        ClientError::RateLimited {
            relay_url: relay_url.to_string(),
            message: message.to_string(),
        }
    } else {
        ClientError::SubscriptionClosed {
            relay_url: relay_url.to_string(),
            subscription_id: subscription_id.to_string(),
            message: message.to_string(),
        }
    }
}

fn dispatch_event(
    subscriptions: &mut IndexMap<String, ActiveSubscription>,
    event: &Event,
    deferred: &mut Deferred,
) {
    let mut finished = Vec::new();
    for sub in subscriptions.values_mut() {
        if sub.capped || !any_matches(&sub.filters, event) {
            continue;
        }
        if !sub.seen.insert(&event.id) {
            continue;
        }
        sub.delivered += 1;
        sub.last_event_at = Some(Instant::now());
        deferred.events.push((Arc::clone(&sub.handlers.on_event), event.clone()));

        if sub.options.max_events.is_some_and(|max| sub.delivered >= max) {
            if sub.options.auto_close {
                debug!("Subscription {} reached its cap; closing", sub.id);
                finished.push(sub.id.clone());
            } else {
                debug!("Subscription {} reached its cap", sub.id);
                sub.capped = true;
            }
        }
    }
    for id in finished {
        if let Some(sub) = subscriptions.shift_remove(&id) {
            deferred.close.push((id, sub.tracker.relays.into_iter().collect()));
        }
    }
}

fn check_complete(
    subscriptions: &mut IndexMap<String, ActiveSubscription>,
    id: &str,
    deferred: &mut Deferred,
) {
    let Some(sub) = subscriptions.get_mut(id) else {
        return;
    };
    if !sub.tracker.all_done() {
        return;
    }
    let Some(on_eose) = sub.take_eose() else {
        return;
    };
    deferred.eose.extend(on_eose);
    if sub.options.close_on_eose {
        if let Some(sub) = subscriptions.shift_remove(id) {
            deferred.close.push((id.to_string(), sub.tracker.relays.into_iter().collect()));
        }
    }
}

fn handle_status(inner: &Arc<RegistryInner>, event: &StatusEvent) {
    let mut deferred = Deferred::default();
    match event {
        StatusEvent::Connected { relay_url } => {
            if !inner.config.reissue_on_reconnect {
                return;
            }
            let readable = inner
                .supervisor
                .endpoint(relay_url)
                .is_some_and(|endpoint| endpoint.read);
            if !readable {
                return;
            }
            let mut subscriptions = inner.subscriptions.lock();
            for sub in subscriptions.values_mut() {
                if sub.tracker.has_relay(relay_url) {
                    continue;
                }
                sub.tracker.add_relay(relay_url.clone());
                deferred
                    .reissue
                    .push((sub.id.clone(), sub.wire_filters.clone(), relay_url.clone()));
            }
        }
        StatusEvent::Disconnected { relay_url, .. }
        | StatusEvent::Errored { relay_url, .. }
        | StatusEvent::Removed { relay_url } => {
            let mut subscriptions = inner.subscriptions.lock();
            let affected: Vec<String> = subscriptions
                .values_mut()
                .filter_map(|sub| sub.tracker.remove_relay(relay_url).then(|| sub.id.clone()))
                .collect();
            for id in affected {
                check_complete(&mut subscriptions, &id, &mut deferred);
            }
        }
        StatusEvent::Suspended { .. } => {}
    }
    run_deferred(inner, deferred);
}

/// Run one subscription callback; a panic is logged and does not stop the
/// callbacks after it.
fn isolated(kind: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!("Subscription {} callback panicked; continuing with remaining callbacks", kind);
    }
}

fn run_deferred(inner: &Arc<RegistryInner>, deferred: Deferred) {
    for (callback, event) in deferred.events {
        isolated("event", || callback(&event));
    }
    for callback in deferred.eose {
        isolated("EOSE", || callback());
    }
    for (callback, error) in deferred.errors {
        isolated("error", || callback(&error));
    }
    for (id, relays) in deferred.close {
        let supervisor = inner.supervisor.clone();
        tokio::spawn(async move {
            let close = ClientMessage::Close { subscription_id: id };
            supervisor.send(&relays, &close).await;
        });
    }
    for (id, filters, relay_url) in deferred.reissue {
        info!("Reissuing subscription {} on {}", id, relay_url);
        let supervisor = inner.supervisor.clone();
        tokio::spawn(async move {
            let req = ClientMessage::Req {
                subscription_id: id,
                filters,
            };
            supervisor.send(&[relay_url], &req).await;
        });
    }
}

/// EOSE deadline passed before every issued relay finished. Completion is
/// synthesized from what arrived; auto-close applies only when nothing did.
async fn eose_deadline(weak: Weak<RegistryInner>, id: String) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let mut deferred = Deferred::default();
    {
        let mut subscriptions = inner.subscriptions.lock();
        let Some(sub) = subscriptions.get_mut(&id) else {
            return;
        };
        let Some(on_eose) = sub.take_eose() else {
            return;
        };
        let nothing_arrived = sub.delivered == 0 && sub.tracker.done_relays.is_empty();
        warn!(
            "EOSE timeout for subscription {} ({} of {} relays done)",
            id,
            sub.tracker.done_relays.len(),
            sub.tracker.relays.len()
        );
        deferred.eose.extend(on_eose);
        if sub.options.auto_close && nothing_arrived {
            if let Some(sub) = subscriptions.shift_remove(&id) {
                deferred.close.push((id.clone(), sub.tracker.relays.into_iter().collect()));
            }
        }
    }
    run_deferred(&inner, deferred);
}
