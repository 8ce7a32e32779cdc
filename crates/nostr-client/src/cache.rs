//! Metadata cache with batched refill and staleness tracking.
//!
//! Records are keyed by author public key and hold the parsed content of
//! that author's newest kind-0 event. Misses and stale records are queued,
//! collected over a short window and fetched with one multi-author query.

use crate::config::CacheConfig;
use crate::error::{ClientError, Result};
use crate::message::{Event, Filter};
use crate::query::{QueryExecutor, QueryOptions};
use crate::subscription::{SubscribeOptions, SubscriptionHandlers, SubscriptionRegistry};
use crate::task::ScheduledTask;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Kind of user metadata events
pub const KIND_METADATA: u16 = 0;

/// User metadata carried in kind-0 content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
    /// Fields without a dedicated slot
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Metadata {
    /// Parse the content of a kind-0 event.
    pub fn from_event(event: &Event) -> Result<Self> {
        if event.kind != KIND_METADATA {
            return Err(ClientError::Configuration(format!(
                "expected kind {} event, got kind {}",
                KIND_METADATA, event.kind
            )));
        }
        Ok(serde_json::from_str(&event.content)?)
    }

    /// Display name, falling back to name.
    pub fn best_name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(self.name.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Queued or in flight
    Fetching,
    /// Last fetch or live update succeeded
    Fresh,
    /// Last fetch failed; retried on next access
    Failed,
    /// Failure ceiling reached; not fetched again until invalidated
    Unavailable,
}

/// Snapshot of one cached record.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedMetadataRecord {
    pub key: String,
    pub payload: Option<Metadata>,
    /// Event the payload came from, when known
    pub event_id: Option<String>,
    pub fetched_at: Option<Instant>,
    /// `created_at` of the source event
    pub asserted_at: Option<u64>,
    pub stale: bool,
    pub failures: u32,
    pub status: RecordStatus,
}

/// Result of a live update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The cached payload is as new or newer
    StaleIgnored,
}

struct Entry {
    key: String,
    payload: Option<Metadata>,
    event_id: Option<String>,
    fetched_at: Option<Instant>,
    asserted_at: Option<u64>,
    invalidated: bool,
    failures: u32,
    status: RecordStatus,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Entry {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            payload: None,
            event_id: None,
            fetched_at: None,
            asserted_at: None,
            invalidated: false,
            failures: 0,
            status: RecordStatus::Fetching,
            waiters: Vec::new(),
        }
    }

    fn is_stale(&self, config: &CacheConfig, now: Instant) -> bool {
        if self.invalidated {
            return true;
        }
        match self.fetched_at {
            Some(fetched_at) => now.duration_since(fetched_at) >= config.expiration(),
            None => true,
        }
    }

    fn snapshot(&self, config: &CacheConfig, now: Instant) -> CachedMetadataRecord {
        CachedMetadataRecord {
            key: self.key.clone(),
            payload: self.payload.clone(),
            event_id: self.event_id.clone(),
            fetched_at: self.fetched_at,
            asserted_at: self.asserted_at,
            stale: self.is_stale(config, now),
            failures: self.failures,
            status: self.status,
        }
    }

    /// Store `payload` if strictly newer than what is held.
    fn offer(&mut self, payload: Metadata, asserted_at: u64, event_id: Option<String>) -> ApplyOutcome {
        if self.asserted_at.is_some_and(|current| asserted_at <= current) {
            return ApplyOutcome::StaleIgnored;
        }
        self.payload = Some(payload);
        self.asserted_at = Some(asserted_at);
        self.event_id = event_id;
        ApplyOutcome::Applied
    }

    fn mark_fresh(&mut self, now: Instant) {
        self.fetched_at = Some(now);
        self.invalidated = false;
        self.failures = 0;
        self.status = RecordStatus::Fresh;
    }

    /// No relay could be asked. The key keeps its failure count and stays
    /// fetchable.
    fn mark_unreachable(&mut self) {
        self.status = if self.fetched_at.is_some() {
            RecordStatus::Fresh
        } else {
            RecordStatus::Failed
        };
    }

    fn mark_failed(&mut self, max_attempts: u32) {
        self.failures = self.failures.saturating_add(1);
        self.status = if self.failures >= max_attempts {
            RecordStatus::Unavailable
        } else {
            RecordStatus::Failed
        };
    }
}

enum Plan {
    Fetch,
    Join,
    Skip,
}

#[derive(Default)]
struct CacheState {
    records: HashMap<String, Entry>,
    queue: IndexSet<String>,
    batch_timer: Option<ScheduledTask>,
}

struct CacheInner {
    query: QueryExecutor,
    registry: SubscriptionRegistry,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

/// Best-effort fresh mapping from author key to metadata.
#[derive(Clone)]
pub struct MetadataCache {
    inner: Arc<CacheInner>,
}

impl MetadataCache {
    pub fn new(query: QueryExecutor, registry: SubscriptionRegistry, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                query,
                registry,
                config,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Current record, possibly stale. Never fetches.
    pub fn get(&self, key: &str) -> Option<CachedMetadataRecord> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        state
            .records
            .get(key)
            .map(|entry| entry.snapshot(&self.inner.config, now))
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make sure `key` is fresh, fetching it if needed, and return the
    /// record once any fetch has settled.
    pub async fn ensure_fresh(&self, key: &str) -> Option<CachedMetadataRecord> {
        let mut records = self.ensure_fresh_batch([key]).await;
        records.shift_remove(key)
    }

    /// [`ensure_fresh`](Self::ensure_fresh) for many keys at once. Keys
    /// needing a fetch share batch queries; keys already being fetched wait
    /// on the fetch in flight.
    pub async fn ensure_fresh_batch<I, K>(&self, keys: I) -> IndexMap<String, CachedMetadataRecord>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys: IndexSet<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        let mut waiting = Vec::new();
        {
            let now = Instant::now();
            let mut state = self.inner.state.lock();
            for key in &keys {
                let (tx, rx) = oneshot::channel();
                match plan(&state.records, key, &self.inner.config, now) {
                    Plan::Skip => continue,
                    Plan::Join => {}
                    Plan::Fetch => {
                        state
                            .records
                            .entry(key.clone())
                            .or_insert_with(|| Entry::new(key))
                            .status = RecordStatus::Fetching;
                        state.queue.insert(key.clone());
                    }
                }
                if let Some(entry) = state.records.get_mut(key) {
                    entry.waiters.push(tx);
                    waiting.push(rx);
                }
            }
            self.arm_batch(&mut state);
        }

        for rx in waiting {
            let _ = rx.await;
        }

        let now = Instant::now();
        let state = self.inner.state.lock();
        keys.into_iter()
            .filter_map(|key| {
                let record = state.records.get(&key)?.snapshot(&self.inner.config, now);
                Some((key, record))
            })
            .collect()
    }

    /// Flush now when the queue is full, otherwise make sure a window timer
    /// is pending.
    fn arm_batch(&self, state: &mut CacheState) {
        if state.queue.is_empty() {
            return;
        }
        if state.queue.len() >= self.inner.config.batch_limit() {
            flush(&self.inner, state);
            return;
        }
        if state.batch_timer.is_none() {
            let inner = Arc::clone(&self.inner);
            state.batch_timer = Some(ScheduledTask::after(
                self.inner.config.batch_window(),
                async move {
                    let mut state = inner.state.lock();
                    flush(&inner, &mut state);
                },
            ));
        }
    }

    /// Apply a payload from a live subscription. Only a strictly newer
    /// `asserted_at` replaces the stored payload.
    pub fn apply_live_update(&self, key: &str, payload: Metadata, asserted_at: u64) -> ApplyOutcome {
        self.apply(key, payload, asserted_at, None)
    }

    /// Apply a kind-0 event received outside of a fetch.
    pub fn apply_event(&self, event: &Event) -> Result<ApplyOutcome> {
        let metadata = Metadata::from_event(event)?;
        Ok(self.apply(&event.pubkey, metadata, event.created_at, Some(event.id.clone())))
    }

    fn apply(&self, key: &str, payload: Metadata, asserted_at: u64, event_id: Option<String>) -> ApplyOutcome {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let entry = state
            .records
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(key));
        let outcome = entry.offer(payload, asserted_at, event_id);
        match outcome {
            ApplyOutcome::Applied => {
                // An in-flight fetch keeps its status and resolves its waiters.
                let fetching = entry.status == RecordStatus::Fetching && !entry.waiters.is_empty();
                entry.mark_fresh(now);
                if fetching {
                    entry.status = RecordStatus::Fetching;
                }
                debug!("Applied live metadata for {} at {}", key, asserted_at);
            }
            ApplyOutcome::StaleIgnored => {
                debug!("Ignoring stale metadata for {} at {}", key, asserted_at);
            }
        }
        outcome
    }

    /// Mark a record stale and give it a fresh failure budget.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.records.get_mut(key) else {
            return false;
        };
        entry.invalidated = true;
        entry.failures = 0;
        if entry.status == RecordStatus::Unavailable {
            entry.status = RecordStatus::Failed;
        }
        true
    }

    /// Follow kind-0 updates for `keys` live. Returns the subscription id.
    pub async fn subscribe_live<I, K>(&self, keys: I) -> Result<String>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let authors: Vec<String> = keys.into_iter().map(Into::into).collect();
        if authors.is_empty() {
            return Err(ClientError::Configuration(
                "live metadata subscription requires at least one key".to_string(),
            ));
        }
        let weak = Arc::downgrade(&self.inner);
        let handlers = SubscriptionHandlers::new(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(e) = (MetadataCache { inner }).apply_event(event) {
                warn!("Ignoring unparseable metadata event {}: {}", event.id, e);
            }
        });
        let filter = Filter::new().kinds([KIND_METADATA]).authors(authors);
        self.inner
            .registry
            .subscribe(vec![filter], handlers, SubscribeOptions::new())
            .await
    }
}

fn plan(records: &HashMap<String, Entry>, key: &str, config: &CacheConfig, now: Instant) -> Plan {
    let Some(entry) = records.get(key) else {
        return Plan::Fetch;
    };
    match entry.status {
        RecordStatus::Fetching if !entry.waiters.is_empty() => Plan::Join,
        RecordStatus::Fetching => Plan::Fetch,
        RecordStatus::Unavailable => Plan::Skip,
        RecordStatus::Failed => Plan::Fetch,
        RecordStatus::Fresh if entry.is_stale(config, now) => Plan::Fetch,
        RecordStatus::Fresh => Plan::Skip,
    }
}

/// Drain the queue into batch queries. Runs under the state lock, possibly
/// on the window timer's own task, so the queries are spawned.
fn flush(inner: &Arc<CacheInner>, state: &mut CacheState) {
    state.batch_timer = None;
    let keys: Vec<String> = state.queue.drain(..).collect();
    for chunk in keys.chunks(inner.config.batch_limit()) {
        let inner = Arc::clone(inner);
        let chunk = chunk.to_vec();
        tokio::spawn(async move { run_batch(&inner, chunk).await });
    }
}

async fn run_batch(inner: &CacheInner, keys: Vec<String>) {
    info!("Fetching metadata for {} keys", keys.len());
    let filter = Filter::new().kinds([KIND_METADATA]).authors(keys.iter().cloned());
    let options = QueryOptions::timeout(inner.config.fetch_timeout());
    let result = inner.query.fetch_many(vec![filter], options).await;

    // Newest first, so the first event per author wins.
    let mut newest: HashMap<String, Event> = HashMap::new();
    let mut unreachable = false;
    match result {
        Ok(events) => {
            for event in events {
                newest.entry(event.pubkey.clone()).or_insert(event);
            }
        }
        Err(ClientError::NoEndpointsAvailable) => {
            warn!("No relays available for metadata batch of {} keys", keys.len());
            unreachable = true;
        }
        Err(e) => warn!("Metadata batch of {} keys failed: {}", keys.len(), e),
    }

    let now = Instant::now();
    let max_attempts = inner.config.max_fetch_attempts;
    let mut waiters = Vec::new();
    {
        let mut state = inner.state.lock();
        for key in &keys {
            let Some(entry) = state.records.get_mut(key) else {
                continue;
            };
            if unreachable {
                entry.mark_unreachable();
                waiters.append(&mut entry.waiters);
                continue;
            }
            match newest.remove(key).map(|event| (Metadata::from_event(&event), event)) {
                Some((Ok(metadata), event)) => {
                    entry.offer(metadata, event.created_at, Some(event.id));
                    entry.mark_fresh(now);
                }
                Some((Err(e), event)) => {
                    warn!("Unparseable metadata {} for {}: {}", event.id, key, e);
                    entry.mark_failed(max_attempts);
                }
                None => {
                    debug!("No metadata found for {}", key);
                    entry.mark_failed(max_attempts);
                }
            }
            waiters.append(&mut entry.waiters);
        }
    }
    for waiter in waiters {
        let _ = waiter.send(());
    }
}
