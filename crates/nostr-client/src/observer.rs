//! Typed observer lists.
//!
//! Observers are plain callbacks. A panicking observer is logged and
//! skipped; the remaining observers still run.

use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Token returned on registration, used to remove the observer again.
/// Handles are unique across all lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

pub struct ObserverList<T> {
    name: &'static str,
    observers: Mutex<Vec<(ObserverHandle, Callback<T>)>>,
}

impl<T> ObserverList<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ObserverHandle {
        let handle = ObserverHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((handle, Arc::new(callback)));
        handle
    }

    pub fn remove(&self, handle: ObserverHandle) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(h, _)| *h != handle);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every observer with `value`. Returns how many panicked.
    pub fn notify(&self, value: &T) -> usize {
        // Snapshot so observers can register/remove while being notified.
        let snapshot: Vec<Callback<T>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        let mut failures = 0;
        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                failures += 1;
                warn!("{} observer panicked; continuing with remaining observers", self.name);
            }
        }
        failures
    }
}
