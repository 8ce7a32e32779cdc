//! Owned handles for timers and background loops.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A spawned task that is aborted when the handle is cancelled or dropped.
///
/// Entities keep these in `Option` fields (retry timer, EOSE deadline,
/// batch window) so that clearing the field on a state transition cancels
/// the pending work.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawn `future` on the current runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Run `future` once `delay` has elapsed.
    pub fn after<F>(delay: Duration, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            future.await;
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
