//! Level-triggered work queue keyed by resource identity.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tandem_core::{BackoffPolicy, ObjectKey, ResourceVersion, WorkItem};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Default)]
struct QueueState {
    /// Keys ready to be taken, FIFO. Every entry is also in `dirty`.
    queue: VecDeque<ObjectKey>,
    /// Keys that need a run, with the latest triggering version.
    dirty: FxHashMap<ObjectKey, Option<ResourceVersion>>,
    /// Keys currently held by a worker.
    processing: FxHashSet<ObjectKey>,
    /// Consecutive rate-limited requeues per key.
    failures: FxHashMap<ObjectKey, u32>,
    shutting_down: bool,
}

/// Deduplicating work coordinator.
///
/// - `add` on a key that is already queued only refreshes its trigger.
/// - `add` on a key a worker holds marks it dirty; `done` requeues it once.
/// - `take` hands out a key and marks it processing, so no two workers
///   ever hold the same identity.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
}

impl WorkQueue {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { state: Mutex::new(QueueState::default()), notify: Notify::new(), backoff, cancel: CancellationToken::new() }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, item: WorkItem) {
        let mut st = self.lock();
        if st.shutting_down {
            debug!(key = %item.key, "queue shutting down; add ignored");
            return;
        }
        if let Some(trigger) = st.dirty.get_mut(&item.key) {
            if item.trigger.is_some() {
                *trigger = item.trigger;
            }
            return;
        }
        st.dirty.insert(item.key.clone(), item.trigger);
        if st.processing.contains(&item.key) {
            return;
        }
        st.queue.push_back(item.key);
        metrics::gauge!("workqueue_depth", st.queue.len() as f64);
        drop(st);
        self.notify.notify_one();
    }

    /// Add after `delay`, unless the queue shuts down first.
    pub fn add_after(self: &Arc<Self>, item: WorkItem, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = q.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => q.add(item),
            }
        });
    }

    /// Requeue with per-key exponential backoff. Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, item: WorkItem) -> Duration {
        let attempt = {
            let mut st = self.lock();
            let n = st.failures.entry(item.key.clone()).or_insert(0);
            let attempt = *n;
            *n = n.saturating_add(1);
            attempt
        };
        let delay = self.backoff.delay(attempt);
        self.add_after(item, delay);
        delay
    }

    /// Clear the backoff history of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Block until a key is available. `None` once shut down.
    pub async fn take(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    let trigger = st.dirty.remove(&key).flatten();
                    st.processing.insert(key.clone());
                    let more = !st.queue.is_empty();
                    metrics::gauge!("workqueue_depth", st.queue.len() as f64);
                    drop(st);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(WorkItem { key, trigger });
                }
            }
            notified.await;
        }
    }

    /// Release `key`. If it was re-added while held, it is queued again.
    pub fn done(&self, key: &ObjectKey) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.shutting_down || !st.dirty.contains_key(key) {
            return;
        }
        st.queue.push_back(key.clone());
        drop(st);
        self.notify.notify_one();
    }

    /// Keys waiting to be taken.
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Keys currently held by workers.
    pub fn in_flight(&self) -> Vec<ObjectKey> {
        let mut out: Vec<_> = self.lock().processing.iter().cloned().collect();
        out.sort();
        out
    }

    /// Stop handing out work. Queued keys that never started are dropped and logged.
    pub fn shut_down(&self) {
        let abandoned: Vec<ObjectKey> = {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            st.dirty.clear();
            st.queue.drain(..).collect()
        };
        self.cancel.cancel();
        for key in &abandoned {
            warn!(key = %key, "work item abandoned at shutdown");
        }
        self.notify.notify_waiters();
    }
}
