//! Watch cache: one projection's local mirror, fed by list+watch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::{FutureExt, StreamExt};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tandem_core::{Backend, Error, EventStream, Object, ObjectKey, ProjectionKey, ResourceVersion, WatchEvent};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::CacheConfig;

/// Events applied per snapshot publish when the stream has a backlog.
const MAX_BATCH: usize = 256;

/// Ingestion state as seen by readers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    /// Bulk list in progress (initial, or rebuilding after a dropped watch).
    Listing,
    /// Seeded and following the watch stream. The only ready phase.
    Watching,
    /// Waiting out backoff before relisting.
    Reconnecting,
    /// Permanently rejected by the backend.
    Failed,
    /// Shut down.
    Stopped,
}

#[derive(Debug, Clone)]
struct Status {
    phase: Phase,
    fatal: Option<Error>,
}

/// Immutable point-in-time view of a cache's entries.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    /// Last collection version observed (list, event or bookmark).
    pub resource_version: Option<ResourceVersion>,
    pub entries: FxHashMap<ObjectKey, Arc<Object>>,
}

impl CacheSnapshot {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Object>> { self.entries.get(key).cloned() }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Entries ordered by key.
    pub fn list(&self) -> Vec<Arc<Object>> {
        let mut out: Vec<_> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| a.key().cmp(b.key()));
        out
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut out: Vec<_> = self.entries.keys().cloned().collect();
        out.sort();
        out
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Change {
    Applied,
    Deleted,
}

/// Emitted after the snapshot reflecting the change has been published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: ObjectKey,
    pub change: Change,
    pub resource_version: Option<ResourceVersion>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub epoch: u64,
    pub entries: usize,
    pub events: u64,
    /// Watch items dropped as undecodable.
    pub skipped: u64,
    pub lists: u64,
}

impl CacheStats {
    /// Lists after the initial one.
    pub fn relists(&self) -> u64 { self.lists.saturating_sub(1) }
}

/// Local mirror of one projection.
///
/// Reads never touch the network. Entries are mutated only by the ingestion
/// task spawned in [`WatchCache::spawn`]; readers load immutable snapshots.
pub struct WatchCache {
    key: ProjectionKey,
    snap: ArcSwap<CacheSnapshot>,
    status: watch::Sender<Status>,
    notify: broadcast::Sender<Notification>,
    events: AtomicU64,
    skipped: AtomicU64,
    lists: AtomicU64,
}

enum Step {
    Listing,
    Watching(ResourceVersion),
    Reconnecting,
}

enum StreamEnd {
    Cancelled,
    Dropped(String),
}

impl WatchCache {
    /// Create the cache and start its list+watch sequence in the background.
    /// Returns before the cache is populated.
    pub fn spawn(
        backend: Arc<dyn Backend>,
        key: ProjectionKey,
        config: CacheConfig,
        cancel: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (status, _) = watch::channel(Status { phase: Phase::Listing, fatal: None });
        let (notify, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let cache = Arc::new(Self {
            key,
            snap: ArcSwap::from_pointee(CacheSnapshot::default()),
            status,
            notify,
            events: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            lists: AtomicU64::new(0),
        });
        let handle = tokio::spawn(Arc::clone(&cache).run(backend, config, cancel));
        (cache, handle)
    }

    pub fn key(&self) -> &ProjectionKey { &self.key }

    pub fn phase(&self) -> Phase { self.status.borrow().phase }

    pub fn is_ready(&self) -> bool { self.phase() == Phase::Watching }

    /// Block until the cache is seeded and watching.
    pub async fn wait_ready(&self) -> Result<(), Error> {
        let mut rx = self.status.subscribe();
        loop {
            {
                let s = rx.borrow_and_update();
                if let Some(e) = &s.fatal {
                    return Err(e.clone());
                }
                match s.phase {
                    Phase::Watching => return Ok(()),
                    Phase::Stopped => return Err(Error::Transient(format!("cache {} stopped", self.key))),
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(Error::Transient(format!("cache {} dropped", self.key)));
            }
        }
    }

    /// Current snapshot once ready.
    pub async fn snapshot(&self) -> Result<Arc<CacheSnapshot>, Error> {
        self.wait_ready().await?;
        Ok(self.snap.load_full())
    }

    /// Current snapshot, or `None` while the cache is not ready.
    pub fn try_snapshot(&self) -> Option<Arc<CacheSnapshot>> {
        if self.is_ready() { Some(self.snap.load_full()) } else { None }
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<Option<Arc<Object>>, Error> {
        Ok(self.snapshot().await?.get(key))
    }

    pub async fn list(&self) -> Result<Vec<Arc<Object>>, Error> {
        Ok(self.snapshot().await?.list())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> { self.notify.subscribe() }

    pub fn stats(&self) -> CacheStats {
        let snap = self.snap.load();
        CacheStats {
            epoch: snap.epoch,
            entries: snap.len(),
            events: self.events.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            lists: self.lists.load(Ordering::Relaxed),
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.status.send_if_modified(|s| {
            if s.phase == phase {
                return false;
            }
            s.phase = phase;
            true
        });
    }

    fn fail(&self, e: Error) {
        error!(projection = %self.key, error = %e, "cache initialization rejected");
        self.status.send_replace(Status { phase: Phase::Failed, fatal: Some(e) });
    }

    /// Swap in a new snapshot, then fan out notifications for it.
    fn publish(&self, entries: &FxHashMap<ObjectKey, Arc<Object>>, rv: Option<ResourceVersion>, notes: Vec<Notification>) {
        let epoch = self.snap.load().epoch.saturating_add(1);
        self.snap.store(Arc::new(CacheSnapshot { epoch, resource_version: rv, entries: entries.clone() }));
        metrics::gauge!("cache_entries", entries.len() as f64, "projection" => self.key.to_string());
        for n in notes {
            // No subscribers is fine.
            let _ = self.notify.send(n);
        }
    }

    async fn run(self: Arc<Self>, backend: Arc<dyn Backend>, config: CacheConfig, cancel: CancellationToken) {
        let kind = self.key.kind.clone();
        let shape = self.key.shape;
        let mut entries: FxHashMap<ObjectKey, Arc<Object>> = FxHashMap::default();
        let mut backoff = config.backoff.start();
        let mut step = Step::Listing;
        loop {
            step = match step {
                Step::Listing => {
                    self.set_phase(Phase::Listing);
                    let res = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = backend.list(&kind, shape) => r,
                    };
                    match res {
                        Ok(list) => {
                            let lists = self.lists.fetch_add(1, Ordering::Relaxed) + 1;
                            if lists > 1 {
                                metrics::counter!("cache_relists_total", 1u64, "shape" => shape.to_string());
                            }
                            self.rebuild(&mut entries, list.items, list.resource_version.clone());
                            match list.resource_version {
                                Some(rv) => {
                                    self.set_phase(Phase::Watching);
                                    info!(projection = %self.key, entries = entries.len(), rv = %rv, lists, "cache ready");
                                    Step::Watching(rv)
                                }
                                None => {
                                    warn!(projection = %self.key, "list returned no resource version");
                                    Step::Reconnecting
                                }
                            }
                        }
                        Err(e) if e.is_fatal() => {
                            self.fail(e);
                            return;
                        }
                        Err(e) => {
                            warn!(projection = %self.key, error = %e, "list failed");
                            Step::Reconnecting
                        }
                    }
                }
                Step::Watching(rv) => {
                    let opened = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = backend.watch(&kind, shape, &rv) => r,
                    };
                    match opened {
                        Ok(stream) => {
                            backoff.reset();
                            match self.follow(stream, &mut entries, rv, &cancel).await {
                                StreamEnd::Cancelled => break,
                                StreamEnd::Dropped(reason) => {
                                    warn!(projection = %self.key, reason = %reason, "watch ended; relisting");
                                    Step::Reconnecting
                                }
                            }
                        }
                        Err(e) if e.is_fatal() => {
                            self.fail(e);
                            return;
                        }
                        Err(e) => {
                            warn!(projection = %self.key, error = %e, "watch failed to open; relisting");
                            Step::Reconnecting
                        }
                    }
                }
                Step::Reconnecting => {
                    self.set_phase(Phase::Reconnecting);
                    let delay = backoff.next_delay();
                    debug!(projection = %self.key, delay_ms = delay.as_millis() as u64, attempt = backoff.attempts(), "reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    Step::Listing
                }
            };
        }
        self.set_phase(Phase::Stopped);
        info!(projection = %self.key, "ingestion stopped");
    }

    /// Replace all entries with a fresh list, notifying the difference.
    fn rebuild(&self, entries: &mut FxHashMap<ObjectKey, Arc<Object>>, items: Vec<Object>, rv: Option<ResourceVersion>) {
        let mut next: FxHashMap<ObjectKey, Arc<Object>> = FxHashMap::default();
        let mut notes = Vec::new();
        for obj in items {
            let key = obj.key().clone();
            let changed = entries.get(&key).map(|old| old.resource_version() != obj.resource_version()).unwrap_or(true);
            if changed {
                notes.push(Notification { key: key.clone(), change: Change::Applied, resource_version: obj.resource_version().cloned() });
            }
            next.insert(key, Arc::new(obj));
        }
        for (key, old) in entries.iter() {
            if !next.contains_key(key) {
                notes.push(Notification { key: key.clone(), change: Change::Deleted, resource_version: old.resource_version().cloned() });
            }
        }
        debug!(projection = %self.key, entries = next.len(), changes = notes.len(), "rebuilt from list");
        *entries = next;
        self.publish(entries, rv, notes);
    }

    /// Apply watch events in arrival order until the stream ends or shutdown.
    async fn follow(
        &self,
        mut stream: EventStream,
        entries: &mut FxHashMap<ObjectKey, Arc<Object>>,
        mut rv: ResourceVersion,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };
            let mut batch = Vec::new();
            let mut ended = match first {
                Some(item) => {
                    batch.push(item);
                    false
                }
                None => true,
            };
            // Drain what is already buffered so one publish covers it.
            while !ended && batch.len() < MAX_BATCH {
                match stream.next().now_or_never() {
                    Some(Some(item)) => batch.push(item),
                    Some(None) => ended = true,
                    None => break,
                }
            }

            let mut notes = Vec::with_capacity(batch.len());
            let mut failure = None;
            for item in batch {
                match item {
                    Ok(ev) => {
                        if let Some(next) = self.apply(entries, ev, &mut notes) {
                            rv = next;
                        }
                    }
                    Err(Error::Invalid(reason)) => {
                        self.skipped.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("watch_events_skipped_total", 1u64, "shape" => self.key.shape.to_string());
                        warn!(projection = %self.key, reason = %reason, "undecodable watch event skipped");
                    }
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }
            if !notes.is_empty() || failure.is_none() {
                self.publish(entries, Some(rv.clone()), notes);
            }
            if let Some(reason) = failure {
                return StreamEnd::Dropped(reason);
            }
            if ended {
                return StreamEnd::Dropped("stream closed".into());
            }
        }
    }

    /// Apply one event. Returns the version it advanced the stream to.
    fn apply(&self, entries: &mut FxHashMap<ObjectKey, Arc<Object>>, ev: WatchEvent, notes: &mut Vec<Notification>) -> Option<ResourceVersion> {
        self.events.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("watch_events_total", 1u64, "shape" => self.key.shape.to_string());
        let rv = ev.resource_version().cloned();
        match ev {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                debug!(projection = %self.key, key = %obj.key(), rv = ?rv, "watch event received");
                let key = obj.key().clone();
                notes.push(Notification { key: key.clone(), change: Change::Applied, resource_version: rv.clone() });
                entries.insert(key, Arc::new(obj));
            }
            WatchEvent::Deleted(obj) => {
                debug!(projection = %self.key, key = %obj.key(), rv = ?rv, deleted = true, "watch event received");
                let key = obj.key().clone();
                entries.remove(&key);
                notes.push(Notification { key, change: Change::Deleted, resource_version: rv.clone() });
            }
            WatchEvent::Bookmark(_) => {
                debug!(projection = %self.key, rv = ?rv, bookmark = true, "watch event received");
            }
        }
        rv
    }
}
