//! Projection registry: one lazily created [`WatchCache`] per (kind, shape).

use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tandem_core::{Backend, Kind, ProjectionKey, Shape};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{CacheConfig, WatchCache};

#[derive(Clone, Default)]
struct Arena {
    caches: Vec<Arc<WatchCache>>,
    index: FxHashMap<ProjectionKey, usize>,
}

impl Arena {
    fn lookup(&self, key: &ProjectionKey) -> Option<Arc<WatchCache>> {
        self.index.get(key).and_then(|i| self.caches.get(*i)).cloned()
    }
}

/// Maps each declared interest to its cache, creating it on first access.
///
/// Steady-state lookups load an immutable arena without locking. The creation
/// lock is taken only when a key is missing, and the key is checked again
/// under it so concurrent first callers share one cache.
///
/// Creation is deliberately lazy: two shapes of the same kind get two caches
/// with two independent watch streams, and nothing orders one against the other.
pub struct ProjectionRegistry {
    backend: Arc<dyn Backend>,
    config: CacheConfig,
    arena: ArcSwap<Arena>,
    create_lock: Mutex<Vec<JoinHandle<()>>>,
    created: watch::Sender<usize>,
    cancel: CancellationToken,
}

impl ProjectionRegistry {
    pub fn new(backend: Arc<dyn Backend>, config: CacheConfig) -> Self {
        Self::with_cancel(backend, config, CancellationToken::new())
    }

    /// Ingestion paths stop when `cancel` fires.
    pub fn with_cancel(backend: Arc<dyn Backend>, config: CacheConfig, cancel: CancellationToken) -> Self {
        let (created, _) = watch::channel(0usize);
        Self {
            backend,
            config,
            arena: ArcSwap::from_pointee(Arena::default()),
            create_lock: Mutex::new(Vec::new()),
            created,
            cancel,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> { &self.backend }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.create_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The cache serving `(kind, shape)`, created and started on first call.
    /// The returned cache may not be populated yet.
    pub fn projection_for(&self, kind: &Kind, shape: Shape) -> Arc<WatchCache> {
        let key = ProjectionKey::new(kind.clone(), shape);
        if let Some(hit) = self.arena.load().lookup(&key) {
            return hit;
        }
        let mut tasks = self.tasks();
        if let Some(hit) = self.arena.load().lookup(&key) {
            return hit;
        }
        let (cache, handle) = WatchCache::spawn(Arc::clone(&self.backend), key.clone(), self.config.clone(), self.cancel.child_token());
        tasks.push(handle);
        let mut next = Arena::clone(&self.arena.load());
        next.index.insert(key.clone(), next.caches.len());
        next.caches.push(Arc::clone(&cache));
        let count = next.caches.len();
        self.arena.store(Arc::new(next));
        self.created.send_replace(count);
        info!(projection = %key, projections = count, "projection created");
        cache
    }

    /// Existing cache for `(kind, shape)`, without creating one.
    pub fn get(&self, kind: &Kind, shape: Shape) -> Option<Arc<WatchCache>> {
        self.arena.load().lookup(&ProjectionKey::new(kind.clone(), shape))
    }

    /// Wait until some caller creates `(kind, shape)`.
    pub async fn wait_for(&self, kind: &Kind, shape: Shape) -> Arc<WatchCache> {
        let key = ProjectionKey::new(kind.clone(), shape);
        let mut rx = self.created.subscribe();
        loop {
            if let Some(hit) = self.arena.load().lookup(&key) {
                return hit;
            }
            if rx.changed().await.is_err() {
                // Sender lives in self; unreachable while borrowed, but don't spin.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Keys of all live projections, in creation order.
    pub fn projections(&self) -> Vec<ProjectionKey> {
        self.arena.load().caches.iter().map(|c| c.key().clone()).collect()
    }

    /// Stop every ingestion path and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.tasks());
        let n = handles.len();
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "ingestion task ended abnormally");
            }
        }
        info!(projections = n, "registry shut down");
    }
}
