//! Reconcile loop: projection notifications in, work items out to a worker pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tandem_core::{Error, Kind, Shape, WorkItem};
use tandem_store::{ProjectionRegistry, WatchCache};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{ControllerConfig, WorkQueue};

/// What to do with an item after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

/// Level-triggered reconcile function. Implementations must read current
/// state rather than rely on having seen every event.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, item: &WorkItem) -> Result<Action, Error>;
}

/// Wires projections of one kind to a [`Reconciler`].
///
/// The `watches` projection is created at start. A `follows` projection is
/// never created by the controller: it is subscribed to once something else
/// (typically the reconciler's own cached reads) brings it into existence.
pub struct Controller<R> {
    kind: Kind,
    watches: Shape,
    follows: Vec<Shape>,
    reconciler: Arc<R>,
    config: ControllerConfig,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(kind: Kind, reconciler: Arc<R>) -> Self {
        Self { kind, watches: Shape::Full, follows: Vec::new(), reconciler, config: ControllerConfig::default() }
    }

    pub fn watches(mut self, shape: Shape) -> Self {
        self.watches = shape;
        self
    }

    pub fn follows(mut self, shape: Shape) -> Self {
        if shape != self.watches && !self.follows.contains(&shape) {
            self.follows.push(shape);
        }
        self
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run until `shutdown` fires or a fatal error surfaces, then drain
    /// in-flight work. Only `Fatal` errors are returned.
    pub async fn run(self, registry: Arc<ProjectionRegistry>, shutdown: CancellationToken) -> Result<(), Error> {
        let queue = Arc::new(WorkQueue::new(self.config.requeue_backoff));
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(1);
        let stop = shutdown.child_token();
        let mut sources = JoinSet::new();

        let source = registry.projection_for(&self.kind, self.watches);
        sources.spawn(pump(source, queue.clone(), fatal_tx.clone(), stop.clone()));
        for shape in self.follows.iter().copied() {
            let registry = registry.clone();
            let kind = self.kind.clone();
            let queue = queue.clone();
            let fatal_tx = fatal_tx.clone();
            let stop = stop.clone();
            sources.spawn(async move {
                let cache = tokio::select! {
                    _ = stop.cancelled() => return,
                    c = registry.wait_for(&kind, shape) => c,
                };
                debug!(projection = %cache.key(), "following projection");
                pump(cache, queue, fatal_tx, stop).await;
            });
        }

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            workers.spawn(worker(id, self.reconciler.clone(), queue.clone(), fatal_tx.clone()));
        }
        drop(fatal_tx);
        info!(gvk = %self.kind, watches = %self.watches, follows = ?self.follows, workers = self.config.workers.max(1), "controller started");

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(gvk = %self.kind, "shutdown requested");
                Ok(())
            }
            Some(e) = fatal_rx.recv() => {
                error!(gvk = %self.kind, error = %e, "fatal error; stopping controller");
                Err(e)
            }
        };

        stop.cancel();
        queue.shut_down();
        while sources.join_next().await.is_some() {}

        let drain = Duration::from_millis(self.config.drain_timeout_ms);
        let drained = tokio::time::timeout(drain, async { while workers.join_next().await.is_some() {} }).await;
        if drained.is_err() {
            for key in queue.in_flight() {
                warn!(key = %key, "reconcile cancelled at shutdown");
            }
            workers.shutdown().await;
        }
        info!(gvk = %self.kind, "controller stopped");
        outcome
    }
}

/// Forward one projection's notifications into the queue.
async fn pump(cache: Arc<WatchCache>, queue: Arc<WorkQueue>, fatal_tx: mpsc::Sender<Error>, stop: CancellationToken) {
    let mut rx = cache.subscribe();
    let ready = tokio::select! {
        _ = stop.cancelled() => return,
        r = cache.wait_ready() => r,
    };
    if let Err(e) = ready {
        if e.is_fatal() {
            let _ = fatal_tx.try_send(e);
        }
        return;
    }
    // Anything already cached may predate the subscription.
    enqueue_all(&cache, &queue);
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return,
            n = rx.recv() => n,
        };
        match next {
            Ok(n) => {
                debug!(projection = %cache.key(), key = %n.key, change = ?n.change, rv = ?n.resource_version, "enqueue");
                queue.add(WorkItem::triggered_by(n.key, n.resource_version));
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(projection = %cache.key(), missed, "notifications lagged; requeueing cached keys");
                enqueue_all(&cache, &queue);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn enqueue_all(cache: &WatchCache, queue: &WorkQueue) {
    if let Some(snap) = cache.try_snapshot() {
        for key in snap.keys() {
            queue.add(WorkItem::new(key));
        }
    }
}

async fn worker<R: Reconciler>(id: usize, reconciler: Arc<R>, queue: Arc<WorkQueue>, fatal_tx: mpsc::Sender<Error>) {
    while let Some(item) = queue.take().await {
        let span = info_span!("reconcile", worker = id, key = %item.key);
        process(&*reconciler, &queue, &fatal_tx, item).instrument(span).await;
    }
    debug!(worker = id, "worker exiting");
}

async fn process<R: Reconciler>(reconciler: &R, queue: &Arc<WorkQueue>, fatal_tx: &mpsc::Sender<Error>, item: WorkItem) {
    let started = Instant::now();
    info!(trigger = ?item.trigger, "reconcile start");
    let res = reconciler.reconcile(&item).await;
    metrics::histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
    let key = item.key.clone();
    match res {
        Ok(Action::Done) => {
            queue.forget(&key);
            metrics::counter!("reconcile_total", 1u64, "outcome" => "done");
            info!(outcome = "done", elapsed_ms = started.elapsed().as_millis() as u64, "reconcile outcome");
        }
        Ok(Action::RequeueAfter(delay)) => {
            queue.forget(&key);
            queue.add_after(WorkItem::new(key.clone()), delay);
            metrics::counter!("reconcile_total", 1u64, "outcome" => "requeue_after");
            info!(outcome = "requeue_after", delay_ms = delay.as_millis() as u64, "reconcile outcome");
        }
        Err(e) if e.is_not_found() => {
            queue.forget(&key);
            metrics::counter!("reconcile_total", 1u64, "outcome" => "not_found");
            info!(outcome = "not_found", error = %e, "reconcile outcome");
        }
        Err(e) if e.is_fatal() => {
            metrics::counter!("reconcile_total", 1u64, "outcome" => "fatal");
            error!(error = %e, "reconcile error");
            let _ = fatal_tx.try_send(e);
        }
        Err(e) => {
            let delay = queue.add_rate_limited(WorkItem::new(key.clone()));
            metrics::counter!("reconcile_total", 1u64, "outcome" => e.label());
            warn!(error = %e, class = e.label(), retry_in_ms = delay.as_millis() as u64, attempt = queue.num_requeues(&key), "reconcile error");
        }
    }
    queue.done(&key);
}
