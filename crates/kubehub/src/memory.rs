//! In-process API backend.
//!
//! Serves list/get/create/update/watch over an in-memory object set with a
//! monotonically increasing resource version counter per kind, optimistic
//! concurrency on update, and a bounded event log for watch resumption.
//! Watch delivery can be delayed or paused per shape and watches can be
//! forcibly disconnected, which is what makes the two-projection race
//! reproducible on demand.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tandem_core::{Backend, Error, EventStream, Kind, Object, ObjectKey, ObjectList, ResourceVersion, Shape, WatchEvent};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

const DEFAULT_LOG_CAPACITY: usize = 1024;

/// How watch events are handed to watchers of one shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Delivery {
    /// Each event is delivered no earlier than this long after it was committed.
    lag: Duration,
    /// While set, events queue up undelivered.
    paused: bool,
}

/// Operation selector for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Watch,
    Update,
}

/// Call counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendStats {
    pub lists: u64,
    pub watches: u64,
    pub gets: u64,
    pub creates: u64,
    pub updates: u64,
    pub conflicts: u64,
}

#[derive(Default)]
struct Counters {
    lists: AtomicU64,
    watches: AtomicU64,
    gets: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    conflicts: AtomicU64,
}

struct Watcher {
    shape: Shape,
    tx: mpsc::UnboundedSender<(Instant, WatchEvent)>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct KindState {
    /// Last version minted for this kind.
    rv: u64,
    objects: BTreeMap<ObjectKey, Object>,
    /// Committed events, oldest first, as (version, event).
    log: VecDeque<(u64, WatchEvent)>,
    /// Watches from a version below this can no longer be resumed.
    log_floor: u64,
    watchers: Vec<Watcher>,
}

struct State {
    kinds: FxHashMap<Kind, KindState>,
    forbidden: Vec<Kind>,
    failures: FxHashMap<Op, u32>,
}

/// In-memory [`Backend`].
pub struct MemoryBackend {
    state: Mutex<State>,
    full: watch::Sender<Delivery>,
    metadata: watch::Sender<Delivery>,
    log_capacity: usize,
    counters: Counters,
}

impl Default for MemoryBackend {
    fn default() -> Self { Self::new() }
}

impl MemoryBackend {
    pub fn new() -> Self { Self::with_log_capacity(DEFAULT_LOG_CAPACITY) }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        let (full, _) = watch::channel(Delivery::default());
        let (metadata, _) = watch::channel(Delivery::default());
        Self {
            state: Mutex::new(State { kinds: FxHashMap::default(), forbidden: Vec::new(), failures: FxHashMap::default() }),
            full,
            metadata,
            log_capacity: log_capacity.max(1),
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn delivery_tx(&self, shape: Shape) -> &watch::Sender<Delivery> {
        match shape {
            Shape::Full => &self.full,
            Shape::Metadata => &self.metadata,
        }
    }

    pub fn set_lag(&self, shape: Shape, lag: Duration) {
        self.delivery_tx(shape).send_modify(|d| d.lag = lag);
    }

    pub fn pause(&self, shape: Shape) {
        self.delivery_tx(shape).send_modify(|d| d.paused = true);
    }

    pub fn resume(&self, shape: Shape) {
        self.delivery_tx(shape).send_modify(|d| d.paused = false);
    }

    /// Terminate every open watch on `kind`. Undelivered events are discarded.
    pub fn disconnect_watches(&self, kind: &Kind) -> usize {
        let mut st = self.lock();
        let Some(ks) = st.kinds.get_mut(kind) else { return 0 };
        let n = ks.watchers.len();
        for w in ks.watchers.drain(..) {
            w.cancel.cancel();
        }
        info!(kind = %kind, watchers = n, "watches disconnected");
        n
    }

    /// Make list/watch/get of `kind` fail permanently.
    pub fn forbid_kind(&self, kind: &Kind) {
        let mut st = self.lock();
        if !st.forbidden.contains(kind) {
            st.forbidden.push(kind.clone());
        }
    }

    /// Fail the next `count` calls of `op` with a transient error.
    pub fn fail_next(&self, op: Op, count: u32) {
        *self.lock().failures.entry(op).or_default() += count;
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            lists: self.counters.lists.load(Ordering::Relaxed),
            watches: self.counters.watches.load(Ordering::Relaxed),
            gets: self.counters.gets.load(Ordering::Relaxed),
            creates: self.counters.creates.load(Ordering::Relaxed),
            updates: self.counters.updates.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
        }
    }

    /// Number of live watches on `kind`.
    pub fn watcher_count(&self, kind: &Kind) -> usize {
        let mut st = self.lock();
        st.kinds.get_mut(kind).map(|ks| {
            ks.watchers.retain(|w| !w.tx.is_closed());
            ks.watchers.len()
        }).unwrap_or(0)
    }

    /// Current objects of `kind`, read directly (no cache).
    pub fn objects(&self, kind: &Kind) -> Vec<Object> {
        self.lock().kinds.get(kind).map(|ks| ks.objects.values().cloned().collect()).unwrap_or_default()
    }

    /// Delete an object, emitting a Deleted event.
    pub fn delete(&self, kind: &Kind, key: &ObjectKey) -> Result<Object, Error> {
        let mut st = self.lock();
        check_forbidden(&st, kind)?;
        let ks = st.kinds.entry(kind.clone()).or_default();
        let rv = next_rv(ks);
        let mut gone = ks.objects.remove(key).ok_or_else(|| not_found(kind, key))?;
        gone.set_resource_version(ResourceVersion::new(rv.to_string()));
        self.commit(ks, rv, WatchEvent::Deleted(gone.clone()));
        Ok(gone)
    }

    fn take_failure(st: &mut State, op: Op) -> bool {
        match st.failures.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    /// Append to the event log and fan out to live watchers.
    fn commit(&self, ks: &mut KindState, rv: u64, ev: WatchEvent) {
        ks.log.push_back((rv, ev.clone()));
        while ks.log.len() > self.log_capacity {
            if let Some((old, _)) = ks.log.pop_front() {
                ks.log_floor = old;
            }
        }
        let now = Instant::now();
        ks.watchers.retain(|w| w.tx.send((now, project_event(&ev, w.shape))).is_ok());
        trace!(rv, event = ev.type_str(), watchers = ks.watchers.len(), "event committed");
    }
}

fn next_rv(ks: &mut KindState) -> u64 {
    ks.rv += 1;
    ks.rv
}

fn check_forbidden(st: &State, kind: &Kind) -> Result<(), Error> {
    if st.forbidden.contains(kind) {
        return Err(Error::Fatal(format!("the server does not serve {}", kind)));
    }
    Ok(())
}

fn not_found(kind: &Kind, key: &ObjectKey) -> Error {
    Error::NotFound(format!("{} {} not found", kind.kind, key))
}

fn project_event(ev: &WatchEvent, shape: Shape) -> WatchEvent {
    match ev {
        WatchEvent::Added(o) => WatchEvent::Added(o.project(shape)),
        WatchEvent::Modified(o) => WatchEvent::Modified(o.project(shape)),
        WatchEvent::Deleted(o) => WatchEvent::Deleted(o.project(shape)),
        WatchEvent::Bookmark(rv) => WatchEvent::Bookmark(rv.clone()),
    }
}

/// Move events from the commit path to one watch stream, honouring the
/// shape's delivery policy. Cancellation ends the stream with an error.
async fn forward(
    mut rx: mpsc::UnboundedReceiver<(Instant, WatchEvent)>,
    out: mpsc::UnboundedSender<Result<WatchEvent, Error>>,
    mut delivery: watch::Receiver<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let (at, ev) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(m) => m,
                None => return,
            },
        };
        loop {
            let d = *delivery.borrow_and_update();
            let due = at + d.lag;
            if !d.paused && Instant::now() >= due {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = out.send(Err(Error::Transient("watch closed by server".into())));
                    return;
                }
                changed = delivery.changed() => {
                    if changed.is_err() { return; }
                }
                _ = tokio::time::sleep_until(due), if !d.paused => {}
            }
        }
        if out.send(Ok(ev)).is_err() {
            return;
        }
    }
    let _ = out.send(Err(Error::Transient("watch closed by server".into())));
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn list(&self, kind: &Kind, shape: Shape) -> Result<ObjectList, Error> {
        self.counters.lists.fetch_add(1, Ordering::Relaxed);
        let mut st = self.lock();
        check_forbidden(&st, kind)?;
        if Self::take_failure(&mut st, Op::List) {
            return Err(Error::Transient("injected list failure".into()));
        }
        let (rv, items) = st
            .kinds
            .get(kind)
            .map(|ks| (ks.rv, ks.objects.values().map(|o| o.project(shape)).collect()))
            .unwrap_or_default();
        Ok(ObjectList { items, resource_version: Some(ResourceVersion::new(rv.to_string())) })
    }

    async fn get(&self, kind: &Kind, key: &ObjectKey) -> Result<Object, Error> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let st = self.lock();
        check_forbidden(&st, kind)?;
        st.kinds.get(kind).and_then(|ks| ks.objects.get(key)).cloned().ok_or_else(|| not_found(kind, key))
    }

    async fn create(&self, kind: &Kind, obj: Object) -> Result<Object, Error> {
        self.counters.creates.fetch_add(1, Ordering::Relaxed);
        let mut st = self.lock();
        check_forbidden(&st, kind)?;
        let key = obj.key().clone();
        if let Some(ns) = &key.namespace {
            let ns_kind = Kind::namespace();
            let exists = st.kinds.get(&ns_kind).map(|ks| ks.objects.contains_key(&ObjectKey::cluster(ns))).unwrap_or(false);
            if !exists {
                return Err(Error::NotFound(format!("namespaces \"{}\" not found", ns)));
            }
        }
        if st.kinds.get(kind).map(|ks| ks.objects.contains_key(&key)).unwrap_or(false) {
            return Err(Error::Conflict(format!("{} {} already exists", kind.kind, key)));
        }
        let mut raw = obj.into_raw();
        if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("uid".into(), uuid::Uuid::new_v4().to_string().into());
            meta.insert("creationTimestamp".into(), chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true).into());
        }
        let mut created = Object::from_raw(raw)?;
        let ks = st.kinds.entry(kind.clone()).or_default();
        let rv = next_rv(ks);
        created.set_resource_version(ResourceVersion::new(rv.to_string()));
        ks.objects.insert(key.clone(), created.clone());
        self.commit(ks, rv, WatchEvent::Added(created.clone()));
        debug!(kind = %kind, key = %key, rv, "created");
        Ok(created)
    }

    async fn update(&self, kind: &Kind, obj: Object) -> Result<Object, Error> {
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        let mut st = self.lock();
        check_forbidden(&st, kind)?;
        if Self::take_failure(&mut st, Op::Update) {
            return Err(Error::Transient("injected update failure".into()));
        }
        let key = obj.key().clone();
        let current = st.kinds.get(kind).and_then(|ks| ks.objects.get(&key)).cloned().ok_or_else(|| not_found(kind, &key))?;
        if let Some(sent) = obj.resource_version() {
            if Some(sent) != current.resource_version() {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Conflict(format!(
                    "Operation cannot be fulfilled on {} {}: the object has been modified; please apply your changes to the latest version and try again",
                    kind.kind, key
                )));
            }
        }
        let mut raw = obj.into_raw();
        if let (Some(meta), Some(cur)) = (raw.get_mut("metadata").and_then(|m| m.as_object_mut()), current.raw().get("metadata")) {
            for field in ["uid", "creationTimestamp"] {
                if let Some(v) = cur.get(field) {
                    meta.insert(field.into(), v.clone());
                }
            }
        }
        let mut updated = Object::from_raw(raw)?;
        let ks = st.kinds.entry(kind.clone()).or_default();
        let rv = next_rv(ks);
        updated.set_resource_version(ResourceVersion::new(rv.to_string()));
        ks.objects.insert(key.clone(), updated.clone());
        self.commit(ks, rv, WatchEvent::Modified(updated.clone()));
        debug!(kind = %kind, key = %key, rv, "updated");
        Ok(updated)
    }

    async fn watch(&self, kind: &Kind, shape: Shape, from: &ResourceVersion) -> Result<EventStream, Error> {
        self.counters.watches.fetch_add(1, Ordering::Relaxed);
        let mut st = self.lock();
        check_forbidden(&st, kind)?;
        if Self::take_failure(&mut st, Op::Watch) {
            return Err(Error::Transient("injected watch failure".into()));
        }
        // The backend minted these tokens, so it may read them back.
        let from_rv: u64 = from
            .as_str()
            .parse()
            .map_err(|_| Error::Transient(format!("invalid resource version {:?}", from.as_str())))?;
        let ks = st.kinds.entry(kind.clone()).or_default();
        if from_rv < ks.log_floor {
            return Err(Error::Transient(format!("too old resource version: {} ({})", from_rv, ks.log_floor)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let now = Instant::now();
        for (rv, ev) in ks.log.iter() {
            if *rv > from_rv {
                let _ = tx.send((now, project_event(ev, shape)));
            }
        }
        ks.watchers.push(Watcher { shape, tx, cancel: cancel.clone() });
        drop(st);

        tokio::spawn(forward(rx, out_tx, self.delivery_tx(shape).subscribe(), cancel));
        debug!(kind = %kind, shape = %shape, from = %from, "watch opened");
        let stream = futures::stream::unfold(out_rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(name: &str) -> Object {
        Object::new(&Kind::secret(), ObjectKey::namespaced("ns-1", name))
    }

    async fn with_namespace() -> MemoryBackend {
        let b = MemoryBackend::new();
        b.create(&Kind::namespace(), Object::new(&Kind::namespace(), ObjectKey::cluster("ns-1"))).await.unwrap();
        b
    }

    #[tokio::test]
    async fn create_requires_namespace() {
        let b = MemoryBackend::new();
        let err = b.create(&Kind::secret(), secret("secret-1")).await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
        b.create(&Kind::namespace(), Object::new(&Kind::namespace(), ObjectKey::cluster("ns-1"))).await.unwrap();
        let created = b.create(&Kind::secret(), secret("secret-1")).await.unwrap();
        assert!(created.uid().is_some());
        assert!(created.resource_version().is_some());
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let b = with_namespace().await;
        b.create(&Kind::secret(), secret("a")).await.unwrap();
        assert!(b.create(&Kind::secret(), secret("a")).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let b = with_namespace().await;
        let v1 = b.create(&Kind::secret(), secret("a")).await.unwrap();
        let mut first = v1.clone();
        first.set_annotation("x", "1");
        let v2 = b.update(&Kind::secret(), first).await.unwrap();
        assert_ne!(v1.resource_version(), v2.resource_version());
        assert_eq!(v2.uid(), v1.uid());

        let mut stale = v1;
        stale.set_annotation("x", "2");
        assert!(b.update(&Kind::secret(), stale).await.unwrap_err().is_conflict());
        assert_eq!(b.stats().conflicts, 1);
        assert_eq!(b.stats().updates, 2);
    }

    #[tokio::test]
    async fn metadata_list_strips_body() {
        let b = with_namespace().await;
        b.create(&Kind::secret(), secret("a").with_field("data", serde_json::json!({"k": "dg=="}))).await.unwrap();
        let full = b.list(&Kind::secret(), Shape::Full).await.unwrap();
        let meta = b.list(&Kind::secret(), Shape::Metadata).await.unwrap();
        assert!(full.items[0].field("data").is_some());
        assert!(meta.items[0].field("data").is_none());
        assert_eq!(full.resource_version, meta.resource_version);
    }

    #[tokio::test]
    async fn watch_resumes_after_list_version() {
        let b = with_namespace().await;
        b.create(&Kind::secret(), secret("a")).await.unwrap();
        let list = b.list(&Kind::secret(), Shape::Full).await.unwrap();
        b.create(&Kind::secret(), secret("b")).await.unwrap();
        let mut s = b.watch(&Kind::secret(), Shape::Full, list.resource_version.as_ref().unwrap()).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), s.next()).await.unwrap().unwrap().unwrap();
        match first {
            WatchEvent::Added(o) => assert_eq!(o.key().name, "b"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn too_old_version_is_transient() {
        let b = MemoryBackend::with_log_capacity(2);
        b.create(&Kind::namespace(), Object::new(&Kind::namespace(), ObjectKey::cluster("ns-1"))).await.unwrap();
        for n in 0..5 {
            b.create(&Kind::secret(), secret(&format!("s{n}"))).await.unwrap();
        }
        let err = b.watch(&Kind::secret(), Shape::Full, &ResourceVersion::new("1")).await.err().unwrap();
        assert!(matches!(err, Error::Transient(_)), "{err}");
    }

    #[tokio::test]
    async fn paused_delivery_holds_events_until_resume() {
        let b = with_namespace().await;
        let list = b.list(&Kind::secret(), Shape::Metadata).await.unwrap();
        let mut s = b.watch(&Kind::secret(), Shape::Metadata, list.resource_version.as_ref().unwrap()).await.unwrap();
        b.pause(Shape::Metadata);
        b.create(&Kind::secret(), secret("a")).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), s.next()).await.is_err());
        b.resume(Shape::Metadata);
        let ev = tokio::time::timeout(Duration::from_secs(1), s.next()).await.unwrap().unwrap().unwrap();
        assert!(matches!(ev, WatchEvent::Added(_)));
    }

    #[tokio::test]
    async fn disconnect_ends_stream_with_error() {
        let b = with_namespace().await;
        let list = b.list(&Kind::secret(), Shape::Full).await.unwrap();
        let mut s = b.watch(&Kind::secret(), Shape::Full, list.resource_version.as_ref().unwrap()).await.unwrap();
        assert_eq!(b.disconnect_watches(&Kind::secret()), 1);
        let item = tokio::time::timeout(Duration::from_secs(1), s.next()).await.unwrap().unwrap();
        assert!(item.is_err());
        assert!(tokio::time::timeout(Duration::from_secs(1), s.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forbidden_kind_is_fatal() {
        let b = MemoryBackend::new();
        b.forbid_kind(&Kind::secret());
        assert!(b.list(&Kind::secret(), Shape::Full).await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn versions_count_per_kind() {
        let b = with_namespace().await;
        let first = b.create(&Kind::secret(), secret("a")).await.unwrap();
        assert_eq!(first.resource_version().map(|r| r.as_str()), Some("1"));
        b.create(&Kind::namespace(), Object::new(&Kind::namespace(), ObjectKey::cluster("ns-2"))).await.unwrap();
        let second = b.create(&Kind::secret(), secret("b")).await.unwrap();
        assert_eq!(second.resource_version().map(|r| r.as_str()), Some("2"));
        let ns = b.list(&Kind::namespace(), Shape::Metadata).await.unwrap();
        assert_eq!(ns.resource_version.as_ref().map(|r| r.as_str()), Some("2"));
    }
}
