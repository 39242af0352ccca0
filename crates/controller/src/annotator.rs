//! Reconciler that stamps a fixed annotation onto every object of a kind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tandem_core::{Error, Kind, ObjectKey, ResourceVersion, WorkItem};
use tracing::{debug, info};

use crate::{Action, Client, Reconciler};

pub const SECRET_FOUND_KEY: &str = "secret-found";
pub const SECRET_FOUND_VALUE: &str = "yes";

const STALE_RECHECK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnnotatorStats {
    /// Reconcile invocations.
    pub passes: u64,
    /// Passes that found nothing in the read projection.
    pub not_found: u64,
    /// Passes that found the annotation already present.
    pub already_applied: u64,
    /// Passes that read a version older than our own last write.
    pub stale_reads: u64,
    /// Update calls issued, successful or not.
    pub write_calls: u64,
    /// Update calls that succeeded.
    pub writes: u64,
    /// Update calls rejected for a stale version.
    pub conflicts: u64,
}

#[derive(Default)]
struct Counters {
    passes: AtomicU64,
    not_found: AtomicU64,
    already_applied: AtomicU64,
    stale_reads: AtomicU64,
    write_calls: AtomicU64,
    writes: AtomicU64,
    conflicts: AtomicU64,
}

/// Sets `key=value` on each reconciled object if it is not already set.
pub struct Annotator {
    client: Client,
    kind: Kind,
    key: String,
    value: String,
    namespace: Option<String>,
    counters: Counters,
    /// Version each key had when we last wrote it, until the read cache moves past it.
    written: Mutex<FxHashMap<ObjectKey, ResourceVersion>>,
}

impl Annotator {
    pub fn new(client: Client, kind: Kind, key: &str, value: &str) -> Self {
        Self { client, kind, key: key.to_string(), value: value.to_string(), namespace: None, counters: Counters::default(), written: Mutex::default() }
    }

    /// `secret-found=yes` on Secrets.
    pub fn secret_found(client: Client) -> Self {
        Self::new(client, Kind::secret(), SECRET_FOUND_KEY, SECRET_FOUND_VALUE)
    }

    /// Only act on objects in `namespace`; others end the pass untouched.
    pub fn in_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    fn written(&self) -> std::sync::MutexGuard<'_, FxHashMap<ObjectKey, ResourceVersion>> {
        self.written.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True while the cached object is still the version our last write replaced.
    fn is_own_stale_read(&self, key: &ObjectKey, cached: Option<&ResourceVersion>) -> bool {
        let mut written = self.written();
        let stale = matches!((written.get(key), cached), (Some(replaced), Some(rv)) if replaced == rv);
        if !stale {
            written.remove(key);
        }
        stale
    }

    pub fn stats(&self) -> AnnotatorStats {
        let c = &self.counters;
        AnnotatorStats {
            passes: c.passes.load(Ordering::Relaxed),
            not_found: c.not_found.load(Ordering::Relaxed),
            already_applied: c.already_applied.load(Ordering::Relaxed),
            stale_reads: c.stale_reads.load(Ordering::Relaxed),
            write_calls: c.write_calls.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for Annotator {
    async fn reconcile(&self, item: &WorkItem) -> Result<Action, Error> {
        if self.namespace.is_some() && item.key.namespace != self.namespace {
            return Ok(Action::Done);
        }
        self.counters.passes.fetch_add(1, Ordering::Relaxed);
        let obj = match self.client.get(&self.kind, &item.key).await {
            Ok(o) => o,
            // Absent from the read projection: either deleted, or that cache
            // has not caught up yet. Both end the pass.
            Err(e) if e.is_not_found() => {
                self.written().remove(&item.key);
                self.counters.not_found.fetch_add(1, Ordering::Relaxed);
                info!(key = %item.key, trigger = ?item.trigger, "object not found");
                return Ok(Action::Done);
            }
            Err(e) => return Err(e),
        };

        if self.is_own_stale_read(&item.key, obj.resource_version()) {
            self.counters.stale_reads.fetch_add(1, Ordering::Relaxed);
            debug!(key = %item.key, rv = ?obj.resource_version(), "cache behind our last write; rechecking");
            return Ok(Action::RequeueAfter(STALE_RECHECK));
        }

        if obj.annotation(&self.key) == Some(self.value.as_str()) {
            self.counters.already_applied.fetch_add(1, Ordering::Relaxed);
            debug!(key = %item.key, annotation = %self.key, "already annotated");
            return Ok(Action::Done);
        }

        let read_rv = obj.resource_version().cloned();
        let mut next = (*obj).clone();
        next.set_annotation(&self.key, &self.value);
        self.counters.write_calls.fetch_add(1, Ordering::Relaxed);
        match self.client.update(&self.kind, next).await {
            Ok(updated) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                if let Some(rv) = read_rv {
                    self.written().insert(item.key.clone(), rv);
                }
                info!(key = %item.key, rv = ?updated.resource_version(), annotation = %self.key, "annotation applied");
                Ok(Action::Done)
            }
            Err(e) => {
                if e.is_conflict() {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }
}
