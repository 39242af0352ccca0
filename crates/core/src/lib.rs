//! Tandem core types: resource identity, projections, watch events and the
//! error taxonomy shared by caches, backends and reconcilers.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

mod backend;
mod backoff;
mod object;

pub use backend::{Backend, EventStream};
pub use backoff::{Backoff, BackoffPolicy};
pub use object::Object;

/// Group/version/kind of a resource collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Kind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    pub fn secret() -> Self { Self::new("", "v1", "Secret") }
    pub fn namespace() -> Self { Self::new("", "v1", "Namespace") }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// Parse `v1/Kind` or `group/v1/Kind`.
    pub fn parse(key: &str) -> Result<Self, Error> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(Error::Fatal(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

/// Resource identity within a kind. Cluster-scoped objects carry no namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self { namespace: Some(namespace.to_string()), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Opaque resource version token.
///
/// Only equality is defined. Ordering between versions is carried by the
/// arrival order of a single watch stream, never by the token's contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Level of detail served by a projection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Full,
    Metadata,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Shape::Full => "full", Shape::Metadata => "metadata" })
    }
}

/// A cached view of one kind at one shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProjectionKey {
    pub kind: Kind,
    pub shape: Shape,
}

impl ProjectionKey {
    pub fn new(kind: Kind, shape: Shape) -> Self { Self { kind, shape } }
}

impl fmt::Display for ProjectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.shape)
    }
}

/// One change notification from a backend watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
    /// Progress marker: no object changed, the stream is current up to this version.
    Bookmark(ResourceVersion),
}

impl WatchEvent {
    pub fn resource_version(&self) -> Option<&ResourceVersion> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.resource_version(),
            WatchEvent::Bookmark(rv) => Some(rv),
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "Added",
            WatchEvent::Modified(_) => "Modified",
            WatchEvent::Deleted(_) => "Deleted",
            WatchEvent::Bookmark(_) => "Bookmark",
        }
    }
}

/// Result of a bulk list: the items plus the collection version to watch from.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<Object>,
    pub resource_version: Option<ResourceVersion>,
}

/// Unit of reconciliation work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub key: ObjectKey,
    /// Version of the event that queued this item, if any.
    pub trigger: Option<ResourceVersion>,
}

impl WorkItem {
    pub fn new(key: ObjectKey) -> Self { Self { key, trigger: None } }

    pub fn triggered_by(key: ObjectKey, rv: Option<ResourceVersion>) -> Self {
        Self { key, trigger: rv }
    }
}

/// Error taxonomy for backend calls, cache reads and reconciles.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Object absent at read time. May be real or a lagging cache.
    #[error("not_found: {0}")]
    NotFound(String),
    /// Write carried a stale resource version.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Backend unavailable, stream dropped, version expired.
    #[error("transient: {0}")]
    Transient(String),
    /// Permanent rejection (unknown kind, bad scheme). Surfaced, never retried.
    #[error("fatal: {0}")]
    Fatal(String),
    /// Payload could not be decoded into an object.
    #[error("invalid: {0}")]
    Invalid(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, Error::Conflict(_)) }
    pub fn is_fatal(&self) -> bool { matches!(self, Error::Fatal(_)) }

    /// Conflict, Transient and Invalid errors are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Transient(_) | Error::Invalid(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Transient(_) => "transient",
            Error::Fatal(_) => "fatal",
            Error::Invalid(_) => "invalid",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod prelude {
    pub use super::{
        Backend, BackoffPolicy, Error, EventStream, Kind, Object, ObjectKey, ObjectList, ProjectionKey,
        ResourceVersion, Shape, WatchEvent, WorkItem,
    };
}
