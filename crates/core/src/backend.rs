use futures::stream::BoxStream;

use crate::{Error, Kind, Object, ObjectKey, ObjectList, ResourceVersion, Shape, WatchEvent};

/// Ordered change notifications for one kind. An `Err` item or the end of the
/// stream means the watch is gone and the consumer must relist.
pub type EventStream = BoxStream<'static, Result<WatchEvent, Error>>;

/// Request/response and streaming contract of the API backend.
///
/// `shape` selects whether list/watch serve full objects or metadata only;
/// point reads and writes always use full objects.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn list(&self, kind: &Kind, shape: Shape) -> Result<ObjectList, Error>;

    async fn get(&self, kind: &Kind, key: &ObjectKey) -> Result<Object, Error>;

    async fn create(&self, kind: &Kind, obj: Object) -> Result<Object, Error>;

    /// Replace an object. Fails with `Conflict` when `obj` carries a stale version.
    async fn update(&self, kind: &Kind, obj: Object) -> Result<Object, Error>;

    /// Watch changes strictly after `from`.
    async fn watch(&self, kind: &Kind, shape: Shape, from: &ResourceVersion) -> Result<EventStream, Error>;
}
