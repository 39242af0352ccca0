//! Cache-backed client: reads through the full projection, writes to the backend.

use std::sync::Arc;

use tandem_core::{Backend, Error, Kind, Object, ObjectKey, Shape};
use tandem_store::ProjectionRegistry;

/// Reads are served from the registry's full projection, which is created
/// the first time a kind is read. Writes go straight to the backend, so an
/// object read here can be written back without losing its body.
#[derive(Clone)]
pub struct Client {
    registry: Arc<ProjectionRegistry>,
}

impl Client {
    pub fn new(registry: Arc<ProjectionRegistry>) -> Self {
        Self { registry }
    }

    /// Cached read. Absence from the cache is reported as `NotFound`, whatever
    /// the backend currently holds.
    pub async fn get(&self, kind: &Kind, key: &ObjectKey) -> Result<Arc<Object>, Error> {
        let cache = self.registry.projection_for(kind, Shape::Full);
        cache
            .get(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {} not found in {} cache", kind.kind, key, Shape::Full)))
    }

    pub async fn update(&self, kind: &Kind, obj: Object) -> Result<Object, Error> {
        self.registry.backend().update(kind, obj).await
    }
}
