//! [`Backend`] over a live Kubernetes API server (kube-rs).

use futures::StreamExt;
use kube::{
    api::{Api, ListParams, PartialObjectMeta, PostParams, WatchEvent as KubeEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use tandem_core::{Backend, Error, EventStream, Kind, Object, ObjectKey, ObjectList, ResourceVersion, Shape, WatchEvent};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Server-side watch timeout; the cache relists when the server closes the stream.
const WATCH_TIMEOUT_SECS: u32 = 290;

pub struct KubeBackend {
    client: Client,
    resources: Mutex<FxHashMap<Kind, (ApiResource, bool)>>,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(FxHashMap::default()) }
    }

    /// Connect using the ambient kubeconfig / in-cluster config.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    /// Resolve and memoise the API resource for `kind`.
    async fn resolve(&self, kind: &Kind) -> Result<(ApiResource, bool), Error> {
        let mut cache = self.resources.lock().await;
        if let Some(hit) = cache.get(kind) {
            return Ok(hit.clone());
        }
        let gvk = GroupVersionKind { group: kind.group.clone(), version: kind.version.clone(), kind: kind.kind.clone() };
        let found = find_api_resource(self.client.clone(), &gvk).await?;
        info!(gvk = %kind, plural = %found.0.plural, namespaced = found.1, "api resource resolved");
        cache.insert(kind.clone(), found.clone());
        Ok(found)
    }

    async fn api_all(&self, kind: &Kind) -> Result<Api<DynamicObject>, Error> {
        let (ar, _) = self.resolve(kind).await?;
        Ok(Api::all_with(self.client.clone(), &ar))
    }

    async fn api_for(&self, kind: &Kind, key: &ObjectKey) -> Result<Api<DynamicObject>, Error> {
        let (ar, namespaced) = self.resolve(kind).await?;
        Ok(match (&key.namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (None, true) => return Err(Error::Invalid(format!("{} {} requires a namespace", kind.kind, key.name))),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), Error> {
    let discovery = Discovery::new(client).run().await.map_err(|e| map_kube_err(e, "discovery"))?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(Error::Fatal(format!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}

/// Map kube-rs errors onto the tandem taxonomy.
pub(crate) fn map_kube_err(e: kube::Error, what: &str) -> Error {
    match e {
        kube::Error::Api(resp) => status_to_error(resp.code, format!("{}: {}", what, resp.message)),
        other => Error::Transient(format!("{}: {}", what, other)),
    }
}

fn status_to_error(code: u16, msg: String) -> Error {
    match code {
        404 => Error::NotFound(msg),
        409 => Error::Conflict(msg),
        400 | 422 => Error::Invalid(msg),
        401 | 403 => Error::Fatal(msg),
        // 410 Gone: the watch version expired and the caller must relist.
        _ => Error::Transient(msg),
    }
}

fn from_dynamic(obj: &DynamicObject) -> Result<Object, Error> {
    let raw = serde_json::to_value(obj).map_err(|e| Error::Invalid(format!("serializing DynamicObject: {}", e)))?;
    Object::from_raw(raw)
}

fn from_partial(kind: &Kind, p: &PartialObjectMeta<DynamicObject>) -> Result<Object, Error> {
    let meta = serde_json::to_value(&p.metadata).map_err(|e| Error::Invalid(format!("serializing metadata: {}", e)))?;
    Object::from_raw(serde_json::json!({
        "apiVersion": kind.api_version(),
        "kind": kind.kind,
        "metadata": meta,
    }))
}

fn to_dynamic(obj: Object) -> Result<DynamicObject, Error> {
    serde_json::from_value(obj.into_raw()).map_err(|e| Error::Invalid(format!("decoding DynamicObject: {}", e)))
}

fn convert_event<K>(ev: kube::Result<KubeEvent<K>>, conv: impl Fn(&K) -> Result<Object, Error>) -> Result<WatchEvent, Error> {
    match ev.map_err(|e| map_kube_err(e, "watch"))? {
        KubeEvent::Added(o) => Ok(WatchEvent::Added(conv(&o)?)),
        KubeEvent::Modified(o) => Ok(WatchEvent::Modified(conv(&o)?)),
        KubeEvent::Deleted(o) => Ok(WatchEvent::Deleted(conv(&o)?)),
        KubeEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(ResourceVersion::new(b.metadata.resource_version))),
        // A server-side error ends the watch; only per-object decode failures are skippable.
        KubeEvent::Error(resp) => match status_to_error(resp.code, format!("watch: {}", resp.message)) {
            Error::Invalid(msg) => Err(Error::Transient(msg)),
            other => Err(other),
        },
    }
}

/// Drop list items that fail to decode, logging each one.
fn keep_decodable(kind: &Kind, items: impl Iterator<Item = Result<Object, Error>>) -> Vec<Object> {
    items
        .filter_map(|res| match res {
            Ok(o) => Some(o),
            Err(e) => {
                warn!(gvk = %kind, error = %e, "undecodable list item skipped");
                None
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl Backend for KubeBackend {
    async fn list(&self, kind: &Kind, shape: Shape) -> Result<ObjectList, Error> {
        let api = self.api_all(kind).await?;
        let lp = ListParams::default();
        let (items, rv) = match shape {
            Shape::Full => {
                let list = api.list(&lp).await.map_err(|e| map_kube_err(e, "list"))?;
                let items = keep_decodable(kind, list.items.iter().map(from_dynamic));
                (items, list.metadata.resource_version)
            }
            Shape::Metadata => {
                let list = api.list_metadata(&lp).await.map_err(|e| map_kube_err(e, "list metadata"))?;
                let items = keep_decodable(kind, list.items.iter().map(|p| from_partial(kind, p)));
                (items, list.metadata.resource_version)
            }
        };
        debug!(gvk = %kind, shape = %shape, count = items.len(), "listed");
        Ok(ObjectList { items, resource_version: rv.filter(|s| !s.is_empty()).map(ResourceVersion::new) })
    }

    async fn get(&self, kind: &Kind, key: &ObjectKey) -> Result<Object, Error> {
        let api = self.api_for(kind, key).await?;
        let obj = api.get(&key.name).await.map_err(|e| map_kube_err(e, "get"))?;
        from_dynamic(&obj)
    }

    async fn create(&self, kind: &Kind, obj: Object) -> Result<Object, Error> {
        let api = self.api_for(kind, obj.key()).await?;
        let dynobj = to_dynamic(obj)?;
        let created = api.create(&PostParams::default(), &dynobj).await.map_err(|e| map_kube_err(e, "create"))?;
        from_dynamic(&created)
    }

    async fn update(&self, kind: &Kind, obj: Object) -> Result<Object, Error> {
        let key = obj.key().clone();
        let api = self.api_for(kind, &key).await?;
        let dynobj = to_dynamic(obj)?;
        let updated = api.replace(&key.name, &PostParams::default(), &dynobj).await.map_err(|e| map_kube_err(e, "update"))?;
        from_dynamic(&updated)
    }

    async fn watch(&self, kind: &Kind, shape: Shape, from: &ResourceVersion) -> Result<EventStream, Error> {
        let api = self.api_all(kind).await?;
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = match shape {
            Shape::Full => {
                let s = api.watch(&wp, from.as_str()).await.map_err(|e| map_kube_err(e, "watch"))?;
                s.map(|ev| convert_event(ev, from_dynamic)).boxed()
            }
            Shape::Metadata => {
                let s = api.watch_metadata(&wp, from.as_str()).await.map_err(|e| map_kube_err(e, "watch metadata"))?;
                let kind = kind.clone();
                s.map(move |ev| convert_event(ev, |p| from_partial(&kind, p))).boxed()
            }
        };
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert!(status_to_error(404, "x".into()).is_not_found());
        assert!(status_to_error(409, "x".into()).is_conflict());
        assert!(matches!(status_to_error(410, "x".into()), Error::Transient(_)));
        assert!(matches!(status_to_error(503, "x".into()), Error::Transient(_)));
        assert!(status_to_error(403, "x".into()).is_fatal());
    }

    #[test]
    fn partial_meta_keeps_identity() {
        let mut p: PartialObjectMeta<DynamicObject> = PartialObjectMeta { types: None, metadata: Default::default(), _phantom: std::marker::PhantomData };
        p.metadata.name = Some("secret-1".into());
        p.metadata.namespace = Some("ns-1".into());
        p.metadata.resource_version = Some("12".into());
        let o = from_partial(&Kind::secret(), &p).unwrap();
        assert_eq!(o.key(), &ObjectKey::namespaced("ns-1", "secret-1"));
        assert_eq!(o.raw()["kind"], "Secret");
        assert_eq!(o.resource_version().map(|r| r.as_str()), Some("12"));
    }

    #[test]
    fn dynamic_round_trip_keeps_body() {
        let o = Object::new(&Kind::secret(), ObjectKey::namespaced("ns-1", "secret-1"))
            .with_field("type", serde_json::json!("Opaque"));
        let d = to_dynamic(o).unwrap();
        let back = from_dynamic(&d).unwrap();
        assert_eq!(back.field("type"), Some(&serde_json::json!("Opaque")));
        assert_eq!(back.key().name, "secret-1");
    }

    #[test]
    fn undecodable_list_items_are_skipped() {
        let mut good: PartialObjectMeta<DynamicObject> = PartialObjectMeta { types: None, metadata: Default::default(), _phantom: std::marker::PhantomData };
        good.metadata.name = Some("secret-1".into());
        good.metadata.namespace = Some("ns-1".into());
        let nameless: PartialObjectMeta<DynamicObject> = PartialObjectMeta { types: None, metadata: Default::default(), _phantom: std::marker::PhantomData };
        let items = [nameless, good];
        let kept = keep_decodable(&Kind::secret(), items.iter().map(|p| from_partial(&Kind::secret(), p)));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].key(), &ObjectKey::namespaced("ns-1", "secret-1"));
    }

    #[test]
    fn watch_error_event_ends_the_stream() {
        let resp = kube::core::ErrorResponse { status: "Failure".into(), message: "bad".into(), reason: "BadRequest".into(), code: 400 };
        let ev: kube::Result<KubeEvent<DynamicObject>> = Ok(KubeEvent::Error(resp));
        assert!(matches!(convert_event(ev, from_dynamic), Err(Error::Transient(_))));
    }
}
