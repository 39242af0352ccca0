use serde_json::{Map, Value};
use smallvec::SmallVec;

use crate::{Error, Kind, ObjectKey, ResourceVersion, Shape};

/// A resource document as served by the backend, with its identity and
/// version decoded up front.
///
/// The raw JSON is kept whole so a read-modify-write round trip does not lose
/// fields this crate knows nothing about.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    key: ObjectKey,
    resource_version: Option<ResourceVersion>,
    raw: Value,
}

impl Object {
    /// A fresh object with only `apiVersion`, `kind` and identity metadata set.
    pub fn new(kind: &Kind, key: ObjectKey) -> Self {
        let mut meta = Map::new();
        meta.insert("name".into(), Value::String(key.name.clone()));
        if let Some(ns) = &key.namespace {
            meta.insert("namespace".into(), Value::String(ns.clone()));
        }
        let raw = serde_json::json!({
            "apiVersion": kind.api_version(),
            "kind": kind.kind,
            "metadata": Value::Object(meta),
        });
        Self { key, resource_version: None, raw }
    }

    /// Decode a raw document. Requires `metadata.name`.
    pub fn from_raw(mut raw: Value) -> Result<Self, Error> {
        #[cfg(feature = "strip-managed-fields")]
        strip_managed_fields(&mut raw);
        let meta = raw.get("metadata").ok_or_else(|| Error::Invalid("object missing metadata".into()))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Invalid("object missing metadata.name".into()))?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string());
        let resource_version = meta
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(ResourceVersion::new);
        Ok(Self { key: ObjectKey { namespace, name }, resource_version, raw })
    }

    pub fn key(&self) -> &ObjectKey { &self.key }
    pub fn resource_version(&self) -> Option<&ResourceVersion> { self.resource_version.as_ref() }
    pub fn raw(&self) -> &Value { &self.raw }
    pub fn into_raw(self) -> Value { self.raw }

    pub fn uid(&self) -> Option<&str> {
        self.raw.get("metadata").and_then(|m| m.get("uid")).and_then(|v| v.as_str())
    }

    pub fn set_resource_version(&mut self, rv: ResourceVersion) {
        self.meta_mut().insert("resourceVersion".into(), Value::String(rv.as_str().to_string()));
        self.resource_version = Some(rv);
    }

    /// Set a top-level field outside `metadata`, e.g. `data` or `type`.
    pub fn with_field(mut self, field: &str, value: Value) -> Self {
        if field != "metadata" {
            if let Some(obj) = self.raw.as_object_mut() {
                obj.insert(field.to_string(), value);
            }
        }
        self
    }

    pub fn field(&self, field: &str) -> Option<&Value> {
        if field == "metadata" { return None; }
        self.raw.get(field)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(key))
            .and_then(|v| v.as_str())
    }

    pub fn annotations(&self) -> SmallVec<[(String, String); 4]> {
        string_pairs(self.raw.get("metadata").and_then(|m| m.get("annotations")))
    }

    pub fn labels(&self) -> SmallVec<[(String, String); 4]> {
        string_pairs(self.raw.get("metadata").and_then(|m| m.get("labels")))
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let meta = self.meta_mut();
        let annos = ensure_object(meta.entry("annotations").or_insert(Value::Null));
        annos.insert(key.to_string(), Value::String(value.to_string()));
    }

    /// The view of this object a projection of `shape` serves.
    pub fn project(&self, shape: Shape) -> Object {
        match shape {
            Shape::Full => self.clone(),
            Shape::Metadata => {
                let mut out = Map::new();
                for field in ["apiVersion", "kind", "metadata"] {
                    if let Some(v) = self.raw.get(field) {
                        out.insert(field.to_string(), v.clone());
                    }
                }
                Object { key: self.key.clone(), resource_version: self.resource_version.clone(), raw: Value::Object(out) }
            }
        }
    }

    fn meta_mut(&mut self) -> &mut Map<String, Value> {
        let root = ensure_object(&mut self.raw);
        ensure_object(root.entry("metadata").or_insert(Value::Null))
    }
}

fn ensure_object(v: &mut Value) -> &mut Map<String, Value> {
    if !v.is_object() {
        *v = Value::Object(Map::new());
    }
    match v {
        Value::Object(m) => m,
        _ => unreachable!("replaced with an object above"),
    }
}

fn string_pairs(v: Option<&Value>) -> SmallVec<[(String, String); 4]> {
    let mut out = SmallVec::new();
    if let Some(map) = v.and_then(|v| v.as_object()) {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                out.push((k.clone(), s.to_string()));
            }
        }
    }
    out
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut Value) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret_raw() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": "secret-1",
                "namespace": "ns-1",
                "resourceVersion": "42",
                "uid": "0d6c6a4e-64a4-4c62-9c38-4bb7a4a3f0c1",
                "managedFields": [{"manager": "kubectl"}],
            },
            "type": "Opaque",
            "data": {"k": "dg=="},
        })
    }

    #[test]
    fn decodes_identity_and_version() {
        let o = Object::from_raw(secret_raw()).unwrap();
        assert_eq!(o.key(), &ObjectKey::namespaced("ns-1", "secret-1"));
        assert_eq!(o.resource_version().map(|r| r.as_str()), Some("42"));
        assert!(o.raw()["metadata"].get("managedFields").is_none());
        assert_eq!(o.uid(), Some("0d6c6a4e-64a4-4c62-9c38-4bb7a4a3f0c1"));
    }

    #[test]
    fn missing_name_is_invalid() {
        let err = Object::from_raw(json!({"metadata": {"namespace": "x"}})).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn metadata_projection_drops_body() {
        let o = Object::from_raw(secret_raw()).unwrap();
        let m = o.project(Shape::Metadata);
        assert!(m.field("data").is_none());
        assert!(m.field("type").is_none());
        assert_eq!(m.key(), o.key());
        assert_eq!(m.resource_version(), o.resource_version());
        assert_eq!(m.raw()["kind"], "Secret");
    }

    #[test]
    fn set_annotation_creates_map() {
        let mut o = Object::new(&Kind::secret(), ObjectKey::namespaced("ns-1", "secret-1"));
        assert_eq!(o.annotation("secret-found"), None);
        o.set_annotation("secret-found", "yes");
        assert_eq!(o.annotation("secret-found"), Some("yes"));
        assert_eq!(o.annotations().len(), 1);
        assert!(o.labels().is_empty());
    }

    #[test]
    fn set_resource_version_updates_raw() {
        let mut o = Object::new(&Kind::secret(), ObjectKey::namespaced("ns-1", "secret-1"));
        o.set_resource_version(ResourceVersion::new("7"));
        assert_eq!(o.raw()["metadata"]["resourceVersion"], "7");
        let back = Object::from_raw(o.raw().clone()).unwrap();
        assert_eq!(back.resource_version().map(|r| r.as_str()), Some("7"));
    }
}
