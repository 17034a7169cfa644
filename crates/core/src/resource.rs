//! Managed resource handle and identity keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::Json;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("object missing {0}")]
    Missing(&'static str),
    #[error("invalid type key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidTypeKey(String),
}

/// Group/version/kind of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeRef {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl TypeRef {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Parse "v1/Pod" or "apps/v1/Deployment".
    pub fn parse(key: &str) -> Result<Self, ResourceError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*group, *version, *kind))
            }
            _ => Err(ResourceError::InvalidTypeKey(key.to_string())),
        }
    }

    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind { group: self.group.clone(), kind: self.kind.clone() }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.key()) }
}

/// Version-independent type identity; the rule index is keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into() }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() { f.write_str(&self.kind) } else { write!(f, "{}.{}", self.kind, self.group) }
    }
}

/// Identity of a stored object. Work is serialized per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub type_ref: TypeRef,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(type_ref: TypeRef, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { type_ref, namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    pub fn from_raw(raw: &Json) -> Result<Self, ResourceError> {
        let api_version = raw.get("apiVersion").and_then(|v| v.as_str()).ok_or(ResourceError::Missing("apiVersion"))?;
        let kind = raw.get("kind").and_then(|v| v.as_str()).ok_or(ResourceError::Missing("kind"))?;
        let meta = raw.get("metadata").ok_or(ResourceError::Missing("metadata"))?;
        let name = meta.get("name").and_then(|v| v.as_str()).ok_or(ResourceError::Missing("metadata.name"))?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        Ok(Self::new(TypeRef::from_api_version(api_version, kind), namespace, name))
    }

    pub fn group_kind(&self) -> GroupKind { self.type_ref.group_kind() }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.type_ref.kind, ns, self.name),
            None => write!(f, "{} {}", self.type_ref.kind, self.name),
        }
    }
}

/// Snapshot of an externally stored object, read fresh each processing cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedResource {
    pub key: ObjectKey,
    pub uid: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Ordered, set-like.
    pub finalizers: SmallVec<[String; 4]>,
    /// Optimistic concurrency token (`metadata.resourceVersion`).
    pub resource_version: String,
    pub deletion_timestamp: Option<String>,
    /// Whole object tree; expression context and patch target.
    pub raw: Json,
}

impl ManagedResource {
    pub fn from_raw(raw: Json) -> Result<Self, ResourceError> {
        let key = ObjectKey::from_raw(&raw)?;
        let meta = raw.get("metadata").and_then(|m| m.as_object());
        let string_map = |field: &str| -> BTreeMap<String, String> {
            meta.and_then(|m| m.get(field))
                .and_then(|v| v.as_object())
                .map(|o| o.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
                .unwrap_or_default()
        };
        let labels = string_map("labels");
        let annotations = string_map("annotations");
        let finalizers = meta
            .and_then(|m| m.get("finalizers"))
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
            .unwrap_or_default();
        let str_field = |field: &str| meta.and_then(|m| m.get(field)).and_then(|v| v.as_str()).map(|s| s.to_string());
        let uid = str_field("uid");
        let resource_version = str_field("resourceVersion").unwrap_or_default();
        let deletion_timestamp = str_field("deletionTimestamp");
        Ok(Self { key, uid, labels, annotations, finalizers, resource_version, deletion_timestamp, raw })
    }

    pub fn is_deleting(&self) -> bool { self.deletion_timestamp.is_some() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_ref_parses_core_and_grouped_keys() {
        let t = TypeRef::parse("v1/Pod").unwrap();
        assert_eq!(t.group, "");
        assert_eq!(t.api_version(), "v1");
        let t = TypeRef::parse("coordination.k8s.io/v1/Lease").unwrap();
        assert_eq!(t.group, "coordination.k8s.io");
        assert_eq!(t.key(), "coordination.k8s.io/v1/Lease");
        assert!(TypeRef::parse("Pod").is_err());
        assert!(TypeRef::parse("a/b/c/d").is_err());
    }

    #[test]
    fn managed_resource_reads_metadata() {
        let raw = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "p0",
                "namespace": "default",
                "uid": "1234",
                "resourceVersion": "42",
                "labels": { "app": "web" },
                "annotations": { "note": "x", "num": 3 },
                "finalizers": ["a", "b"]
            },
            "status": { "phase": "Pending" }
        });
        let r = ManagedResource::from_raw(raw).unwrap();
        assert_eq!(r.key.to_string(), "Pod default/p0");
        assert_eq!(r.resource_version, "42");
        assert_eq!(r.labels.get("app").map(|s| s.as_str()), Some("web"));
        // non-string annotation values are skipped
        assert_eq!(r.annotations.len(), 1);
        assert_eq!(r.finalizers.as_slice(), &["a".to_string(), "b".to_string()]);
        assert!(!r.is_deleting());
    }

    #[test]
    fn cluster_scoped_key_has_no_namespace() {
        let raw = serde_json::json!({"apiVersion": "v1", "kind": "Node", "metadata": {"name": "n1", "namespace": ""}});
        let k = ObjectKey::from_raw(&raw).unwrap();
        assert_eq!(k.namespace, None);
        assert_eq!(k.to_string(), "Node n1");
    }
}
