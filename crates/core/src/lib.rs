//! Kindex core types shared by every layer: API coordinates, object keys,
//! watch events, the error taxonomy and the cluster collaborator trait.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use cluster::{BoxByteStream, BoxWatchStream, Cluster};
pub use config::{CacheMode, KindexConfig};
pub use context::OpContext;
pub use error::{KindexError, KindexResult, UpstreamError};

pub mod prelude {
    pub use super::{
        ApiResourceInfo, Cluster, Coordinate, KindexError, KindexResult, ObjectKey, ObjectSummary, OpContext,
        UpstreamError, WatchEvent,
    };
}

pub const DEFAULT_NAMESPACE: &str = "default";

/// Group/version/plural triple addressing one API shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl Coordinate {
    pub fn new(group: impl Into<String>, version: impl Into<String>, plural: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), plural: plural.into() }
    }

    /// `v1` for the core group, `group/version` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.plural)
    }
}

/// One served resource type as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResourceInfo {
    pub coordinate: Coordinate,
    pub kind: String,
    pub singular: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
}

impl ApiResourceInfo {
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }

    /// Only list+watch capable kinds can be mirrored locally.
    pub fn supports_list_watch(&self) -> bool {
        self.supports("list") && self.supports("watch")
    }

    /// Effective namespace of a single-object call: `default` for namespaced
    /// kinds when none is given, always `None` for cluster-scoped kinds.
    pub fn object_namespace<'a>(&self, namespace: Option<&'a str>) -> Option<&'a str> {
        if self.namespaced {
            Some(namespace.filter(|ns| !ns.is_empty()).unwrap_or(DEFAULT_NAMESPACE))
        } else {
            None
        }
    }
}

/// Composite store key: `{namespace, name}`, namespace absent for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string), name: name.to_string() }
    }

    /// Key of a raw object; `None` when `metadata.name` is missing.
    pub fn of(obj: &Value) -> Option<Self> {
        let name = meta_str(obj, "name")?;
        Some(Self::new(meta_str(obj, "namespace"), name))
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Lightweight list projection: enough to enumerate, not the full body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub name: String,
    pub kind: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

impl ObjectSummary {
    pub fn project(kind: &str, obj: &Value) -> Self {
        let labels = obj
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.as_object())
            .map(|l| l.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default();
        Self {
            name: meta_str(obj, "name").unwrap_or("").to_string(),
            kind: kind.to_string(),
            namespace: meta_str(obj, "namespace").unwrap_or("").to_string(),
            labels,
        }
    }
}

/// Delta delivered by a watch. `Restarted` carries a full relist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchEvent {
    Applied(Value),
    Deleted(Value),
    Restarted(Vec<Value>),
}

/// Read a string field of `metadata`.
pub fn meta_str<'a>(obj: &'a Value, field: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
}

/// Drop server bookkeeping that bloats cached objects.
pub fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_api_version_has_no_group_prefix() {
        assert_eq!(Coordinate::new("", "v1", "pods").api_version(), "v1");
        assert_eq!(Coordinate::new("apps", "v1", "deployments").api_version(), "apps/v1");
        assert_eq!(Coordinate::new("apps", "v1", "deployments").to_string(), "apps/v1/deployments");
    }

    #[test]
    fn object_key_treats_empty_namespace_as_cluster_scoped() {
        let a = ObjectKey::new(Some(""), "node-1");
        assert_eq!(a.namespace, None);
        assert_eq!(a.to_string(), "node-1");
        let obj = serde_json::json!({"metadata": {"name": "web", "namespace": "demo"}});
        assert_eq!(ObjectKey::of(&obj), Some(ObjectKey::new(Some("demo"), "web")));
        assert_eq!(ObjectKey::of(&serde_json::json!({"metadata": {}})), None);
    }

    #[test]
    fn summary_keeps_only_string_labels() {
        let obj = serde_json::json!({
            "metadata": {"name": "web", "namespace": "demo", "labels": {"app": "web", "weird": 3}},
            "spec": {"replicas": 2}
        });
        let s = ObjectSummary::project("Deployment", &obj);
        assert_eq!(s.name, "web");
        assert_eq!(s.kind, "Deployment");
        assert_eq!(s.namespace, "demo");
        assert_eq!(s.labels.len(), 1);
        assert_eq!(s.labels.get("app").map(String::as_str), Some("web"));
    }

    #[test]
    fn list_watch_requires_both_verbs() {
        let mut info = ApiResourceInfo {
            coordinate: Coordinate::new("", "v1", "bindings"),
            kind: "Binding".into(),
            singular: "binding".into(),
            namespaced: true,
            verbs: vec!["create".into()],
        };
        assert!(!info.supports_list_watch());
        info.verbs = vec!["list".into()];
        assert!(!info.supports_list_watch());
        info.verbs.push("watch".into());
        assert!(info.supports_list_watch());
    }

    #[test]
    fn namespaced_kinds_default_namespace() {
        let mut info = ApiResourceInfo {
            coordinate: Coordinate::new("", "v1", "pods"),
            kind: "Pod".into(),
            singular: "pod".into(),
            namespaced: true,
            verbs: vec![],
        };
        assert_eq!(info.object_namespace(None), Some("default"));
        assert_eq!(info.object_namespace(Some("")), Some("default"));
        assert_eq!(info.object_namespace(Some("demo")), Some("demo"));
        info.namespaced = false;
        assert_eq!(info.object_namespace(Some("demo")), None);
    }

    #[test]
    fn strips_managed_fields_only() {
        let mut v = serde_json::json!({"metadata": {"name": "x", "managedFields": [{"a": 1}]}});
        strip_managed_fields(&mut v);
        assert_eq!(v, serde_json::json!({"metadata": {"name": "x"}}));
    }
}
