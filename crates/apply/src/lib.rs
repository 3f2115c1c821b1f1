//! Kindex apply: the write path. Every write goes to the live API; mirrors
//! catch up through their watches.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kindex_core::{ApiResourceInfo, KindexError, KindexResult, UpstreamError};
use kindex_kubehub::CoordinateResolver;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

pub mod manifest;

pub use manifest::{parse_manifest, ManifestLimits};

pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Created,
    Patched,
}

impl UpsertAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Patched => "patched",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub action: UpsertAction,
    pub object: Json,
}

#[derive(Clone)]
pub struct WritePath {
    resolver: Arc<CoordinateResolver>,
    limits: ManifestLimits,
}

impl WritePath {
    pub fn new(resolver: Arc<CoordinateResolver>, limits: ManifestLimits) -> Self {
        Self { resolver, limits }
    }

    pub fn limits(&self) -> ManifestLimits {
        self.limits
    }

    /// Upsert from manifest text (JSON or YAML).
    pub async fn upsert_text(&self, kind: Option<&str>, namespace: Option<&str>, text: &str) -> KindexResult<UpsertOutcome> {
        let manifest = parse_manifest(text, self.limits)?;
        self.upsert(kind, namespace, manifest).await
    }

    /// Create-or-update: merge patch first, create when the object is absent.
    ///
    /// `kind` and `namespace` fall back to the manifest's own fields. The
    /// name must be present before any API call is made.
    pub async fn upsert(&self, kind: Option<&str>, namespace: Option<&str>, manifest: Json) -> KindexResult<UpsertOutcome> {
        let t0 = Instant::now();
        if !manifest.is_object() {
            return Err(KindexError::InvalidManifest("manifest must be a mapping at the top level".into()));
        }
        let kind = kind
            .filter(|k| !k.is_empty())
            .or_else(|| manifest::manifest_kind(&manifest))
            .ok_or_else(|| {
                KindexError::InvalidManifest("kind is required: pass it explicitly or set it in the manifest".into())
            })?
            .to_string();
        let name = manifest::manifest_name(&manifest)
            .ok_or_else(|| KindexError::InvalidManifest("metadata.name is required".into()))?
            .to_string();
        let info = self.resolver.resolve(&kind).await?;
        let ns = if info.namespaced {
            info.object_namespace(namespace.filter(|n| !n.is_empty()).or_else(|| manifest::manifest_namespace(&manifest)))
                .map(str::to_string)
        } else {
            None
        };

        let mut body = manifest::strip_noisy(manifest);
        manifest::normalize(&mut body, &info.coordinate.api_version(), &info.kind, &name, ns.as_deref())?;

        if let Some(ns) = ns.as_deref() {
            self.ensure_namespace(ns).await?;
        }

        let res = self.patch_or_create(&info, ns.as_deref(), &name, &body).await;
        let outcome = match &res {
            Ok(o) => o.action.as_str(),
            Err(_) => "error",
        };
        counter!("kindex_upserts_total", 1, "outcome" => outcome);
        histogram!("kindex_upsert_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Ok(o) = &res {
            info!(kind = %kind, name = %name, namespace = ?ns, action = o.action.as_str(), took_ms = %t0.elapsed().as_millis(), "upsert: ok");
        }
        res
    }

    async fn patch_or_create(&self, info: &ApiResourceInfo, ns: Option<&str>, name: &str, body: &Json) -> KindexResult<UpsertOutcome> {
        let cluster = self.resolver.cluster();
        let wrap = |op: &'static str, e: UpstreamError| KindexError::upstream(op, &info.kind, name, ns, e);
        match cluster.patch_merge(info, ns, name, body).await {
            Ok(object) => return Ok(UpsertOutcome { action: UpsertAction::Patched, object }),
            Err(e) if e.is_not_found() => debug!(kind = %info.kind, name = %name, "upsert: absent, creating"),
            Err(e) => return Err(wrap("patch", e)),
        }
        match cluster.create(info, ns, body).await {
            Ok(object) => Ok(UpsertOutcome { action: UpsertAction::Created, object }),
            Err(e) if e.is_already_exists() => {
                // lost a create race; the object exists now, so patch it
                warn!(kind = %info.kind, name = %name, "upsert: concurrent create, retrying patch");
                cluster
                    .patch_merge(info, ns, name, body)
                    .await
                    .map(|object| UpsertOutcome { action: UpsertAction::Patched, object })
                    .map_err(|e| wrap("patch", e))
            }
            Err(e) => Err(wrap("create", e)),
        }
    }

    /// Create `namespace` when it does not exist. A concurrent creator is
    /// tolerated. Returns whether this call created it.
    pub async fn ensure_namespace(&self, namespace: &str) -> KindexResult<bool> {
        let info = self.resolver.resolve("Namespace").await?;
        let cluster = self.resolver.cluster();
        match cluster.get(&info, None, namespace).await {
            Ok(_) => return Ok(false),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(KindexError::upstream("get", "Namespace", namespace, None, e)),
        }
        let body = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": namespace,
                "labels": {"kubernetes.io/metadata.name": namespace}
            }
        });
        match cluster.create(&info, None, &body).await {
            Ok(_) => {
                info!(namespace = %namespace, "namespace: created");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(KindexError::upstream("create", "Namespace", namespace, None, e)),
        }
    }

    /// Delete by name with the platform's default propagation.
    pub async fn delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> KindexResult<()> {
        let info = self.resolver.resolve(kind).await?;
        let ns = info.object_namespace(namespace);
        self.resolver
            .cluster()
            .delete(&info, ns, name)
            .await
            .map_err(|e| KindexError::upstream("delete", kind, name, ns, e))?;
        info!(kind = %kind, name = %name, namespace = ?ns, "delete: ok");
        Ok(())
    }

    /// Stamp a restart annotation on the pod template so the controller
    /// rolls its pods. Kinds without `spec.template` are rejected.
    pub async fn rollout_restart(&self, kind: &str, namespace: Option<&str>, name: &str) -> KindexResult<Json> {
        let info = self.resolver.resolve(kind).await?;
        let ns = info.object_namespace(namespace);
        let cluster = self.resolver.cluster();
        let unsupported = || KindexError::UnsupportedKind { kind: kind.to_string(), operation: "rollout restart" };

        let current = cluster.get(&info, ns, name).await.map_err(|e| KindexError::upstream("get", kind, name, ns, e))?;
        if !has_pod_template(&current) {
            return Err(unsupported());
        }
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let patch = json!({"spec": {"template": {"metadata": {"annotations": {RESTARTED_AT_ANNOTATION: now}}}}});
        let patched = cluster
            .patch_merge(&info, ns, name, &patch)
            .await
            .map_err(|e| KindexError::upstream("patch", kind, name, ns, e))?;
        if !has_pod_template(&patched) {
            return Err(unsupported());
        }
        info!(kind = %kind, name = %name, namespace = ?ns, restarted_at = %now, "rollout restart: ok");
        Ok(patched)
    }
}

fn has_pod_template(obj: &Json) -> bool {
    obj.get("spec").and_then(|s| s.get("template")).map_or(false, Json::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_template_detection() {
        assert!(has_pod_template(&json!({"spec": {"template": {"spec": {}}}})));
        assert!(!has_pod_template(&json!({"spec": {"template": null}})));
        assert!(!has_pod_template(&json!({"data": {}})));
    }

    #[test]
    fn upsert_action_serializes_lowercase() {
        assert_eq!(serde_json::to_value(UpsertAction::Created).unwrap(), json!("created"));
    }
}
