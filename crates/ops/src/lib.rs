//! Kindex ops: kind-specific views reshaped from Read Path results and the
//! typed log and metrics capabilities.

#![forbid(unsafe_code)]

use std::time::Instant;

use kindex_core::{KindexError, KindexResult, UpstreamError, DEFAULT_NAMESPACE};
use kindex_store::ReadPath;
use serde_json::Value;
use tracing::{debug, info};

pub mod events;
pub mod ingress;
pub mod logs;
pub mod usage;

pub use events::EventSummary;
pub use ingress::{IngressPath, IngressSummary};
pub use usage::{ContainerUsage, NodeUsage, PodUsage, Usage};

/// Deserialize a raw object into a k8s-openapi type. List items often
/// arrive without `apiVersion`/`kind`, which the typed decoder checks.
pub(crate) fn typed<K>(v: &Value) -> Result<K, serde_json::Error>
where
    K: k8s_openapi::Resource + serde::de::DeserializeOwned,
{
    let mut v = v.clone();
    if let Some(m) = v.as_object_mut() {
        m.insert("apiVersion".into(), Value::String(K::API_VERSION.into()));
        m.insert("kind".into(), Value::String(K::KIND.into()));
    }
    serde_json::from_value(v)
}

#[derive(Clone)]
pub struct DerivedViews {
    read: ReadPath,
    max_log_lines: i64,
}

impl DerivedViews {
    pub fn new(read: ReadPath, max_log_lines: i64) -> Self {
        Self { read, max_log_lines: max_log_lines.max(1) }
    }

    pub fn max_log_lines(&self) -> i64 {
        self.max_log_lines
    }

    /// Tail of a pod's logs. With no container named and several in the
    /// pod, each container's tail follows its own header and a failing
    /// container contributes an inline error instead of aborting the rest.
    pub async fn pod_logs(
        &self,
        namespace: Option<&str>,
        pod: &str,
        container: Option<&str>,
        tail_lines: i64,
    ) -> KindexResult<String> {
        let t0 = Instant::now();
        let ns = namespace.filter(|n| !n.is_empty()).unwrap_or(DEFAULT_NAMESPACE);
        let tail = logs::clamp_tail(tail_lines, self.max_log_lines);
        let out = match container.filter(|c| !c.is_empty()) {
            Some(c) => self.container_logs(ns, pod, Some(c), tail).await?,
            None => {
                let obj = self.read.get("Pod", Some(ns), pod).await?;
                let names = logs::container_names(&obj);
                if names.is_empty() {
                    let e = UpstreamError::new(Some(400), "BadRequest", "pod has no containers");
                    return Err(KindexError::upstream("logs", "Pod", pod, Some(ns), e));
                }
                if names.len() == 1 {
                    self.container_logs(ns, pod, None, tail).await?
                } else {
                    self.aggregate_logs(ns, pod, &names, tail).await
                }
            }
        };
        info!(namespace = %ns, pod = %pod, tail, bytes = out.len(), took_ms = %t0.elapsed().as_millis(), "logs: ok");
        Ok(out)
    }

    async fn container_logs(&self, ns: &str, pod: &str, container: Option<&str>, tail: i64) -> KindexResult<String> {
        let cluster = self.read.resolver().cluster();
        let stream = cluster
            .stream_logs(ns, pod, container, tail)
            .await
            .map_err(|e| KindexError::upstream("logs", "Pod", pod, Some(ns), e))?;
        let ctx = format!("{}/{}", ns, pod);
        match logs::collect_lines(stream, tail_len(tail), &ctx).await {
            (text, None) => Ok(text),
            (_, Some(e)) => Err(KindexError::upstream("read logs", "Pod", pod, Some(ns), e)),
        }
    }

    async fn aggregate_logs(&self, ns: &str, pod: &str, containers: &[String], tail: i64) -> String {
        let cluster = self.read.resolver().cluster();
        let mut out = String::new();
        for c in containers {
            let stream = match cluster.stream_logs(ns, pod, Some(c.as_str()), tail).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(namespace = %ns, pod = %pod, container = %c, error = %e, "logs: container stream failed");
                    out.push_str(&logs::container_error(c, &e));
                    continue;
                }
            };
            out.push_str(&logs::container_header(c));
            let ctx = format!("{}/{}/{}", ns, pod, c);
            match logs::collect_lines(stream, tail_len(tail), &ctx).await {
                (text, None) => out.push_str(&text),
                (_, Some(e)) => out.push_str(&logs::read_error(&e)),
            }
        }
        out
    }

    /// Flattened ingress rules across all namespaces, optionally filtered by host.
    pub async fn ingresses(&self, host: Option<&str>) -> KindexResult<Vec<IngressSummary>> {
        let objs = self.read.list_objects("Ingress", None, None, None).await?;
        let out = ingress::flatten_all(objs.items.iter().map(|o| &**o), host);
        debug!(host = ?host, ingresses = out.len(), cached = objs.served_from_cache, "ingresses: ok");
        Ok(out)
    }

    pub async fn pod_usage(&self, namespace: Option<&str>, pod: &str) -> KindexResult<PodUsage> {
        let ns = namespace.filter(|n| !n.is_empty()).unwrap_or(DEFAULT_NAMESPACE);
        let raw = self
            .read
            .resolver()
            .cluster()
            .pod_usage(ns, pod)
            .await
            .map_err(|e| KindexError::upstream("usage", "PodMetrics", pod, Some(ns), e))?;
        Ok(usage::pod_usage(&raw))
    }

    pub async fn node_usage(&self, node: &str) -> KindexResult<NodeUsage> {
        let raw = self
            .read
            .resolver()
            .cluster()
            .node_usage(node)
            .await
            .map_err(|e| KindexError::upstream("usage", "NodeMetrics", node, None, e))?;
        Ok(usage::node_usage(&raw))
    }

    /// Events, mirror-backed without a selector and live with one.
    pub async fn events(&self, namespace: Option<&str>, label_selector: Option<&str>) -> KindexResult<Vec<EventSummary>> {
        let objs = self.read.list_objects("Event", namespace, label_selector, None).await?;
        Ok(events::project_all(objs.items.iter().map(|o| &**o)))
    }
}

fn tail_len(tail: i64) -> usize {
    usize::try_from(tail).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::Ingress;
    use serde_json::json;

    #[test]
    fn typed_fills_type_meta() {
        let ing: Ingress = typed(&json!({"metadata": {"name": "x"}})).unwrap();
        assert_eq!(ing.metadata.name.as_deref(), Some("x"));
    }

    #[test]
    fn typed_overrides_foreign_type_meta() {
        let v = json!({"apiVersion": "extensions/v1beta1", "kind": "Ingress", "metadata": {"name": "old"}});
        assert!(typed::<Ingress>(&v).is_ok());
    }
}
