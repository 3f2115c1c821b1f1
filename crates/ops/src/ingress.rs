//! Ingress rules flattened to `{host, path} -> {service, port}` rows.

use k8s_openapi::api::networking::v1::{Ingress, IngressRule};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::typed;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressPath {
    pub host: String,
    pub path: String,
    pub service_name: String,
    pub port_name: String,
    pub port_num: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressSummary {
    pub name: String,
    pub namespace: String,
    pub paths: Vec<IngressPath>,
}

/// Flatten one ingress. `None` when a host filter is given and no rule
/// matches it; an ingress without rules matches every filter.
pub fn flatten(ingress: &Ingress, host: Option<&str>) -> Option<IngressSummary> {
    let host = host.filter(|h| !h.is_empty());
    let rules: &[IngressRule] = ingress.spec.as_ref().and_then(|s| s.rules.as_deref()).unwrap_or(&[]);
    let mut matched = rules.is_empty();
    let mut paths = Vec::new();
    for rule in rules {
        let rule_host = rule.host.as_deref().unwrap_or("");
        if host.map_or(false, |h| h != rule_host) {
            continue;
        }
        matched = true;
        let Some(http) = rule.http.as_ref() else { continue };
        for p in &http.paths {
            let Some(svc) = p.backend.service.as_ref() else { continue };
            let port = svc.port.as_ref();
            paths.push(IngressPath {
                host: rule_host.to_string(),
                path: p.path.clone().unwrap_or_default(),
                service_name: svc.name.clone(),
                port_name: port.and_then(|p| p.name.clone()).unwrap_or_default(),
                port_num: port.and_then(|p| p.number).unwrap_or_default(),
            });
        }
    }
    if !matched {
        return None;
    }
    Some(IngressSummary {
        name: ingress.metadata.name.clone().unwrap_or_default(),
        namespace: ingress.metadata.namespace.clone().unwrap_or_default(),
        paths,
    })
}

/// Flatten raw ingress objects, skipping any that do not parse. Output is
/// ordered by namespace then name.
pub fn flatten_all<'a>(objects: impl IntoIterator<Item = &'a Value>, host: Option<&str>) -> Vec<IngressSummary> {
    let mut out: Vec<IngressSummary> = objects
        .into_iter()
        .filter_map(|v| match typed::<Ingress>(v) {
            Ok(ing) => flatten(&ing, host),
            Err(e) => {
                warn!(error = %e, name = ?kindex_core::meta_str(v, "name"), "ingress: skipping unparsable object");
                None
            }
        })
        .collect();
    out.sort_by(|a, b| (a.namespace.as_str(), a.name.as_str()).cmp(&(b.namespace.as_str(), b.name.as_str())));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ingress(name: &str, rules: Value) -> Value {
        json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": name, "namespace": "web"},
            "spec": {"rules": rules}
        })
    }

    fn rule(host: &str, svc: &str, port: Value) -> Value {
        json!({
            "host": host,
            "http": {"paths": [{
                "path": "/",
                "pathType": "Prefix",
                "backend": {"service": {"name": svc, "port": port}}
            }]}
        })
    }

    #[test]
    fn no_filter_includes_everything() {
        let objs = vec![
            ingress("a", json!([rule("a.example.com", "svc-a", json!({"number": 80}))])),
            ingress("empty", json!([])),
        ];
        let out = flatten_all(&objs, None);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].paths[0].service_name, "svc-a");
        assert_eq!(out[0].paths[0].port_num, 80);
        assert!(out[1].paths.is_empty());
    }

    #[test]
    fn host_filter_drops_non_matching_rules() {
        let objs = vec![
            ingress("a", json!([rule("a.example.com", "svc-a", json!({"name": "http"})), rule("b.example.com", "svc-b", json!({"number": 8080}))])),
            ingress("other", json!([rule("c.example.com", "svc-c", json!({"number": 80}))])),
            ingress("catch-all", json!([])),
        ];
        let out = flatten_all(&objs, Some("b.example.com"));
        let names: Vec<_> = out.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "catch-all"]);
        assert_eq!(out[0].paths.len(), 1);
        assert_eq!(out[0].paths[0].host, "b.example.com");
        assert_eq!(out[0].paths[0].port_num, 8080);
        assert_eq!(out[0].paths[0].port_name, "");
    }

    #[test]
    fn resource_backends_are_skipped_but_host_still_matches() {
        let obj = ingress(
            "static",
            json!([{
                "host": "s.example.com",
                "http": {"paths": [{
                    "path": "/assets",
                    "pathType": "Prefix",
                    "backend": {"resource": {"apiGroup": "k8s.example.com", "kind": "Bucket", "name": "assets"}}
                }]}
            }]),
        );
        let out = flatten_all([&obj], Some("s.example.com"));
        assert_eq!(out.len(), 1);
        assert!(out[0].paths.is_empty());
    }

    #[test]
    fn projection_uses_camel_case() {
        let out = flatten_all([&ingress("a", json!([rule("h", "s", json!({"number": 1}))]))], None);
        let v = serde_json::to_value(&out[0]).unwrap();
        assert_eq!(v["paths"][0]["serviceName"], "s");
        assert_eq!(v["paths"][0]["portNum"], 1);
    }
}
