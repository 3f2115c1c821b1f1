//! Point-in-time CPU/memory snapshots from `metrics.k8s.io`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodUsage {
    pub pod_name: String,
    pub namespace: String,
    pub timestamp: String,
    pub window: String,
    pub containers: Vec<ContainerUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUsage {
    pub node_name: String,
    pub timestamp: String,
    pub window: String,
    pub usage: Usage,
}

fn text(v: &Value, pointer: &str) -> String {
    match v.pointer(pointer) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn usage_of(v: &Value) -> Usage {
    Usage { cpu: text(v, "/usage/cpu"), memory: text(v, "/usage/memory") }
}

/// Project a raw `PodMetrics` object. Quantities are passed through as the
/// API reports them.
pub fn pod_usage(raw: &Value) -> PodUsage {
    let containers = raw
        .get("containers")
        .and_then(Value::as_array)
        .map(|cs| {
            cs.iter()
                .map(|c| {
                    let u = usage_of(c);
                    ContainerUsage { name: text(c, "/name"), cpu: u.cpu, memory: u.memory }
                })
                .collect()
        })
        .unwrap_or_default();
    PodUsage {
        pod_name: text(raw, "/metadata/name"),
        namespace: text(raw, "/metadata/namespace"),
        timestamp: text(raw, "/timestamp"),
        window: text(raw, "/window"),
        containers,
    }
}

pub fn node_usage(raw: &Value) -> NodeUsage {
    NodeUsage {
        node_name: text(raw, "/metadata/name"),
        timestamp: text(raw, "/timestamp"),
        window: text(raw, "/window"),
        usage: usage_of(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pod_projection() {
        let raw = json!({
            "metadata": {"name": "web-0", "namespace": "demo"},
            "timestamp": "2024-05-01T10:00:00Z",
            "window": "30s",
            "containers": [
                {"name": "app", "usage": {"cpu": "12m", "memory": "48Mi"}},
                {"name": "sidecar", "usage": {"cpu": "1m"}}
            ]
        });
        let p = pod_usage(&raw);
        assert_eq!(p.pod_name, "web-0");
        assert_eq!(p.window, "30s");
        assert_eq!(p.containers.len(), 2);
        assert_eq!(p.containers[0].memory, "48Mi");
        assert_eq!(p.containers[1].memory, "");
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["podName"], "web-0");
        assert_eq!(v["containers"][0]["cpu"], "12m");
    }

    #[test]
    fn node_projection() {
        let raw = json!({
            "metadata": {"name": "node-a"},
            "timestamp": "2024-05-01T10:00:00Z",
            "window": "20.5s",
            "usage": {"cpu": "250m", "memory": "1024Mi"}
        });
        let n = node_usage(&raw);
        assert_eq!(n.node_name, "node-a");
        assert_eq!(n.usage, Usage { cpu: "250m".into(), memory: "1024Mi".into() });
        assert_eq!(serde_json::to_value(&n).unwrap()["nodeName"], "node-a");
    }
}
