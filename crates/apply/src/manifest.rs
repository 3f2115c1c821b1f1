//! Manifest text → structured object, with size and complexity budgets.

use kindex_core::{KindexConfig, KindexError, KindexResult};
use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for ManifestLimits {
    fn default() -> Self {
        Self::from_config(&KindexConfig::default())
    }
}

impl ManifestLimits {
    pub fn from_config(cfg: &KindexConfig) -> Self {
        Self { max_bytes: cfg.max_manifest_bytes, max_nodes: cfg.max_manifest_nodes }
    }
}

/// True when `v` holds more than `max` nodes. The walk stops one node past
/// the budget, so oversized documents are not counted in full.
fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn count(v: &Json, seen: &mut usize, limit: usize) {
        *seen += 1;
        let children: Box<dyn Iterator<Item = &Json> + '_> = match v {
            Json::Object(map) => Box::new(map.values()),
            Json::Array(arr) => Box::new(arr.iter()),
            _ => return,
        };
        for child in children {
            if *seen > limit {
                return;
            }
            count(child, seen, limit);
        }
    }
    let mut seen = 0usize;
    count(v, &mut seen, max);
    seen > max
}

fn invalid(msg: impl Into<String>) -> KindexError {
    KindexError::InvalidManifest(msg.into())
}

/// Parse a JSON or YAML document into an object. JSON is tried first when
/// the text looks like JSON; anything else goes through YAML.
pub fn parse_manifest(text: &str, limits: ManifestLimits) -> KindexResult<Json> {
    if text.len() > limits.max_bytes {
        return Err(invalid(format!("manifest too large (>{} bytes)", limits.max_bytes)));
    }
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Err(invalid("manifest is empty"));
    }
    let json = if trimmed.starts_with('{') {
        serde_json::from_str::<Json>(trimmed).map_err(|e| invalid(format!("parsing JSON: {}", e)))?
    } else {
        let val: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| invalid(format!("parsing YAML: {}", e)))?;
        serde_json::to_value(val).map_err(|e| invalid(format!("converting YAML to JSON: {}", e)))?
    };
    if !json.is_object() {
        return Err(invalid("manifest must be a mapping at the top level"));
    }
    if json_node_budget_exceeded(&json, limits.max_nodes) {
        return Err(invalid(format!("manifest too complex (>{} nodes)", limits.max_nodes)));
    }
    Ok(json)
}

fn str_field<'a>(v: &'a Json, path: &[&str]) -> Option<&'a str> {
    path.iter().try_fold(v, |cur, seg| cur.get(*seg))?.as_str().filter(|s| !s.is_empty())
}

pub fn manifest_kind(v: &Json) -> Option<&str> {
    str_field(v, &["kind"])
}

pub fn manifest_name(v: &Json) -> Option<&str> {
    str_field(v, &["metadata", "name"])
}

pub fn manifest_namespace(v: &Json) -> Option<&str> {
    str_field(v, &["metadata", "namespace"])
}

/// Drop server-populated fields so a dumped object can be re-applied
/// without tripping optimistic concurrency.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for f in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(f);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Pin name/namespace and fill `apiVersion`/`kind` when absent. A `None`
/// namespace removes any namespace the manifest carried.
pub fn normalize(v: &mut Json, api_version: &str, kind: &str, name: &str, namespace: Option<&str>) -> KindexResult<()> {
    let obj = v.as_object_mut().ok_or_else(|| invalid("manifest must be a mapping at the top level"))?;
    obj.entry("apiVersion").or_insert_with(|| Json::String(api_version.to_string()));
    obj.entry("kind").or_insert_with(|| Json::String(kind.to_string()));
    let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    let meta = meta.as_object_mut().ok_or_else(|| invalid("metadata must be a mapping"))?;
    meta.insert("name".into(), Json::String(name.to_string()));
    match namespace {
        Some(ns) => {
            meta.insert("namespace".into(), Json::String(ns.to_string()));
        }
        None => {
            meta.remove("namespace");
        }
    }
    Ok(())
}
