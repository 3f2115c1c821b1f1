//! In-memory cluster used by tests and demos.
//!
//! Objects live in a map keyed by coordinate + `{namespace, name}`; writes
//! follow API server semantics closely enough for the access layer:
//! merge patch is RFC 7386, creating into a missing namespace fails with
//! 404, creating an existing object fails with `AlreadyExists`, and every
//! write is fanned out to open watches.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::cluster::{BoxByteStream, BoxWatchStream, Cluster};
use crate::{ApiResourceInfo, Coordinate, ObjectKey, UpstreamError, WatchEvent};

type LogKey = (String, String, String);

#[derive(Default)]
struct MockState {
    objects: BTreeMap<(String, ObjectKey), Value>,
    watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
    fail_discovery: bool,
    fail_watch: HashSet<String>,
    scripted_watch: HashMap<String, Vec<Result<WatchEvent, UpstreamError>>>,
    logs: HashMap<LogKey, String>,
    log_errors: HashMap<LogKey, String>,
    pod_usage: HashMap<(String, String), Value>,
    node_usage: HashMap<String, Value>,
    calls: Vec<String>,
    rv: u64,
}

pub struct MockCluster {
    resources: Vec<ApiResourceInfo>,
    state: Mutex<MockState>,
    discovery_calls: AtomicUsize,
}

fn res(group: &str, version: &str, plural: &str, kind: &str, namespaced: bool, verbs: &[&str]) -> ApiResourceInfo {
    ApiResourceInfo {
        coordinate: Coordinate::new(group, version, plural),
        kind: kind.to_string(),
        singular: kind.to_ascii_lowercase(),
        namespaced,
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
    }
}

const ALL_VERBS: &[&str] = &["create", "delete", "get", "list", "patch", "update", "watch"];

impl MockCluster {
    pub fn new(resources: Vec<ApiResourceInfo>) -> Self {
        Self { resources, state: Mutex::new(MockState::default()), discovery_calls: AtomicUsize::new(0) }
    }

    /// A small but representative cluster: core kinds, apps, networking, a
    /// create-only kind, a kind served by two groups and one custom resource.
    pub fn standard() -> Self {
        Self::new(vec![
            res("", "v1", "bindings", "Binding", true, &["create"]),
            res("", "v1", "configmaps", "ConfigMap", true, ALL_VERBS),
            res("", "v1", "events", "Event", true, ALL_VERBS),
            res("", "v1", "namespaces", "Namespace", false, ALL_VERBS),
            res("", "v1", "nodes", "Node", false, ALL_VERBS),
            res("", "v1", "pods", "Pod", true, ALL_VERBS),
            res("apps", "v1", "daemonsets", "DaemonSet", true, ALL_VERBS),
            res("apps", "v1", "deployments", "Deployment", true, ALL_VERBS),
            res("events.k8s.io", "v1", "events", "Event", true, ALL_VERBS),
            res("example.com", "v1alpha1", "widgets", "Widget", true, ALL_VERBS),
            res("networking.k8s.io", "v1", "ingresses", "Ingress", true, ALL_VERBS),
        ])
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // a panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn resource(&self, kind: &str) -> Option<&ApiResourceInfo> {
        self.resources.iter().find(|r| r.kind == kind)
    }

    /// Seed an object of `kind` without notifying watches.
    pub fn insert(&self, kind: &str, obj: Value) {
        let Some(r) = self.resource(kind) else { return };
        let Some(key) = ObjectKey::of(&obj) else { return };
        let mut st = self.lock();
        st.objects.insert((r.coordinate.to_string(), key), obj);
    }

    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
        let r = self.resource(kind)?;
        let key = ObjectKey::new(if r.namespaced { namespace } else { None }, name);
        self.lock().objects.get(&(r.coordinate.to_string(), key)).cloned()
    }

    pub fn object_count(&self, kind: &str) -> usize {
        let Some(r) = self.resource(kind) else { return 0 };
        let c = r.coordinate.to_string();
        self.lock().objects.keys().filter(|(k, _)| *k == c).count()
    }

    pub fn set_fail_discovery(&self, fail: bool) {
        self.lock().fail_discovery = fail;
    }

    pub fn fail_watch(&self, kind: &str) {
        self.lock().fail_watch.insert(kind.to_string());
    }

    /// Serve the next watch of `kind` from `events` instead of the object map.
    /// The stream ends after the last item.
    pub fn script_watch(&self, kind: &str, events: Vec<Result<WatchEvent, UpstreamError>>) {
        self.lock().scripted_watch.insert(kind.to_string(), events);
    }

    pub fn set_logs(&self, namespace: &str, pod: &str, container: &str, text: &str) {
        self.lock().logs.insert((namespace.into(), pod.into(), container.into()), text.to_string());
    }

    pub fn fail_logs(&self, namespace: &str, pod: &str, container: &str, message: &str) {
        self.lock().log_errors.insert((namespace.into(), pod.into(), container.into()), message.to_string());
    }

    pub fn set_pod_usage(&self, namespace: &str, pod: &str, usage: Value) {
        self.lock().pod_usage.insert((namespace.into(), pod.into()), usage);
    }

    pub fn set_node_usage(&self, node: &str, usage: Value) {
        self.lock().node_usage.insert(node.into(), usage);
    }

    pub fn discovery_calls(&self) -> usize {
        self.discovery_calls.load(Ordering::SeqCst)
    }

    /// Recorded live calls, e.g. `get v1/pods demo/web`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn notify(st: &mut MockState, coord: &str, ev: WatchEvent) {
        st.watchers.retain(|(c, tx)| c != coord || tx.send(ev.clone()).is_ok());
    }

    fn scoped<'a>(r: &ApiResourceInfo, namespace: Option<&'a str>) -> Option<&'a str> {
        if r.namespaced {
            namespace.filter(|ns| !ns.is_empty())
        } else {
            None
        }
    }

    fn namespace_exists(&self, st: &MockState, ns: &str) -> bool {
        match self.resource("Namespace") {
            Some(r) => st.objects.contains_key(&(r.coordinate.to_string(), ObjectKey::new(None, ns))),
            None => true,
        }
    }
}

/// Equality-based selector subset: `k=v`, `k==v`, `k!=v`, `k`, `!k`.
fn labels_match(obj: &Value, selector: &str) -> bool {
    let labels = obj.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.as_object());
    let get = |k: &str| labels.and_then(|l| l.get(k)).and_then(|v| v.as_str());
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            get(k.trim()) != Some(v.trim())
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            get(k.trim()) == Some(v.trim())
        } else if let Some(k) = term.strip_prefix('!') {
            get(k.trim()).is_none()
        } else {
            get(term).is_some()
        }
    })
}

/// Dotted-path equality, e.g. `metadata.name=web,spec.nodeName!=n1`.
fn fields_match(obj: &Value, selector: &str) -> bool {
    let lookup = |path: &str| {
        path.trim().split('.').try_fold(obj, |cur, seg| cur.get(seg)).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            lookup(k).as_deref() != Some(v.trim())
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            lookup(k).as_deref() == Some(v.trim())
        } else {
            false
        }
    })
}

fn tail(text: &str, lines: i64) -> String {
    let all: Vec<&str> = text.lines().collect();
    let keep = usize::try_from(lines.max(0)).unwrap_or(0).min(all.len());
    let mut out = all[all.len() - keep..].join("\n");
    if keep > 0 && text.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[async_trait::async_trait]
impl Cluster for MockCluster {
    async fn list_api_resources(&self) -> Result<Vec<ApiResourceInfo>, UpstreamError> {
        self.discovery_calls.fetch_add(1, Ordering::SeqCst);
        let mut st = self.lock();
        st.calls.push("discovery".into());
        if st.fail_discovery {
            return Err(UpstreamError::transport("discovery endpoint unreachable"));
        }
        Ok(self.resources.clone())
    }

    async fn get(&self, r: &ApiResourceInfo, namespace: Option<&str>, name: &str) -> Result<Value, UpstreamError> {
        let ns = Self::scoped(r, namespace);
        let key = ObjectKey::new(ns, name);
        let mut st = self.lock();
        st.calls.push(format!("get {} {}", r.coordinate, key));
        st.objects
            .get(&(r.coordinate.to_string(), key))
            .cloned()
            .ok_or_else(|| UpstreamError::not_found(format!("{} \"{}\" not found", r.coordinate.plural, name)))
    }

    async fn list(
        &self,
        r: &ApiResourceInfo,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<Value>, UpstreamError> {
        let ns = Self::scoped(r, namespace);
        let coord = r.coordinate.to_string();
        let mut st = self.lock();
        st.calls.push(format!(
            "list {} {} label={} field={}",
            r.coordinate,
            ns.unwrap_or("*"),
            label_selector.unwrap_or(""),
            field_selector.unwrap_or("")
        ));
        Ok(st
            .objects
            .iter()
            .filter(|((c, k), _)| *c == coord && (ns.is_none() || k.namespace.as_deref() == ns))
            .map(|(_, v)| v)
            .filter(|v| label_selector.map(|s| labels_match(v, s)).unwrap_or(true))
            .filter(|v| field_selector.map(|s| fields_match(v, s)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn create(&self, r: &ApiResourceInfo, namespace: Option<&str>, obj: &Value) -> Result<Value, UpstreamError> {
        let ns = Self::scoped(r, namespace);
        let mut obj = obj.clone();
        let name = crate::meta_str(&obj, "name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| UpstreamError::new(Some(422), "Invalid", "metadata.name: Required value"))?
            .to_string();
        let key = ObjectKey::new(ns, &name);
        let coord = r.coordinate.to_string();
        let mut st = self.lock();
        st.calls.push(format!("create {} {}", r.coordinate, key));
        if r.namespaced {
            let Some(ns) = ns else {
                return Err(UpstreamError::new(Some(400), "BadRequest", "namespace required"));
            };
            if !self.namespace_exists(&st, ns) {
                return Err(UpstreamError::not_found(format!("namespaces \"{}\" not found", ns)));
            }
        }
        if st.objects.contains_key(&(coord.clone(), key.clone())) {
            return Err(UpstreamError::already_exists(format!("{} \"{}\" already exists", r.coordinate.plural, name)));
        }
        st.rv += 1;
        let rv = st.rv.to_string();
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            if let Some(ns) = ns {
                meta.insert("namespace".into(), json!(ns));
            }
            meta.insert("resourceVersion".into(), json!(rv));
            meta.insert("uid".into(), json!(format!("mock-{}", rv)));
        }
        st.objects.insert((coord.clone(), key), obj.clone());
        Self::notify(&mut st, &coord, WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    async fn patch_merge(
        &self,
        r: &ApiResourceInfo,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<Value, UpstreamError> {
        let ns = Self::scoped(r, namespace);
        let key = ObjectKey::new(ns, name);
        let coord = r.coordinate.to_string();
        let mut st = self.lock();
        st.calls.push(format!("patch {} {}", r.coordinate, key));
        st.rv += 1;
        let rv = st.rv;
        let Some(obj) = st.objects.get_mut(&(coord.clone(), key)) else {
            return Err(UpstreamError::not_found(format!("{} \"{}\" not found", r.coordinate.plural, name)));
        };
        let before = obj.clone();
        json_patch::merge(obj, patch);
        if *obj != before {
            if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert("resourceVersion".into(), json!(rv.to_string()));
            }
        }
        let out = obj.clone();
        Self::notify(&mut st, &coord, WatchEvent::Applied(out.clone()));
        Ok(out)
    }

    async fn delete(&self, r: &ApiResourceInfo, namespace: Option<&str>, name: &str) -> Result<(), UpstreamError> {
        let ns = Self::scoped(r, namespace);
        let key = ObjectKey::new(ns, name);
        let coord = r.coordinate.to_string();
        let mut st = self.lock();
        st.calls.push(format!("delete {} {}", r.coordinate, key));
        match st.objects.remove(&(coord.clone(), key)) {
            Some(obj) => {
                Self::notify(&mut st, &coord, WatchEvent::Deleted(obj));
                Ok(())
            }
            None => Err(UpstreamError::not_found(format!("{} \"{}\" not found", r.coordinate.plural, name))),
        }
    }

    async fn watch(&self, r: &ApiResourceInfo) -> Result<BoxWatchStream, UpstreamError> {
        let coord = r.coordinate.to_string();
        let mut st = self.lock();
        st.calls.push(format!("watch {}", r.coordinate));
        if st.fail_watch.contains(&r.kind) {
            let err = UpstreamError::new(Some(403), "Forbidden", format!("{} is forbidden", r.coordinate.plural));
            return Ok(futures::stream::iter(vec![Err::<WatchEvent, UpstreamError>(err)]).chain(futures::stream::pending()).boxed());
        }
        if let Some(script) = st.scripted_watch.remove(&r.kind) {
            return Ok(futures::stream::iter(script).boxed());
        }
        let initial: Vec<Value> = st.objects.iter().filter(|((c, _), _)| *c == coord).map(|(_, v)| v.clone()).collect();
        let (tx, rx) = mpsc::unbounded_channel();
        st.watchers.push((coord, tx));
        let live = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (Ok::<_, UpstreamError>(ev), rx)) });
        Ok(futures::stream::once(async move { Ok(WatchEvent::Restarted(initial)) }).chain(live).boxed())
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        tail_lines: i64,
    ) -> Result<BoxByteStream, UpstreamError> {
        let key = (namespace.to_string(), pod.to_string(), container.unwrap_or("").to_string());
        let mut st = self.lock();
        st.calls.push(format!("logs {}/{}/{} tail={}", namespace, pod, container.unwrap_or(""), tail_lines));
        if let Some(msg) = st.log_errors.get(&key) {
            return Err(UpstreamError::new(Some(400), "BadRequest", msg.clone()));
        }
        let text = st.logs.get(&key).map(|t| tail(t, tail_lines)).unwrap_or_default();
        // two chunks so consumers see a split line
        let mid = text.len() / 2;
        let mid = (mid..=text.len()).find(|i| text.is_char_boundary(*i)).unwrap_or(text.len());
        let (a, b) = text.split_at(mid);
        let chunks: Vec<Result<Bytes, UpstreamError>> = vec![Ok(Bytes::from(a.to_string())), Ok(Bytes::from(b.to_string()))];
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn pod_usage(&self, namespace: &str, pod: &str) -> Result<Value, UpstreamError> {
        let mut st = self.lock();
        st.calls.push(format!("usage pod {}/{}", namespace, pod));
        st.pod_usage
            .get(&(namespace.to_string(), pod.to_string()))
            .cloned()
            .ok_or_else(|| UpstreamError::not_found(format!("podmetrics \"{}\" not found", pod)))
    }

    async fn node_usage(&self, node: &str) -> Result<Value, UpstreamError> {
        let mut st = self.lock();
        st.calls.push(format!("usage node {}", node));
        st.node_usage.get(node).cloned().ok_or_else(|| UpstreamError::not_found(format!("nodemetrics \"{}\" not found", node)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_cover_equality_subset() {
        let obj = json!({"metadata": {"name": "web", "namespace": "demo", "labels": {"app": "foo", "tier": "fe"}}});
        assert!(labels_match(&obj, "app=foo"));
        assert!(labels_match(&obj, "app==foo,tier"));
        assert!(!labels_match(&obj, "app!=foo"));
        assert!(labels_match(&obj, "!missing"));
        assert!(fields_match(&obj, "metadata.name=web"));
        assert!(!fields_match(&obj, "metadata.namespace=other"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc\n");
        assert_eq!(tail("a\nb", 5), "a\nb");
        assert_eq!(tail("a\nb\n", 0), "");
    }

    #[tokio::test]
    async fn create_requires_namespace_object() {
        let m = MockCluster::standard();
        let cm = m.resource("ConfigMap").cloned().unwrap();
        let obj = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}});
        let err = m.create(&cm, Some("demo"), &obj).await.unwrap_err();
        assert!(err.is_not_found());
        m.insert("Namespace", json!({"metadata": {"name": "demo"}}));
        let created = m.create(&cm, Some("demo"), &obj).await.unwrap();
        assert_eq!(crate::meta_str(&created, "namespace"), Some("demo"));
        assert!(m.create(&cm, Some("demo"), &obj).await.unwrap_err().is_already_exists());
    }
}
