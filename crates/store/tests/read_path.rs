#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kindex_core::{mock::MockCluster, CacheMode, Cluster};
use kindex_kubehub::CoordinateResolver;
use kindex_store::{KindFilter, ReadPath, WatchFanout};
use serde_json::{json, Value};

fn pod(ns: &str, name: &str, app: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "namespace": ns, "labels": {"app": app}},
        "spec": {"containers": [{"name": "main", "image": "nginx"}]}
    })
}

async fn setup(mock: Arc<MockCluster>, mode: CacheMode) -> ReadPath {
    let resolver = Arc::new(CoordinateResolver::new(mock));
    let fanout = Arc::new(WatchFanout::new(resolver.clone(), mode, KindFilter::default(), 256));
    fanout.start().await.unwrap();
    assert!(fanout.all_synchronized(Duration::from_secs(5)).await);
    ReadPath::new(resolver, fanout)
}

fn seeded() -> Arc<MockCluster> {
    let mock = Arc::new(MockCluster::standard());
    mock.insert("Namespace", json!({"metadata": {"name": "demo"}}));
    mock.insert("Pod", pod("demo", "web-0", "foo"));
    mock.insert("Pod", pod("demo", "web-1", "bar"));
    mock.insert("Pod", pod("other", "api-0", "foo"));
    mock
}

#[tokio::test]
async fn plain_list_is_served_from_store_with_projection() {
    let mock = seeded();
    let read = setup(mock.clone(), CacheMode::Eager).await;
    mock.clear_calls();

    let res = read.list("Pod", Some("demo"), None, None).await.unwrap();
    assert!(res.served_from_cache);
    let mut names: Vec<_> = res.items.iter().map(|s| s.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["web-0", "web-1"]);
    assert!(res.items.iter().all(|s| s.kind == "Pod" && s.namespace == "demo"));
    assert!(mock.calls().iter().all(|c| !c.starts_with("list")), "{:?}", mock.calls());

    let all = read.list("Pod", None, None, None).await.unwrap();
    assert_eq!(all.items.len(), 3);
}

#[tokio::test]
async fn selectors_always_go_live() {
    let mock = seeded();
    let read = setup(mock.clone(), CacheMode::Eager).await;
    mock.clear_calls();

    let res = read.list("Pod", Some("demo"), Some("app=foo"), None).await.unwrap();
    assert!(!res.served_from_cache);
    assert_eq!(res.items.len(), 1);
    assert_eq!(res.items[0].name, "web-0");
    assert_eq!(res.items[0].labels.get("app").map(String::as_str), Some("foo"));

    let res = read.list("Pod", None, None, Some("metadata.name=api-0")).await.unwrap();
    assert!(!res.served_from_cache);
    assert_eq!(res.items.len(), 1);
    assert_eq!(mock.calls().iter().filter(|c| c.starts_with("list")).count(), 2);
}

#[tokio::test]
async fn store_eventually_reflects_live_writes() {
    let mock = seeded();
    let read = setup(mock.clone(), CacheMode::Eager).await;
    let info = mock.resource("Pod").cloned().unwrap();
    mock.create(&info, Some("demo"), &pod("demo", "web-2", "foo")).await.unwrap();

    let store = read.fanout().store("Pod").await.unwrap();
    let mut epoch = store.subscribe_epoch();
    let seen = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let res = read.list("Pod", Some("demo"), None, None).await.unwrap();
            if res.items.iter().any(|s| s.name == "web-2") {
                return true;
            }
            if epoch.changed().await.is_err() {
                return false;
            }
        }
    })
    .await;
    assert_eq!(seen, Ok(true));

    mock.clear_calls();
    let obj = read.get("Pod", Some("demo"), "web-2").await.unwrap();
    assert_eq!(obj["metadata"]["labels"]["app"], "foo");
    assert!(mock.calls().is_empty(), "store hit should not reach the cluster: {:?}", mock.calls());
}

#[tokio::test]
async fn failed_watch_degrades_kind_to_live_reads() {
    let mock = seeded();
    mock.fail_watch("Pod");
    let read = setup(mock.clone(), CacheMode::Eager).await;
    assert!(read.fanout().store("Pod").await.unwrap().is_failed());
    mock.clear_calls();

    let res = read.list("Pod", Some("demo"), None, None).await.unwrap();
    assert!(!res.served_from_cache);
    assert_eq!(res.items.len(), 2);
    let obj = read.get("Pod", Some("demo"), "web-1").await.unwrap();
    assert_eq!(obj["metadata"]["name"], "web-1");
    assert!(mock.calls().iter().any(|c| c.starts_with("get v1/pods demo/web-1")), "{:?}", mock.calls());
}

#[tokio::test]
async fn kind_without_list_watch_is_read_live() {
    let mock = seeded();
    let read = setup(mock.clone(), CacheMode::Eager).await;
    assert!(read.fanout().store("Binding").await.is_none());
    let res = read.list("Binding", Some("demo"), None, None).await.unwrap();
    assert!(!res.served_from_cache);
    assert!(res.items.is_empty());
}

#[tokio::test]
async fn cluster_scoped_list_ignores_namespace() {
    let mock = seeded();
    mock.insert("Node", json!({"metadata": {"name": "node-a"}}));
    let read = setup(mock.clone(), CacheMode::Eager).await;
    let res = read.list("Node", Some("demo"), None, None).await.unwrap();
    assert!(res.served_from_cache);
    assert_eq!(res.items.len(), 1);
    assert_eq!(res.items[0].namespace, "");
    let node = read.describe("Node", Some("demo"), "node-a").await.unwrap();
    assert_eq!(node["metadata"]["name"], "node-a");
}

#[tokio::test]
async fn cache_off_reads_everything_live() {
    let mock = seeded();
    let read = setup(mock.clone(), CacheMode::Off).await;
    let res = read.list("Pod", Some("demo"), None, None).await.unwrap();
    assert!(!res.served_from_cache);
    assert_eq!(res.items.len(), 2);
    let err = read.get("Pod", Some("demo"), "missing-pod").await.unwrap_err();
    assert_eq!(err.code(), "ResourceNotFound");
    let err = read.list("Gadget", None, None, None).await.unwrap_err();
    assert_eq!(err.code(), "KindNotFound");
}

#[tokio::test]
async fn lazy_first_read_is_live_then_cached() {
    let mock = seeded();
    let read = setup(mock.clone(), CacheMode::Lazy).await;
    let first = read.list("Pod", Some("demo"), None, None).await.unwrap();
    assert!(!first.served_from_cache);
    let store = read.fanout().store("Pod").await.unwrap();
    assert!(store.wait_synced(Duration::from_secs(2)).await);
    let second = read.list("Pod", Some("demo"), None, None).await.unwrap();
    assert!(second.served_from_cache);
    assert_eq!(second.items.len(), first.items.len());
}
