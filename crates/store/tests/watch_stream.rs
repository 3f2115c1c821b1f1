#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kindex_core::{mock::MockCluster, CacheMode, ObjectKey, UpstreamError, WatchEvent};
use kindex_kubehub::CoordinateResolver;
use kindex_store::{KindFilter, ResourceStore, StoreStatus, WatchFanout};
use serde_json::{json, Value};

fn pod(name: &str) -> Value {
    json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name, "namespace": "demo"}})
}

async fn pods_only(mock: Arc<MockCluster>) -> (Arc<WatchFanout>, ResourceStore) {
    let resolver = Arc::new(CoordinateResolver::new(mock));
    let fanout = Arc::new(WatchFanout::new(resolver, CacheMode::Eager, KindFilter::new(vec!["Pod".into()], vec![]), 64));
    assert_eq!(fanout.start().await.unwrap(), 1);
    let store = fanout.store("Pod").await.unwrap();
    (fanout, store)
}

fn names(store: &ResourceStore) -> Vec<String> {
    let mut out: Vec<String> = store
        .current()
        .list(None)
        .iter()
        .filter_map(|o| kindex_core::meta_str(o, "name").map(str::to_string))
        .collect();
    out.sort_unstable();
    out
}

#[tokio::test]
async fn errors_after_sync_keep_the_watch_and_relist_replaces_contents() {
    let mock = Arc::new(MockCluster::standard());
    mock.script_watch(
        "Pod",
        vec![
            Ok(WatchEvent::Restarted(vec![pod("a")])),
            Err(UpstreamError::transport("connection reset by peer")),
            Ok(WatchEvent::Applied(pod("b"))),
            Ok(WatchEvent::Restarted(vec![pod("c")])),
        ],
    );
    let (fanout, store) = pods_only(mock).await;

    let c = ObjectKey::new(Some("demo"), "c");
    let mut epochs = store.subscribe_epoch();
    let settled = tokio::time::timeout(
        Duration::from_secs(2),
        epochs.wait_for(|_| {
            let snap = store.current();
            snap.len() == 1 && snap.get(&c).is_some()
        }),
    )
    .await;
    assert!(settled.is_ok(), "store never settled on the last relist: {:?}", names(&store));

    assert_eq!(store.status(), StoreStatus::Synced);
    assert_eq!(names(&store), vec!["c"]);
    assert!(fanout.all_synchronized(Duration::from_secs(1)).await);
    fanout.shutdown().await;
}

#[tokio::test]
async fn stream_ending_before_initial_list_fails_the_store() {
    let mock = Arc::new(MockCluster::standard());
    mock.script_watch("Pod", vec![Ok(WatchEvent::Applied(pod("a")))]);
    let (fanout, store) = pods_only(mock).await;

    assert!(fanout.all_synchronized(Duration::from_secs(5)).await);
    match store.status() {
        StoreStatus::Failed(reason) => assert!(reason.contains("ended before initial list"), "{}", reason),
        other => panic!("expected failed store, got {:?}", other),
    }
    let kinds = fanout.status().await;
    assert_eq!(kinds.len(), 1);
    assert!(matches!(kinds[0].status, StoreStatus::Failed(_)));
    fanout.shutdown().await;
}
