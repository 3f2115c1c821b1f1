use std::sync::Arc;
use std::time::Duration;

use kindex_api::{CacheMode, Kindex, KindexApi, UpsertAction};
use kindex_core::{mock::MockCluster, KindexConfig, OpContext};
use serde_json::json;

async fn kindex(mode: CacheMode) -> (Arc<MockCluster>, Kindex) {
    let mock = Arc::new(MockCluster::standard());
    mock.insert("Namespace", json!({"metadata": {"name": "default"}}));
    let cfg = KindexConfig { cache_mode: mode, sync_timeout: Duration::from_secs(5), ..KindexConfig::default() };
    let k = Kindex::with_cluster(mock.clone(), cfg).await.unwrap();
    (mock, k)
}

fn deployment(name: &str) -> serde_json::Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "labels": {"app": name}},
        "spec": {
            "selector": {"matchLabels": {"app": name}},
            "template": {"metadata": {"labels": {"app": name}}, "spec": {"containers": [{"name": "web", "image": "nginx"}]}}
        }
    })
}

#[tokio::test]
async fn resolve_pod_is_core_v1() {
    let (_, k) = kindex(CacheMode::Off).await;
    let ctx = OpContext::new();
    let c = k.resolve(&ctx, "Pod").await.unwrap();
    assert_eq!((c.group.as_str(), c.version.as_str(), c.plural.as_str()), ("", "v1", "pods"));
    assert_eq!(k.resolve(&ctx, "Pod").await.unwrap(), c);
    assert_eq!(k.resolve(&ctx, "pod").await.unwrap_err().code(), "KindNotFound");
}

#[tokio::test]
async fn upsert_twice_creates_then_patches() {
    let (mock, k) = kindex(CacheMode::Off).await;
    let ctx = OpContext::new();
    let first = k.upsert(&ctx, Some("Deployment"), Some("demo"), deployment("web")).await.unwrap();
    assert_eq!(first.action, UpsertAction::Created);
    assert!(mock.object("Namespace", None, "demo").is_some());
    let second = k.upsert(&ctx, Some("Deployment"), Some("demo"), deployment("web")).await.unwrap();
    assert_eq!(second.action, UpsertAction::Patched);

    let live = k.get(&ctx, "Deployment", "web", Some("demo")).await.unwrap();
    assert_eq!(live["metadata"]["name"], "web");
}

#[tokio::test]
async fn missing_pod_is_resource_not_found() {
    let (_, k) = kindex(CacheMode::Eager).await;
    assert!(k.wait_synced(None).await);
    let err = k.get(&OpContext::new(), "Pod", "missing-pod", Some("demo")).await.unwrap_err();
    assert_eq!(err.code(), "ResourceNotFound");
    k.shutdown().await;
}

#[tokio::test]
async fn eager_mirror_catches_up_after_write() {
    let (mock, k) = kindex(CacheMode::Eager).await;
    assert!(k.wait_synced(None).await);
    let ctx = OpContext::new();
    k.upsert_text(&ctx, None, Some("demo"), "kind: ConfigMap\napiVersion: v1\nmetadata:\n  name: flags\ndata:\n  on: \"yes\"\n")
        .await
        .unwrap();

    let mut seen = false;
    for _ in 0..200 {
        let l = k.list(&ctx, "ConfigMap", Some("demo"), None, None).await.unwrap();
        if l.served_from_cache && l.items.iter().any(|i| i.name == "flags") {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen, "mirror never reflected the write");

    mock.clear_calls();
    let live = k.list(&ctx, "ConfigMap", Some("demo"), Some("app=none"), None).await.unwrap();
    assert!(!live.served_from_cache);
    assert!(live.items.is_empty());
    assert_eq!(mock.calls().len(), 1);
    k.shutdown().await;
}

#[tokio::test]
async fn sync_status_reports_failed_watch() {
    let mock = Arc::new(MockCluster::standard());
    mock.fail_watch("Widget");
    let cfg = KindexConfig { kind_allow: vec!["Widget".into(), "Pod".into()], ..KindexConfig::default() };
    let k = Kindex::with_cluster(mock.clone(), cfg).await.unwrap();
    assert!(k.wait_synced(Some(Duration::from_secs(5))).await);

    let mut report = k.sync_status().await;
    for _ in 0..200 {
        if report.all_synced {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        report = k.sync_status().await;
    }
    assert_eq!(report.mode, CacheMode::Eager);
    assert_eq!(report.kinds.len(), 2);
    let widget = report.kinds.iter().find(|s| s.kind == "Widget").unwrap();
    assert!(matches!(widget.status, kindex_store::StoreStatus::Failed(_)));

    // the failed kind still answers, live
    mock.insert("Widget", json!({"metadata": {"name": "w1", "namespace": "demo"}}));
    let l = k.list(&OpContext::new(), "Widget", Some("demo"), None, None).await.unwrap();
    assert!(!l.served_from_cache);
    assert_eq!(l.items.len(), 1);
    k.shutdown().await;
}

#[tokio::test]
async fn cancelled_context_fails_fast_without_calls() {
    let (mock, k) = kindex(CacheMode::Off).await;
    mock.clear_calls();
    let ctx = OpContext::new();
    ctx.cancel();
    let err = k.upsert(&ctx, Some("ConfigMap"), Some("demo"), json!({"metadata": {"name": "c"}})).await.unwrap_err();
    assert_eq!(err.code(), "Cancelled");
    assert!(mock.calls().is_empty(), "{:?}", mock.calls());
    assert!(mock.object("Namespace", None, "demo").is_none());
}

#[tokio::test]
async fn expired_deadline_is_cancelled() {
    let (_, k) = kindex(CacheMode::Off).await;
    let ctx = OpContext::new().with_timeout(Duration::ZERO);
    let err = k.get(&ctx, "Pod", "web", Some("demo")).await.unwrap_err();
    assert_eq!(err.code(), "Cancelled");
}

#[tokio::test]
async fn shared_token_cancels_from_outside() {
    let (_, k) = kindex(CacheMode::Off).await;
    let token = tokio_util::sync::CancellationToken::new();
    let ctx = OpContext::with_token(token.clone());
    token.cancel();
    let err = k.events(&ctx, Some("demo"), None).await.unwrap_err();
    assert!(err.to_string().contains("events cancelled"), "{}", err);
}

#[tokio::test]
async fn api_resources_filters_are_independent() {
    let (_, k) = kindex(CacheMode::Off).await;
    let ctx = OpContext::new();
    let cluster_only = k.api_resources(&ctx, false, true).await.unwrap();
    assert!(!cluster_only.is_empty());
    assert!(cluster_only.iter().all(|r| !r.namespaced));
    let ns_only = k.api_resources(&ctx, true, false).await.unwrap();
    assert!(ns_only.iter().all(|r| r.namespaced));
    assert!(k.api_resources(&ctx, false, false).await.unwrap().is_empty());
}
