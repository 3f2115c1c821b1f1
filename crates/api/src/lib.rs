//! Kindex public API façade (in-process).
//!
//! Frontends depend on [`KindexApi`]. Every operation takes an [`OpContext`];
//! cancelling it or passing its deadline fails the call with `Cancelled` and
//! drops the in-flight request.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kindex_core::{Cluster, Coordinate, KindexConfig, KindexResult, OpContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

pub use kindex_apply::{ManifestLimits, UpsertAction, UpsertOutcome};
pub use kindex_core::{CacheMode, KindexError};
pub use kindex_kubehub::ApiResourceRow;
pub use kindex_ops::{EventSummary, IngressSummary, NodeUsage, PodUsage};
pub use kindex_store::{KindStatus, ListResult};

use kindex_apply::WritePath;
use kindex_kubehub::{CoordinateResolver, KubeCluster};
use kindex_ops::DerivedViews;
use kindex_store::{ReadPath, WatchFanout};

/// Mirror readiness, as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub mode: CacheMode,
    pub all_synced: bool,
    pub kinds: Vec<KindStatus>,
}

/// Declarative Kindex API surface.
#[async_trait::async_trait]
pub trait KindexApi: Send + Sync {
    /// Coordinate for a kind name (case-sensitive).
    async fn resolve(&self, ctx: &OpContext, kind: &str) -> KindexResult<Coordinate>;

    /// Served resource types; the two scope filters are independent.
    async fn api_resources(&self, ctx: &OpContext, include_namespaced: bool, include_cluster: bool) -> KindexResult<Vec<ApiResourceRow>>;

    async fn get(&self, ctx: &OpContext, kind: &str, name: &str, namespace: Option<&str>) -> KindexResult<Value>;

    async fn describe(&self, ctx: &OpContext, kind: &str, name: &str, namespace: Option<&str>) -> KindexResult<Value>;

    async fn list(
        &self,
        ctx: &OpContext,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> KindexResult<ListResult>;

    /// Create-or-merge-patch. `kind` and `namespace` default to the manifest's own.
    async fn upsert(&self, ctx: &OpContext, kind: Option<&str>, namespace: Option<&str>, manifest: Value) -> KindexResult<UpsertOutcome>;

    /// Upsert from JSON or YAML text.
    async fn upsert_text(&self, ctx: &OpContext, kind: Option<&str>, namespace: Option<&str>, text: &str) -> KindexResult<UpsertOutcome>;

    async fn delete(&self, ctx: &OpContext, kind: &str, name: &str, namespace: Option<&str>) -> KindexResult<()>;

    async fn rollout_restart(&self, ctx: &OpContext, kind: &str, name: &str, namespace: Option<&str>) -> KindexResult<Value>;

    async fn pod_logs(
        &self,
        ctx: &OpContext,
        namespace: Option<&str>,
        pod: &str,
        container: Option<&str>,
        tail_lines: i64,
    ) -> KindexResult<String>;

    async fn ingresses(&self, ctx: &OpContext, host: Option<&str>) -> KindexResult<Vec<IngressSummary>>;

    async fn pod_usage(&self, ctx: &OpContext, namespace: Option<&str>, pod: &str) -> KindexResult<PodUsage>;

    async fn node_usage(&self, ctx: &OpContext, node: &str) -> KindexResult<NodeUsage>;

    async fn events(&self, ctx: &OpContext, namespace: Option<&str>, label_selector: Option<&str>) -> KindexResult<Vec<EventSummary>>;

    /// Per-kind mirror state.
    async fn sync_status(&self) -> SyncReport;
}

/// In-process implementation wiring resolver, fan-out, read/write paths and views.
pub struct Kindex {
    config: KindexConfig,
    resolver: Arc<CoordinateResolver>,
    fanout: Arc<WatchFanout>,
    read: ReadPath,
    write: WritePath,
    views: DerivedViews,
}

impl Kindex {
    /// Build against an arbitrary cluster collaborator. In eager mode this
    /// runs discovery and starts one watch per mirrored kind.
    pub async fn with_cluster(cluster: Arc<dyn Cluster>, config: KindexConfig) -> KindexResult<Self> {
        let t0 = Instant::now();
        let resolver = Arc::new(CoordinateResolver::new(cluster));
        let fanout = Arc::new(WatchFanout::from_config(resolver.clone(), &config));
        let started = fanout.start().await?;
        let read = ReadPath::new(resolver.clone(), fanout.clone());
        let write = WritePath::new(resolver.clone(), ManifestLimits::from_config(&config));
        let views = DerivedViews::new(read.clone(), config.max_log_lines);
        info!(mode = ?config.cache_mode, watches = started, took_ms = %t0.elapsed().as_millis(), "kindex: ready");
        Ok(Self { config, resolver, fanout, read, write, views })
    }

    /// Connect to the cluster described by the environment and `config`.
    pub async fn connect(config: KindexConfig) -> anyhow::Result<Self> {
        let client = kindex_kubehub::connect(config.kubeconfig.as_deref()).await?;
        let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::new(client));
        Ok(Self::with_cluster(cluster, config).await?)
    }

    pub fn config(&self) -> &KindexConfig {
        &self.config
    }

    /// Wait for every live mirror to finish its initial list; `None` uses the
    /// configured sync timeout.
    pub async fn wait_synced(&self, timeout: Option<Duration>) -> bool {
        self.fanout.all_synchronized(timeout.unwrap_or(self.config.sync_timeout)).await
    }

    pub async fn shutdown(&self) {
        self.fanout.shutdown().await;
    }

    async fn traced<T, F>(&self, ctx: &OpContext, op: &'static str, target: &str, fut: F) -> KindexResult<T>
    where
        F: Future<Output = KindexResult<T>> + Send,
    {
        let t0 = Instant::now();
        info!(op, subject = %target, "api: {} start", op);
        let res = ctx.run(op, fut).await;
        match &res {
            Ok(_) => info!(op, subject = %target, took_ms = %t0.elapsed().as_millis(), "api: {} ok", op),
            Err(e) => warn!(op, subject = %target, code = e.code(), error = %e, took_ms = %t0.elapsed().as_millis(), "api: {} failed", op),
        }
        res
    }
}

fn target(kind: &str, name: &str, namespace: Option<&str>) -> String {
    match namespace.filter(|n| !n.is_empty()) {
        Some(ns) => format!("{}/{}/{}", kind, ns, name),
        None => format!("{}/{}", kind, name),
    }
}

#[async_trait::async_trait]
impl KindexApi for Kindex {
    async fn resolve(&self, ctx: &OpContext, kind: &str) -> KindexResult<Coordinate> {
        self.traced(ctx, "resolve", kind, async { Ok(self.resolver.resolve(kind).await?.coordinate) }).await
    }

    async fn api_resources(&self, ctx: &OpContext, include_namespaced: bool, include_cluster: bool) -> KindexResult<Vec<ApiResourceRow>> {
        self.traced(ctx, "api_resources", "*", self.resolver.api_resources(include_namespaced, include_cluster)).await
    }

    async fn get(&self, ctx: &OpContext, kind: &str, name: &str, namespace: Option<&str>) -> KindexResult<Value> {
        self.traced(ctx, "get", &target(kind, name, namespace), self.read.get(kind, namespace, name)).await
    }

    async fn describe(&self, ctx: &OpContext, kind: &str, name: &str, namespace: Option<&str>) -> KindexResult<Value> {
        self.traced(ctx, "describe", &target(kind, name, namespace), self.read.describe(kind, namespace, name)).await
    }

    async fn list(
        &self,
        ctx: &OpContext,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> KindexResult<ListResult> {
        let fut = self.read.list(kind, namespace, label_selector, field_selector);
        self.traced(ctx, "list", &target(kind, "*", namespace), fut).await
    }

    async fn upsert(&self, ctx: &OpContext, kind: Option<&str>, namespace: Option<&str>, manifest: Value) -> KindexResult<UpsertOutcome> {
        let t = target(kind.unwrap_or("-"), kindex_core::meta_str(&manifest, "name").unwrap_or("-"), namespace);
        self.traced(ctx, "upsert", &t, self.write.upsert(kind, namespace, manifest)).await
    }

    async fn upsert_text(&self, ctx: &OpContext, kind: Option<&str>, namespace: Option<&str>, text: &str) -> KindexResult<UpsertOutcome> {
        let t = target(kind.unwrap_or("-"), "-", namespace);
        self.traced(ctx, "upsert", &t, self.write.upsert_text(kind, namespace, text)).await
    }

    async fn delete(&self, ctx: &OpContext, kind: &str, name: &str, namespace: Option<&str>) -> KindexResult<()> {
        self.traced(ctx, "delete", &target(kind, name, namespace), self.write.delete(kind, namespace, name)).await
    }

    async fn rollout_restart(&self, ctx: &OpContext, kind: &str, name: &str, namespace: Option<&str>) -> KindexResult<Value> {
        self.traced(ctx, "rollout_restart", &target(kind, name, namespace), self.write.rollout_restart(kind, namespace, name)).await
    }

    async fn pod_logs(
        &self,
        ctx: &OpContext,
        namespace: Option<&str>,
        pod: &str,
        container: Option<&str>,
        tail_lines: i64,
    ) -> KindexResult<String> {
        let fut = self.views.pod_logs(namespace, pod, container, tail_lines);
        self.traced(ctx, "logs", &target("Pod", pod, namespace), fut).await
    }

    async fn ingresses(&self, ctx: &OpContext, host: Option<&str>) -> KindexResult<Vec<IngressSummary>> {
        self.traced(ctx, "ingresses", host.unwrap_or("*"), self.views.ingresses(host)).await
    }

    async fn pod_usage(&self, ctx: &OpContext, namespace: Option<&str>, pod: &str) -> KindexResult<PodUsage> {
        self.traced(ctx, "pod_usage", &target("Pod", pod, namespace), self.views.pod_usage(namespace, pod)).await
    }

    async fn node_usage(&self, ctx: &OpContext, node: &str) -> KindexResult<NodeUsage> {
        self.traced(ctx, "node_usage", &target("Node", node, None), self.views.node_usage(node)).await
    }

    async fn events(&self, ctx: &OpContext, namespace: Option<&str>, label_selector: Option<&str>) -> KindexResult<Vec<EventSummary>> {
        self.traced(ctx, "events", &target("Event", "*", namespace), self.views.events(namespace, label_selector)).await
    }

    async fn sync_status(&self) -> SyncReport {
        let kinds = self.fanout.status().await;
        let all_synced = kinds.iter().all(|k| !matches!(k.status, kindex_store::StoreStatus::Pending));
        SyncReport { mode: self.fanout.mode(), all_synced, kinds }
    }
}
