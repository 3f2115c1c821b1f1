//! Watch fan-out: one mirrored store per list+watch capable kind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use kindex_core::{ApiResourceInfo, CacheMode, Cluster, KindexConfig, KindexResult};
use kindex_kubehub::CoordinateResolver;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{spawn_ingest, ResourceStore, StoreDelta, StoreStatus};

/// Bounds the mirrored kind set. Deny wins; an empty allow list admits all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindFilter {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl KindFilter {
    pub fn new(allow: Vec<String>, deny: Vec<String>) -> Self {
        Self { allow, deny }
    }

    pub fn from_config(cfg: &KindexConfig) -> Self {
        Self::new(cfg.kind_allow.clone(), cfg.kind_deny.clone())
    }

    pub fn admits(&self, kind: &str) -> bool {
        if self.deny.iter().any(|k| k == kind) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|k| k == kind)
    }
}

/// Per-kind status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStatus {
    pub kind: String,
    pub coordinate: String,
    pub status: StoreStatus,
    pub objects: usize,
}

pub struct WatchFanout {
    cluster: Arc<dyn Cluster>,
    resolver: Arc<CoordinateResolver>,
    mode: CacheMode,
    filter: KindFilter,
    queue_cap: usize,
    stores: RwLock<HashMap<String, ResourceStore>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WatchFanout {
    pub fn new(resolver: Arc<CoordinateResolver>, mode: CacheMode, filter: KindFilter, queue_cap: usize) -> Self {
        Self {
            cluster: Arc::clone(resolver.cluster()),
            resolver,
            mode,
            filter,
            queue_cap,
            stores: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(resolver: Arc<CoordinateResolver>, cfg: &KindexConfig) -> Self {
        Self::new(resolver, cfg.cache_mode, KindFilter::from_config(cfg), cfg.queue_cap)
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Eager mode: discover every kind, seed the resolver and mirror each
    /// admitted list+watch kind. Other modes only record the mode. Returns
    /// the number of watches started.
    pub async fn start(&self) -> KindexResult<usize> {
        if self.mode != CacheMode::Eager {
            info!(mode = ?self.mode, "fanout: eager start skipped");
            return Ok(0);
        }
        let t0 = Instant::now();
        let resources = self.resolver.discover().await?;
        let mut started = 0usize;
        let mut skipped = 0usize;
        for r in resources {
            let winner = self.resolver.seed(r.clone()).await;
            // a kind served by several groups is mirrored once, from the resolved group
            if winner.coordinate != r.coordinate {
                continue;
            }
            if !r.supports_list_watch() || !self.filter.admits(&r.kind) {
                skipped += 1;
                continue;
            }
            if self.spawn_store(r).await.is_some() {
                started += 1;
            }
        }
        info!(watches = started, skipped, took_ms = %t0.elapsed().as_millis(), "fanout: started");
        Ok(started)
    }

    /// The kind's store, if one exists in any state.
    pub async fn store(&self, kind: &str) -> Option<ResourceStore> {
        self.stores.read().await.get(kind).cloned()
    }

    /// The kind's store; in lazy mode one is created on first use.
    pub async fn store_for(&self, info: &ApiResourceInfo) -> Option<ResourceStore> {
        if let Some(s) = self.store(&info.kind).await {
            return Some(s);
        }
        if self.mode != CacheMode::Lazy || !info.supports_list_watch() || !self.filter.admits(&info.kind) {
            return None;
        }
        self.spawn_store(info.clone()).await
    }

    async fn spawn_store(&self, info: ApiResourceInfo) -> Option<ResourceStore> {
        let mut stores = self.stores.write().await;
        if let Some(existing) = stores.get(&info.kind) {
            return Some(existing.clone());
        }
        let (tx, store) = spawn_ingest(info.clone(), self.queue_cap);
        let task = tokio::spawn(run_watch(Arc::clone(&self.cluster), info.clone(), tx, store.clone()));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
        debug!(kind = %info.kind, coordinate = %info.coordinate, "fanout: store created");
        stores.insert(info.kind.clone(), store.clone());
        Some(store)
    }

    /// Block until every store has finished its initial list or failed.
    /// Failed stores are permanently live-only and do not hold readiness back.
    pub async fn all_synchronized(&self, timeout: Duration) -> bool {
        let stores: Vec<ResourceStore> = self.stores.read().await.values().cloned().collect();
        let deadline = tokio::time::Instant::now() + timeout;
        for s in stores {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !s.wait_synced(left).await && !s.is_failed() {
                return false;
            }
        }
        true
    }

    pub async fn status(&self) -> Vec<KindStatus> {
        let stores = self.stores.read().await;
        let mut out: Vec<KindStatus> = stores
            .values()
            .map(|s| KindStatus {
                kind: s.kind().to_string(),
                coordinate: s.info().coordinate.to_string(),
                status: s.status(),
                objects: s.current().len(),
            })
            .collect();
        out.sort_by(|a, b| a.kind.cmp(&b.kind));
        out
    }

    /// Abort every watch; ingest loops drain and exit once their senders drop.
    pub async fn shutdown(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut t) => std::mem::take(&mut *t),
            Err(_) => Vec::new(),
        };
        let n = tasks.len();
        for t in tasks {
            t.abort();
        }
        info!(watches = n, "fanout: shut down");
    }
}

impl Drop for WatchFanout {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for t in tasks.drain(..) {
                t.abort();
            }
        }
    }
}

async fn run_watch(cluster: Arc<dyn Cluster>, info: ApiResourceInfo, tx: mpsc::Sender<StoreDelta>, store: ResourceStore) {
    let kind = info.kind.clone();
    let mut stream = match cluster.watch(&info).await {
        Ok(s) => s,
        Err(e) => {
            counter!("kindex_watch_failures_total", 1);
            store.mark_failed(e.to_string());
            warn!(kind = %kind, error = %e, "watch: failed to establish; kind served live");
            return;
        }
    };
    let mut listed = false;
    while let Some(item) = stream.next().await {
        match item {
            Ok(ev) => {
                listed |= matches!(ev, kindex_core::WatchEvent::Restarted(_));
                let Some(d) = StoreDelta::from_event(ev) else { continue };
                if tx.send(d).await.is_err() {
                    return;
                }
            }
            Err(e) if !listed => {
                counter!("kindex_watch_failures_total", 1);
                store.mark_failed(e.to_string());
                warn!(kind = %kind, error = %e, "watch: initial list failed; kind served live");
                return;
            }
            Err(e) => {
                counter!("kindex_watch_failures_total", 1);
                warn!(kind = %kind, error = %e, "watch: stream error; reconnecting");
            }
        }
    }
    if !listed {
        counter!("kindex_watch_failures_total", 1);
        store.mark_failed("watch stream ended before initial list");
        warn!(kind = %kind, "watch: stream ended before initial list; kind served live");
        return;
    }
    warn!(kind = %kind, "watch: stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindex_core::mock::MockCluster;
    use serde_json::json;

    fn fanout(mock: Arc<MockCluster>, mode: CacheMode, filter: KindFilter) -> WatchFanout {
        let resolver = Arc::new(CoordinateResolver::new(mock));
        WatchFanout::new(resolver, mode, filter, 64)
    }

    #[test]
    fn filter_deny_wins_over_allow() {
        let f = KindFilter::new(vec!["Pod".into(), "Node".into()], vec!["Node".into()]);
        assert!(f.admits("Pod"));
        assert!(!f.admits("Node"));
        assert!(!f.admits("Deployment"));
        assert!(KindFilter::default().admits("Anything"));
    }

    #[tokio::test]
    async fn eager_start_skips_kinds_without_list_watch() {
        let mock = Arc::new(MockCluster::standard());
        let f = fanout(mock.clone(), CacheMode::Eager, KindFilter::default());
        let n = f.start().await.unwrap();
        assert!(n > 0);
        assert!(f.store("Binding").await.is_none());
        assert!(f.store("Pod").await.is_some());
        assert_eq!(mock.discovery_calls(), 1);
        f.shutdown().await;
    }

    #[tokio::test]
    async fn duplicated_kind_is_mirrored_once_from_core() {
        let mock = Arc::new(MockCluster::standard());
        let f = fanout(mock, CacheMode::Eager, KindFilter::default());
        f.start().await.unwrap();
        let ev = f.store("Event").await.unwrap();
        assert_eq!(ev.info().coordinate.group, "");
        f.shutdown().await;
    }

    #[tokio::test]
    async fn filter_bounds_the_fanout() {
        let mock = Arc::new(MockCluster::standard());
        let f = fanout(mock, CacheMode::Eager, KindFilter::new(vec!["Pod".into()], vec![]));
        assert_eq!(f.start().await.unwrap(), 1);
        let st = f.status().await;
        assert_eq!(st.len(), 1);
        assert_eq!(st[0].kind, "Pod");
        f.shutdown().await;
    }

    #[tokio::test]
    async fn failed_watch_does_not_block_others() {
        let mock = Arc::new(MockCluster::standard());
        mock.fail_watch("Deployment");
        mock.insert("Pod", json!({"metadata": {"name": "web-0", "namespace": "demo"}}));
        let f = fanout(mock, CacheMode::Eager, KindFilter::default());
        f.start().await.unwrap();
        assert!(f.all_synchronized(Duration::from_secs(5)).await);
        let dep = f.store("Deployment").await.unwrap();
        assert!(dep.is_failed());
        let pods = f.store("Pod").await.unwrap();
        assert!(pods.is_synced());
        assert_eq!(pods.current().len(), 1);
        f.shutdown().await;
    }

    #[tokio::test]
    async fn lazy_mode_creates_store_on_first_use() {
        let mock = Arc::new(MockCluster::standard());
        let f = fanout(mock.clone(), CacheMode::Lazy, KindFilter::default());
        assert_eq!(f.start().await.unwrap(), 0);
        assert!(f.status().await.is_empty());
        let info = mock.resource("Pod").cloned().unwrap();
        let s = f.store_for(&info).await.unwrap();
        assert!(s.wait_synced(Duration::from_secs(2)).await);
        let binding = mock.resource("Binding").cloned().unwrap();
        assert!(f.store_for(&binding).await.is_none());
        f.shutdown().await;
    }

    #[tokio::test]
    async fn off_mode_never_creates_stores() {
        let mock = Arc::new(MockCluster::standard());
        let f = fanout(mock.clone(), CacheMode::Off, KindFilter::default());
        f.start().await.unwrap();
        let info = mock.resource("Pod").cloned().unwrap();
        assert!(f.store_for(&info).await.is_none());
        assert!(f.all_synchronized(Duration::from_millis(10)).await);
    }
}
