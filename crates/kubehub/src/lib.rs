//! Kindex kubehub: kind → coordinate resolution over discovery, plus the
//! kube-rs wiring for the cluster collaborator.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use kindex_core::{ApiResourceInfo, Cluster, Coordinate, KindexError, KindexResult};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub mod client;
pub mod kube_cluster;

pub use client::connect;
pub use kube_cluster::KubeCluster;

/// Core group first, then groups alphabetically. Stable, so the per-group
/// order reported by discovery is kept and a kind served by several groups
/// always resolves to the same one.
pub fn order_resources(mut resources: Vec<ApiResourceInfo>) -> Vec<ApiResourceInfo> {
    resources.sort_by(|a, b| {
        let (ga, gb) = (&a.coordinate.group, &b.coordinate.group);
        (!ga.is_empty()).cmp(&!gb.is_empty()).then_with(|| ga.cmp(gb))
    });
    resources
}

/// One row of the api-resources listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceRow {
    pub name: String,
    pub singular_name: String,
    pub namespaced: bool,
    pub kind: String,
    pub group: String,
    pub version: String,
    pub verbs: Vec<String>,
}

impl From<&ApiResourceInfo> for ApiResourceRow {
    fn from(r: &ApiResourceInfo) -> Self {
        Self {
            name: r.coordinate.plural.clone(),
            singular_name: r.singular.clone(),
            namespaced: r.namespaced,
            kind: r.kind.clone(),
            group: r.coordinate.group.clone(),
            version: r.coordinate.version.clone(),
            verbs: r.verbs.clone(),
        }
    }
}

/// Kind name → resource coordinate, cached for the process lifetime.
///
/// Reads take the shared lock; a miss runs one discovery round-trip and
/// inserts under the exclusive lock. Entries are never evicted implicitly.
pub struct CoordinateResolver {
    cluster: Arc<dyn Cluster>,
    cache: RwLock<HashMap<String, ApiResourceInfo>>,
}

impl CoordinateResolver {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster, cache: RwLock::new(HashMap::new()) }
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    /// Full discovery listing in resolution order.
    pub async fn discover(&self) -> KindexResult<Vec<ApiResourceInfo>> {
        let t0 = Instant::now();
        counter!("kindex_discovery_calls_total", 1);
        let resources = self.cluster.list_api_resources().await.map_err(KindexError::DiscoveryUnavailable)?;
        debug!(count = resources.len(), took_ms = %t0.elapsed().as_millis(), "discovery: listed api resources");
        Ok(order_resources(resources))
    }

    /// Resolve a kind name (case-sensitive) to its coordinate.
    pub async fn resolve(&self, kind: &str) -> KindexResult<ApiResourceInfo> {
        if let Some(hit) = self.cache.read().await.get(kind) {
            return Ok(hit.clone());
        }
        let resources = self.discover().await?;
        let found = resources
            .into_iter()
            .find(|r| r.kind == kind)
            .ok_or_else(|| KindexError::KindNotFound { kind: kind.to_string() })?;
        let resolved = self.seed(found).await;
        info!(kind = %kind, coordinate = %resolved.coordinate, "resolver: cached coordinate");
        Ok(resolved)
    }

    /// Insert unless already present; returns the entry that won.
    pub async fn seed(&self, info: ApiResourceInfo) -> ApiResourceInfo {
        let mut cache = self.cache.write().await;
        cache.entry(info.kind.clone()).or_insert(info).clone()
    }

    /// Drop a cached coordinate so the next resolve rediscovers it.
    pub async fn invalidate(&self, kind: &str) -> bool {
        let removed = self.cache.write().await.remove(kind).is_some();
        if removed {
            info!(kind = %kind, "resolver: invalidated coordinate");
        }
        removed
    }

    pub async fn cached(&self, kind: &str) -> Option<Coordinate> {
        self.cache.read().await.get(kind).map(|r| r.coordinate.clone())
    }

    pub async fn cached_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.cache.read().await.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Discovery listing filtered by scope. The two flags are independent:
    /// namespaced rows are kept iff `include_namespaced`, cluster-scoped rows
    /// iff `include_cluster`.
    pub async fn api_resources(&self, include_namespaced: bool, include_cluster: bool) -> KindexResult<Vec<ApiResourceRow>> {
        let resources = self.discover().await?;
        Ok(resources
            .iter()
            .filter(|r| if r.namespaced { include_namespaced } else { include_cluster })
            .map(ApiResourceRow::from)
            .collect())
    }
}
