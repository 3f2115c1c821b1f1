//! Cache-first read path.
//!
//! A store answers only when it is synced. Selectors always go live since
//! the mirror does not evaluate selector grammar.

use std::sync::Arc;

use kindex_core::{ApiResourceInfo, KindexError, KindexResult, ObjectKey, ObjectSummary};
use kindex_kubehub::CoordinateResolver;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{ResourceStore, WatchFanout};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    pub items: Vec<ObjectSummary>,
    pub served_from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct ObjectList {
    pub items: Vec<Arc<Value>>,
    pub served_from_cache: bool,
}

fn nonempty(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct ReadPath {
    resolver: Arc<CoordinateResolver>,
    fanout: Arc<WatchFanout>,
}

impl ReadPath {
    pub fn new(resolver: Arc<CoordinateResolver>, fanout: Arc<WatchFanout>) -> Self {
        Self { resolver, fanout }
    }

    pub fn resolver(&self) -> &Arc<CoordinateResolver> {
        &self.resolver
    }

    pub fn fanout(&self) -> &Arc<WatchFanout> {
        &self.fanout
    }

    async fn synced_store(&self, info: &ApiResourceInfo) -> Option<ResourceStore> {
        self.fanout.store_for(info).await.filter(ResourceStore::is_synced)
    }

    /// Full object by name. Store first, live on store miss.
    pub async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> KindexResult<Value> {
        let info = self.resolver.resolve(kind).await?;
        let ns = info.object_namespace(namespace);
        if let Some(store) = self.synced_store(&info).await {
            if let Some(obj) = store.current().get(&ObjectKey::new(ns, name)) {
                counter!("kindex_store_hits_total", 1);
                return Ok((*obj).clone());
            }
        }
        counter!("kindex_store_misses_total", 1);
        counter!("kindex_live_reads_total", 1);
        debug!(kind = %kind, name = %name, namespace = ?ns, "read: live get");
        self.resolver
            .cluster()
            .get(&info, ns, name)
            .await
            .map_err(|e| KindexError::upstream("get", kind, name, ns, e))
    }

    /// Same as `get`; kept as its own operation for callers that want the
    /// whole body spelled out.
    pub async fn describe(&self, kind: &str, namespace: Option<&str>, name: &str) -> KindexResult<Value> {
        self.get(kind, namespace, name).await
    }

    /// Full objects. Empty namespace means all namespaces; order is unspecified.
    pub async fn list_objects(
        &self,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> KindexResult<ObjectList> {
        let info = self.resolver.resolve(kind).await?;
        let ns = if info.namespaced { nonempty(namespace) } else { None };
        let (labels, fields) = (nonempty(label_selector), nonempty(field_selector));
        if labels.is_none() && fields.is_none() {
            if let Some(store) = self.synced_store(&info).await {
                counter!("kindex_store_hits_total", 1);
                return Ok(ObjectList { items: store.current().list(ns), served_from_cache: true });
            }
            counter!("kindex_store_misses_total", 1);
        }
        counter!("kindex_live_reads_total", 1);
        debug!(kind = %kind, namespace = ?ns, labels = ?labels, fields = ?fields, "read: live list");
        let items = self
            .resolver
            .cluster()
            .list(&info, ns, labels, fields)
            .await
            .map_err(|e| KindexError::upstream("list", kind, "", ns, e))?;
        Ok(ObjectList { items: items.into_iter().map(Arc::new).collect(), served_from_cache: false })
    }

    /// Lightweight projection: name, kind, namespace and labels only.
    pub async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> KindexResult<ListResult> {
        let objs = self.list_objects(kind, namespace, label_selector, field_selector).await?;
        Ok(ListResult {
            items: objs.items.iter().map(|o| ObjectSummary::project(kind, o)).collect(),
            served_from_cache: objs.served_from_cache,
        })
    }
}
