//! `Cluster` over a live API server via kube-rs dynamic objects.

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, ErrorResponse},
    discovery::{ApiCapabilities, Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use serde_json::Value;
use tracing::{debug, warn};

use kindex_core::{strip_managed_fields, ApiResourceInfo, BoxByteStream, BoxWatchStream, Cluster, Coordinate, UpstreamError, WatchEvent};

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, res: &ApiResourceInfo, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(res);
        match namespace.filter(|ns| res.namespaced && !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    async fn metrics_object(&self, namespace: Option<&str>, plural: &str, kind: &str, name: &str) -> Result<Value, UpstreamError> {
        let ar = ApiResource {
            group: "metrics.k8s.io".into(),
            version: "v1beta1".into(),
            api_version: "metrics.k8s.io/v1beta1".into(),
            kind: kind.into(),
            plural: plural.into(),
        };
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        let obj = api.get(name).await.map_err(upstream)?;
        to_value(&obj)
    }
}

fn api_resource(res: &ApiResourceInfo) -> ApiResource {
    let c = &res.coordinate;
    ApiResource {
        group: c.group.clone(),
        version: c.version.clone(),
        api_version: c.api_version(),
        kind: res.kind.clone(),
        plural: c.plural.clone(),
    }
}

fn from_response(ae: ErrorResponse) -> UpstreamError {
    UpstreamError::new(Some(ae.code), ae.reason, ae.message)
}

fn upstream(e: kube::Error) -> UpstreamError {
    match e {
        kube::Error::Api(ae) => from_response(ae),
        other => UpstreamError::transport(other.to_string()),
    }
}

fn watch_error(e: watcher::Error) -> UpstreamError {
    match e {
        watcher::Error::InitialListFailed(e) | watcher::Error::WatchStartFailed(e) | watcher::Error::WatchFailed(e) => upstream(e),
        watcher::Error::WatchError(ae) => from_response(ae),
        other => UpstreamError::transport(other.to_string()),
    }
}

/// kube's discovery drops `singularName`, so it is left empty rather than guessed.
fn resource_info(ar: &ApiResource, caps: &ApiCapabilities) -> ApiResourceInfo {
    ApiResourceInfo {
        coordinate: Coordinate::new(ar.group.clone(), ar.version.clone(), ar.plural.clone()),
        kind: ar.kind.clone(),
        singular: String::new(),
        namespaced: matches!(caps.scope, Scope::Namespaced),
        verbs: caps.operations.clone(),
    }
}

fn to_value(obj: &DynamicObject) -> Result<Value, UpstreamError> {
    let mut v = serde_json::to_value(obj).map_err(|e| UpstreamError::transport(format!("serializing object: {}", e)))?;
    strip_managed_fields(&mut v);
    Ok(v)
}

fn from_value(v: &Value) -> Result<DynamicObject, UpstreamError> {
    serde_json::from_value(v.clone()).map_err(|e| UpstreamError::new(Some(422), "Invalid", format!("object is not a valid resource: {}", e)))
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn list_api_resources(&self) -> Result<Vec<ApiResourceInfo>, UpstreamError> {
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(upstream)?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                out.push(resource_info(&ar, &caps));
            }
        }
        Ok(out)
    }

    async fn get(&self, res: &ApiResourceInfo, namespace: Option<&str>, name: &str) -> Result<Value, UpstreamError> {
        let obj = self.api(res, namespace).get(name).await.map_err(upstream)?;
        to_value(&obj)
    }

    async fn list(
        &self,
        res: &ApiResourceInfo,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<Value>, UpstreamError> {
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector.filter(|s| !s.is_empty()) {
            lp = lp.labels(sel);
        }
        if let Some(sel) = field_selector.filter(|s| !s.is_empty()) {
            lp = lp.fields(sel);
        }
        let list = self.api(res, namespace).list(&lp).await.map_err(upstream)?;
        list.items.iter().map(to_value).collect()
    }

    async fn create(&self, res: &ApiResourceInfo, namespace: Option<&str>, obj: &Value) -> Result<Value, UpstreamError> {
        let body = from_value(obj)?;
        let created = self.api(res, namespace).create(&PostParams::default(), &body).await.map_err(upstream)?;
        to_value(&created)
    }

    async fn patch_merge(
        &self,
        res: &ApiResourceInfo,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<Value, UpstreamError> {
        let patched = self
            .api(res, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(upstream)?;
        to_value(&patched)
    }

    async fn delete(&self, res: &ApiResourceInfo, namespace: Option<&str>, name: &str) -> Result<(), UpstreamError> {
        self.api(res, namespace).delete(name, &DeleteParams::default()).await.map_err(upstream)?;
        Ok(())
    }

    async fn watch(&self, res: &ApiResourceInfo) -> Result<BoxWatchStream, UpstreamError> {
        let api = self.api(res, None);
        let kind = res.kind.clone();
        debug!(kind = %kind, coordinate = %res.coordinate, "watch: opening");
        let stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map_err(watch_error)
            .map(|ev| match ev? {
                Event::Applied(o) => to_value(&o).map(WatchEvent::Applied),
                Event::Deleted(o) => to_value(&o).map(WatchEvent::Deleted),
                Event::Restarted(list) => list.iter().map(to_value).collect::<Result<Vec<_>, _>>().map(WatchEvent::Restarted),
            });
        Ok(stream.boxed())
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        tail_lines: i64,
    ) -> Result<BoxByteStream, UpstreamError> {
        use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = LogParams {
            container: container.map(str::to_string),
            tail_lines: Some(tail_lines),
            follow: false,
            ..LogParams::default()
        };
        let reader = api.log_stream(pod, &lp).await.map_err(|e| {
            warn!(pod = %pod, container = ?container, error = %e, "log_stream failed to open");
            upstream(e)
        })?;
        // futures AsyncRead -> tokio AsyncRead -> bytes stream
        let stream = ReaderStream::new(reader.compat()).map_err(|e| UpstreamError::transport(format!("reading log stream: {}", e)));
        Ok(stream.boxed())
    }

    async fn pod_usage(&self, namespace: &str, pod: &str) -> Result<Value, UpstreamError> {
        self.metrics_object(Some(namespace), "pods", "PodMetrics", pod).await
    }

    async fn node_usage(&self, node: &str) -> Result<Value, UpstreamError> {
        self.metrics_object(None, "nodes", "NodeMetrics", node).await
    }
}
