//! The cluster collaborator: discovery, generic object access by coordinate,
//! watches, pod logs and usage metrics.

use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::{ApiResourceInfo, UpstreamError, WatchEvent};

pub type BoxWatchStream = BoxStream<'static, Result<WatchEvent, UpstreamError>>;
pub type BoxByteStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

/// Everything the dynamic access layer needs from a cluster connection.
///
/// `namespace` is ignored for cluster-scoped resources; for namespaced
/// resources `None` means "all namespaces" on list/watch.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Every served resource type (preferred version per group).
    async fn list_api_resources(&self) -> Result<Vec<ApiResourceInfo>, UpstreamError>;

    async fn get(&self, res: &ApiResourceInfo, namespace: Option<&str>, name: &str) -> Result<Value, UpstreamError>;

    async fn list(
        &self,
        res: &ApiResourceInfo,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<Value>, UpstreamError>;

    async fn create(&self, res: &ApiResourceInfo, namespace: Option<&str>, obj: &Value) -> Result<Value, UpstreamError>;

    /// JSON merge patch (RFC 7386).
    async fn patch_merge(
        &self,
        res: &ApiResourceInfo,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<Value, UpstreamError>;

    async fn delete(&self, res: &ApiResourceInfo, namespace: Option<&str>, name: &str) -> Result<(), UpstreamError>;

    /// Long-lived list+watch. The first item is a `Restarted` relist; the stream
    /// reconnects on its own and reports transient failures as `Err` items.
    async fn watch(&self, res: &ApiResourceInfo) -> Result<BoxWatchStream, UpstreamError>;

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        tail_lines: i64,
    ) -> Result<BoxByteStream, UpstreamError>;

    /// Raw `metrics.k8s.io` PodMetrics object.
    async fn pod_usage(&self, namespace: &str, pod: &str) -> Result<Value, UpstreamError>;

    /// Raw `metrics.k8s.io` NodeMetrics object.
    async fn node_usage(&self, node: &str) -> Result<Value, UpstreamError>;
}
