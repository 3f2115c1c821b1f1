//! Error taxonomy surfaced to callers, plus the raw upstream error returned
//! by the cluster collaborator.

use serde::{Deserialize, Serialize};

/// Failure reported by the cluster collaborator. Mirrors the API server's
/// status response (`code`/`reason`/`message`); `code` is `None` for
/// transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub code: Option<u16>,
    pub reason: String,
    pub message: String,
}

impl UpstreamError {
    pub fn new(code: Option<u16>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code, reason: reason.into(), message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Some(404), "NotFound", message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Some(409), "AlreadyExists", message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(None, "", message)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == Some(404)
    }

    pub fn is_already_exists(&self) -> bool {
        self.code == Some(409) && self.reason == "AlreadyExists"
    }
}

fn scope(namespace: &Option<String>) -> String {
    match namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!(" in namespace {}", ns),
        _ => String::new(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KindexError {
    #[error("kind {kind:?} is not served by the cluster")]
    KindNotFound { kind: String },
    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(#[source] UpstreamError),
    #[error("{kind} {name:?} not found{}", scope(.namespace))]
    ResourceNotFound { kind: String, name: String, namespace: Option<String> },
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("{operation} is not supported for kind {kind}")]
    UnsupportedKind { kind: String, operation: &'static str },
    #[error("{operation} {kind} {name:?}{} failed: {source}", scope(.namespace))]
    Upstream {
        operation: &'static str,
        kind: String,
        name: String,
        namespace: Option<String>,
        #[source]
        source: UpstreamError,
    },
    #[error("{operation} cancelled: {reason}")]
    Cancelled { operation: String, reason: String },
}

pub type KindexResult<T> = Result<T, KindexError>;

impl KindexError {
    /// Stable tag for transport layers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::KindNotFound { .. } => "KindNotFound",
            Self::DiscoveryUnavailable(_) => "DiscoveryUnavailable",
            Self::ResourceNotFound { .. } => "ResourceNotFound",
            Self::InvalidManifest(_) => "InvalidManifest",
            Self::UnsupportedKind { .. } => "UnsupportedKind",
            Self::Upstream { .. } => "UpstreamError",
            Self::Cancelled { .. } => "Cancelled",
        }
    }

    /// Wrap a collaborator failure with call context; a 404 becomes `ResourceNotFound`.
    pub fn upstream(
        operation: &'static str,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        source: UpstreamError,
    ) -> Self {
        let namespace = namespace.filter(|ns| !ns.is_empty()).map(str::to_string);
        if source.is_not_found() && !name.is_empty() {
            return Self::ResourceNotFound { kind: kind.to_string(), name: name.to_string(), namespace };
        }
        Self::Upstream { operation, kind: kind.to_string(), name: name.to_string(), namespace, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_mapped_to_resource_not_found() {
        let e = KindexError::upstream("get", "Pod", "missing-pod", Some("demo"), UpstreamError::not_found("pods \"missing-pod\" not found"));
        assert_eq!(e.code(), "ResourceNotFound");
        assert_eq!(e.to_string(), "Pod \"missing-pod\" not found in namespace demo");
    }

    #[test]
    fn other_failures_keep_context() {
        let src = UpstreamError::new(Some(403), "Forbidden", "pods is forbidden");
        let e = KindexError::upstream("delete", "Pod", "web", None, src);
        assert_eq!(e.code(), "UpstreamError");
        let msg = e.to_string();
        assert!(msg.contains("delete Pod \"web\""), "{}", msg);
        assert!(msg.contains("forbidden"), "{}", msg);
    }

    #[test]
    fn already_exists_needs_reason() {
        assert!(UpstreamError::already_exists("x").is_already_exists());
        assert!(!UpstreamError::new(Some(409), "Conflict", "x").is_already_exists());
    }
}
