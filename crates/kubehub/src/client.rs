//! Connection bootstrap.
//!
//! Sources are tried in order: inline kubeconfig (`KUBECONFIG_DATA`), an
//! explicit server + bearer token (`KUBERNETES_SERVER`/`KUBERNETES_TOKEN`),
//! the in-cluster service account, then a kubeconfig file (explicit path,
//! `KUBECONFIG`, `~/.kube/config`).

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use serde_json::json;
use tracing::{debug, info};

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    matches!(env_nonempty(key).as_deref().map(str::to_ascii_lowercase).as_deref(), Some("1" | "true" | "yes"))
}

/// Single-context kubeconfig for a bearer token against `server`.
pub fn token_kubeconfig(server: &str, token: &str, insecure: bool, ca_data: Option<&str>) -> Result<Kubeconfig> {
    let mut cluster = json!({ "server": server });
    if insecure {
        cluster["insecure-skip-tls-verify"] = json!(true);
    }
    if let Some(ca) = ca_data {
        cluster["certificate-authority-data"] = json!(ca);
    }
    let doc = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "kindex", "cluster": cluster }],
        "users": [{ "name": "kindex", "user": { "token": token } }],
        "contexts": [{ "name": "kindex", "context": { "cluster": "kindex", "user": "kindex" } }],
        "current-context": "kindex",
    });
    serde_json::from_value(doc).context("building token kubeconfig")
}

/// CA bundle for the token path, base64 encoded: `KUBERNETES_CA_CERT` holds
/// PEM or base64, `KUBERNETES_CA_CERT_PATH` points at a PEM file.
fn token_ca_data() -> Result<Option<String>> {
    if let Some(ca) = env_nonempty("KUBERNETES_CA_CERT") {
        let ca = ca.trim();
        if ca.starts_with("-----BEGIN") {
            return Ok(Some(base64::engine::general_purpose::STANDARD.encode(ca)));
        }
        return Ok(Some(ca.to_string()));
    }
    if let Some(path) = env_nonempty("KUBERNETES_CA_CERT_PATH") {
        let pem = std::fs::read(&path).with_context(|| format!("reading CA certificate {}", path))?;
        return Ok(Some(base64::engine::general_purpose::STANDARD.encode(pem)));
    }
    Ok(None)
}

fn kubeconfig_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    if let Some(list) = env_nonempty("KUBECONFIG") {
        let sep = if cfg!(windows) { ';' } else { ':' };
        if let Some(first) = list.split(sep).find(|p| !p.is_empty()) {
            return Some(PathBuf::from(first));
        }
    }
    home::home_dir().map(|h| h.join(".kube").join("config"))
}

/// Resolve client configuration from the environment.
pub async fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let opts = KubeConfigOptions::default();

    if let Some(data) = env_nonempty("KUBECONFIG_DATA") {
        let kc = Kubeconfig::from_yaml(&data).context("parsing KUBECONFIG_DATA")?;
        info!(source = "KUBECONFIG_DATA", "kube config loaded");
        return Config::from_custom_kubeconfig(kc, &opts).await.context("loading KUBECONFIG_DATA");
    }

    if let Some(server) = env_nonempty("KUBERNETES_SERVER") {
        let token = env_nonempty("KUBERNETES_TOKEN")
            .ok_or_else(|| anyhow!("KUBERNETES_TOKEN environment variable is required when KUBERNETES_SERVER is set"))?;
        let insecure = env_flag("KUBERNETES_INSECURE");
        let kc = token_kubeconfig(&server, &token, insecure, token_ca_data()?.as_deref())?;
        info!(source = "KUBERNETES_SERVER", server = %server, insecure, "kube config loaded");
        return Config::from_custom_kubeconfig(kc, &opts).await.context("loading token config");
    }

    match Config::incluster() {
        Ok(cfg) => {
            info!(source = "in-cluster", "kube config loaded");
            return Ok(cfg);
        }
        Err(e) => debug!(error = %e, "not running in-cluster"),
    }

    let path = kubeconfig_path(explicit).ok_or_else(|| anyhow!("no kubeconfig found: set KUBECONFIG or create ~/.kube/config"))?;
    let kc = Kubeconfig::read_from(&path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
    info!(source = %path.display(), "kube config loaded");
    Config::from_custom_kubeconfig(kc, &opts).await.with_context(|| format!("loading kubeconfig {}", path.display()))
}

pub async fn connect(explicit: Option<&Path>) -> Result<Client> {
    let cfg = load_config(explicit).await?;
    Client::try_from(cfg).context("building kube client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_kubeconfig_has_single_context() {
        let kc = token_kubeconfig("https://10.0.0.1:6443", "abc", true, None).unwrap();
        assert_eq!(kc.current_context.as_deref(), Some("kindex"));
        assert_eq!(kc.clusters.len(), 1);
        assert_eq!(kc.auth_infos.len(), 1);
        assert_eq!(kc.contexts.len(), 1);
    }

    #[test]
    fn explicit_kubeconfig_path_wins() {
        let p = kubeconfig_path(Some(Path::new("/tmp/kc.yaml")));
        assert_eq!(p, Some(PathBuf::from("/tmp/kc.yaml")));
    }
}
