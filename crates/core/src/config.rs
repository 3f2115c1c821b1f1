//! Runtime configuration, read from `KINDEX_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the local mirror is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Every read goes to the live API.
    Off,
    /// A kind's store is created on its first read.
    Lazy,
    /// Every list+watch capable kind is mirrored at startup.
    #[default]
    Eager,
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "lazy" => Ok(Self::Lazy),
            "eager" | "all" => Ok(Self::Eager),
            other => Err(format!("unknown cache mode {:?} (expected off, lazy or eager)", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindexConfig {
    pub kubeconfig: Option<PathBuf>,
    pub cache_mode: CacheMode,
    /// When non-empty only these kinds are mirrored.
    pub kind_allow: Vec<String>,
    pub kind_deny: Vec<String>,
    pub queue_cap: usize,
    pub sync_timeout: Duration,
    pub max_log_lines: i64,
    pub max_manifest_bytes: usize,
    pub max_manifest_nodes: usize,
}

impl Default for KindexConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            cache_mode: CacheMode::Eager,
            kind_allow: Vec::new(),
            kind_deny: Vec::new(),
            queue_cap: 2048,
            sync_timeout: Duration::from_secs(30),
            max_log_lines: 300,
            max_manifest_bytes: 1_000_000, // 1 MiB
            max_manifest_nodes: 100_000,
        }
    }
}

impl KindexConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            kubeconfig: std::env::var("KINDEX_KUBECONFIG").ok().filter(|s| !s.is_empty()).map(PathBuf::from),
            cache_mode: env_parse("KINDEX_CACHE_MODE").unwrap_or(d.cache_mode),
            kind_allow: std::env::var("KINDEX_KIND_ALLOW").map(|s| split_list(&s)).unwrap_or_default(),
            kind_deny: std::env::var("KINDEX_KIND_DENY").map(|s| split_list(&s)).unwrap_or_default(),
            queue_cap: env_parse("KINDEX_QUEUE_CAP").unwrap_or(d.queue_cap),
            sync_timeout: env_parse::<u64>("KINDEX_SYNC_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.sync_timeout),
            max_log_lines: env_parse("KINDEX_MAX_LOG_LINES").unwrap_or(d.max_log_lines),
            max_manifest_bytes: env_parse("KINDEX_MAX_MANIFEST_BYTES").unwrap_or(d.max_manifest_bytes),
            max_manifest_nodes: env_parse("KINDEX_MAX_MANIFEST_NODES").unwrap_or(d.max_manifest_nodes),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}

/// Comma separated list, blanks dropped.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_mode_parses_aliases() {
        assert_eq!("OFF".parse::<CacheMode>(), Ok(CacheMode::Off));
        assert_eq!(" lazy ".parse::<CacheMode>(), Ok(CacheMode::Lazy));
        assert_eq!("all".parse::<CacheMode>(), Ok(CacheMode::Eager));
        assert!("sometimes".parse::<CacheMode>().is_err());
    }

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(split_list("Pod, Deployment,,  "), vec!["Pod".to_string(), "Deployment".to_string()]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn defaults_match_documented_limits() {
        let c = KindexConfig::default();
        assert_eq!(c.max_log_lines, 300);
        assert_eq!(c.queue_cap, 2048);
        assert_eq!(c.cache_mode, CacheMode::Eager);
    }
}
