//! Configuration management for the pages gateway

use crate::error::{PagesError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level gateway configuration, loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to (default: 0.0.0.0:8080)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Base DNS suffix under which owners get an automatic subdomain
    /// (`<owner>.<base_domain>`). Required.
    pub base_domain: String,

    /// Public scheme used when building redirect targets ("http" or "https",
    /// default: "https")
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Git hosting backend settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Cache sizing and TTL settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Concurrency bounds and timeouts
    #[serde(default)]
    pub limits: LimitConfig,

    /// Global parameters handed to filter types at startup, keyed by filter
    /// type name (e.g. `redirect: {scheme: http}`)
    #[serde(default)]
    pub filters: HashMap<String, serde_json::Value>,
}

/// Which git host the gateway reads sites from. Exactly one of `gitea` /
/// `local` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Name of the pages branch served for every repository (default: gh-pages)
    #[serde(default = "default_branch")]
    pub branch: String,

    #[serde(default)]
    pub gitea: Option<GiteaConfig>,

    #[serde(default)]
    pub local: Option<LocalConfig>,
}

/// Gitea-style REST backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GiteaConfig {
    /// Base URL of the Gitea server, e.g. `https://git.example.com`
    pub server: String,

    /// API token; sent as `Authorization: token <...>`
    #[serde(default)]
    pub token: String,
}

/// Local filesystem backend for tests and single-site deployments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory holding `<owner>/<repo>/<branch>/...` trees
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Site metadata refresh interval in seconds (default: 60).
    /// Zero disables metadata caching: every request recompiles.
    #[serde(default = "default_meta_ttl")]
    pub meta_ttl: u64,

    /// Blob cache entry TTL in seconds (default: 3600)
    #[serde(default = "default_blob_ttl")]
    pub blob_ttl: u64,

    /// Largest blob cached in memory, in bytes; bigger files stream through
    /// (default: 1MB)
    #[serde(default = "default_blob_limit")]
    pub blob_limit: u64,

    /// Total in-memory blob cache capacity in bytes (default: 256MB)
    #[serde(default = "default_blob_capacity")]
    pub blob_capacity: usize,

    /// Optional path the in-memory KV snapshots to on shutdown
    #[serde(default)]
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Concurrent backend fetches (default: 64)
    #[serde(default = "default_backend_concurrency")]
    pub backend_concurrency: usize,

    /// Concurrent blob cache writers (default: 16)
    #[serde(default = "default_cache_concurrency")]
    pub cache_concurrency: usize,

    /// Concurrent background metadata refreshes (default: 16)
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,

    /// Per-execution deadline for script filters in seconds (default: 60)
    #[serde(default = "default_script_timeout")]
    pub script_timeout: u64,
}

// Default value functions for serde
fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_branch() -> String {
    "gh-pages".to_string()
}

fn default_meta_ttl() -> u64 {
    60
}

fn default_blob_ttl() -> u64 {
    3600
}

fn default_blob_limit() -> u64 {
    1024 * 1024 // 1MB
}

fn default_blob_capacity() -> usize {
    256 * 1024 * 1024 // 256MB
}

fn default_backend_concurrency() -> usize {
    64
}

fn default_cache_concurrency() -> usize {
    16
}

fn default_refresh_concurrency() -> usize {
    16
}

fn default_script_timeout() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            meta_ttl: default_meta_ttl(),
            blob_ttl: default_blob_ttl(),
            blob_limit: default_blob_limit(),
            blob_capacity: default_blob_capacity(),
            snapshot: None,
        }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        LimitConfig {
            backend_concurrency: default_backend_concurrency(),
            cache_concurrency: default_cache_concurrency(),
            refresh_concurrency: default_refresh_concurrency(),
            script_timeout: default_script_timeout(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| PagesError::Config(format!("failed to read config file: {}", e)))?;

        let config: ServerConfig = serde_yaml::from_str(&content)
            .map_err(|e| PagesError::Config(format!("failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Rules:
    /// - `base_domain` must be a bare domain name (no scheme, port or slash)
    /// - `scheme` must be `http` or `https`
    /// - exactly one backend must be configured
    /// - concurrency bounds must be greater than zero
    pub fn validate(&self) -> Result<()> {
        if self.base_domain.is_empty() {
            return Err(PagesError::Config("base_domain must not be empty".into()));
        }
        if self.base_domain.contains(&['/', ':', ' '][..]) {
            return Err(PagesError::Config(format!(
                "base_domain must be a bare domain name, got {:?}",
                self.base_domain
            )));
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(PagesError::Config(format!(
                "scheme must be 'http' or 'https', got {:?}",
                self.scheme
            )));
        }
        match (&self.backend.gitea, &self.backend.local) {
            (Some(_), Some(_)) => {
                return Err(PagesError::Config(
                    "backend.gitea and backend.local are mutually exclusive".into(),
                ))
            }
            (None, None) => {
                return Err(PagesError::Config(
                    "one of backend.gitea or backend.local is required".into(),
                ))
            }
            _ => {}
        }
        if self.backend.branch.is_empty() {
            return Err(PagesError::Config("backend.branch must not be empty".into()));
        }
        if self.limits.backend_concurrency == 0 {
            return Err(PagesError::Config(
                "limits.backend_concurrency must be greater than 0".into(),
            ));
        }
        if self.limits.cache_concurrency == 0 {
            return Err(PagesError::Config(
                "limits.cache_concurrency must be greater than 0".into(),
            ));
        }
        if self.limits.refresh_concurrency == 0 {
            return Err(PagesError::Config(
                "limits.refresh_concurrency must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn meta_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.meta_ttl)
    }

    pub fn blob_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.blob_ttl)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.script_timeout)
    }
}
