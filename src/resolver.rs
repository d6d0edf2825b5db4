//! Host resolver: maps (host, path) onto a concrete site
//!
//! Hosts under the base domain resolve structurally
//! (`<owner>.<base>/<repo>/...`, falling back to the owner's default
//! repository named after the full host); any other host goes through the
//! alias registry.

use crate::alias::AliasRegistry;
use crate::error::{PagesError, Result};
use crate::meta::{MetaEngine, SiteMeta};
use std::sync::Arc;
use tracing::debug;

/// The resolution output: the compiled site plus the request path relative to
/// it, without a leading slash.
#[derive(Clone)]
pub struct SiteContext {
    pub meta: Arc<SiteMeta>,
    pub owner: String,
    pub repo: String,
    pub path: String,
}

/// Lowercase the host and strip a trailing `:port`.
pub fn normalize_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name.to_string()
        }
        _ => host,
    }
}

pub struct HostResolver {
    /// `.<base_domain>`, precomputed for suffix checks
    base_suffix: String,
    alias: AliasRegistry,
    meta: MetaEngine,
}

impl HostResolver {
    pub fn new(base_domain: &str, alias: AliasRegistry, meta: MetaEngine) -> Self {
        HostResolver {
            base_suffix: format!(".{}", base_domain.to_ascii_lowercase()),
            alias,
            meta,
        }
    }

    /// Resolve `(host, url_path)` to a site. NotFound means no site answers
    /// for this host; compile errors of an existing site propagate.
    pub async fn resolve(&self, host: &str, url_path: &str) -> Result<SiteContext> {
        let host = normalize_host(host);
        let trimmed = url_path.trim_start_matches('/');

        if !host.ends_with(&self.base_suffix) {
            let target = self.alias.query(&host).await.map_err(|e| {
                debug!(host = %host, "host is neither under the base domain nor aliased");
                match e {
                    PagesError::NotFound => PagesError::NotFound,
                    other => other,
                }
            })?;
            let meta = self.meta.get_meta(&target.owner, &target.repo).await?;
            return Ok(SiteContext {
                meta: Arc::new(meta),
                owner: target.owner,
                repo: target.repo,
                path: trimmed.to_string(),
            });
        }

        let owner = &host[..host.len() - self.base_suffix.len()];
        if owner.is_empty() {
            return Err(PagesError::NotFound);
        }
        let parts: Vec<&str> = trimmed.split('/').collect();

        if !parts[0].is_empty() {
            match self.meta.get_meta(owner, parts[0]).await {
                Ok(meta) => {
                    return Ok(SiteContext {
                        meta: Arc::new(meta),
                        owner: owner.to_string(),
                        repo: parts[0].to_string(),
                        path: parts[1..].join("/"),
                    });
                }
                // No such repo (or it is not a page): fall back to the
                // owner's default repository with the untouched path.
                Err(PagesError::NotFound) => {
                    debug!(owner, repo = parts[0], "falling back to default repository");
                }
                Err(e) => return Err(e),
            }
        }

        let meta = self.meta.get_meta(owner, &host).await?;
        Ok(SiteContext {
            meta: Arc::new(meta),
            owner: owner.to_string(),
            repo: host.clone(),
            path: trimmed.to_string(),
        })
    }
}
