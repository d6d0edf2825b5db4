//! Site metadata engine
//!
//! Compiles a repository at a commit into a [`SiteMeta`]: the alias list, the
//! filter chain and the commit info. Compiled metadata is cached in the KV
//! store, protected by a per-key single-flight lock, and refreshed in the
//! background once its refresh deadline passes so requests keep being served
//! from the stale copy instead of stalling on the backend.

use crate::alias::AliasRegistry;
use crate::error::{PagesError, Result};
use crate::filter::{Filter, Params};
use crate::glob_cache;
use crate::kv::Kv;
use crate::locker::Locker;
use crate::provider_cache::CachedBackend;
use crate::vfs::PageVfs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The compiled, cacheable description of one site at one commit.
///
/// Replaced wholesale on recompilation, never mutated in place; a request
/// already holding an instance keeps serving from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteMeta {
    pub commit_id: String,
    pub last_modified: DateTime<Utc>,
    /// false means "no site here"; cached as a negative entry
    pub is_page: bool,
    /// Non-empty only when compilation failed; surfaced as HTTP 500
    #[serde(default)]
    pub error_msg: String,
    /// Validated external hostnames
    #[serde(default)]
    pub alias: Vec<String>,
    /// Filter declarations in call order, outermost first. The tail is always
    /// the implicit tier: block `.git/**`, block `.pages.yaml`, the 404-page
    /// handler and the static file server.
    #[serde(default)]
    pub filters: Vec<Filter>,
    /// When a background recompilation becomes due
    #[serde(default)]
    pub refresh_at: Option<DateTime<Utc>>,
}

impl SiteMeta {
    fn stale(&self, now: DateTime<Utc>) -> bool {
        self.refresh_at.is_some_and(|at| at <= now)
    }
}

/// Reject anything that is not a plain lowercase hostname: the final label is
/// 2-7 alphanumerics, every other label is up to 61 characters of
/// `[a-z0-9-]` without leading or trailing hyphens, and a single `*`
/// wildcard is allowed as the leftmost label only.
pub fn validate_hostname(name: &str) -> bool {
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let tld = labels[labels.len() - 1];
    if !(2..=7).contains(&tld.len())
        || !tld
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    {
        return false;
    }
    for (i, label) in labels[..labels.len() - 1].iter().enumerate() {
        if *label == "*" {
            if i != 0 {
                return false;
            }
            continue;
        }
        if label.is_empty() || label.len() > 61 {
            return false;
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
    }
    true
}

/// `.pages.yaml` as committed at the repository root.
#[derive(Debug, Deserialize)]
struct SiteConfig {
    #[serde(default)]
    alias: Vec<String>,
    #[serde(default)]
    routes: Vec<RawRoute>,
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    /// Comma-separated glob patterns
    path: String,
    /// Exactly one additional key: the filter type with its params
    #[serde(flatten)]
    filter: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Clone)]
pub struct MetaEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    backend: Arc<CachedBackend>,
    cache: Arc<dyn Kv>,
    alias: AliasRegistry,
    locker: Locker,
    refresh_gate: Arc<Semaphore>,
    base_domain: String,
    ttl: Duration,
}

impl MetaEngine {
    /// `cache` should already be scoped to the metadata namespace (`meta` in
    /// the default layout). A zero `ttl` disables caching: every lookup
    /// recompiles synchronously, which is what tests and tiny deployments
    /// want.
    pub fn new(
        backend: Arc<CachedBackend>,
        cache: Arc<dyn Kv>,
        alias: AliasRegistry,
        base_domain: &str,
        ttl: Duration,
        refresh_concurrency: usize,
    ) -> Self {
        MetaEngine {
            inner: Arc::new(EngineInner {
                backend,
                cache,
                alias,
                locker: Locker::new(),
                refresh_gate: Arc::new(Semaphore::new(refresh_concurrency.max(1))),
                base_domain: base_domain.to_ascii_lowercase(),
                ttl,
            }),
        }
    }

    /// Look up (or compile) the site description for `(owner, repo)`.
    ///
    /// A cached negative entry returns NotFound; a cached compile failure
    /// returns the recorded Validation error. Entries past their refresh
    /// deadline are returned as-is while a background refresh is attempted.
    pub async fn get_meta(&self, owner: &str, repo: &str) -> Result<SiteMeta> {
        let key = format!("{}/{}", owner, repo);

        if let Some(found) = self.load_cached(&key).await {
            if found.stale(Utc::now()) && !self.inner.ttl.is_zero() {
                self.spawn_refresh(owner, repo);
                return Self::into_result(found);
            }
            if !found.stale(Utc::now()) {
                return Self::into_result(found);
            }
            // Zero TTL: fall through and recompile synchronously.
        }

        let lock = self.inner.locker.open(&key);
        let _guard = lock.lock().await;
        if let Some(found) = self.load_cached(&key).await {
            if !found.stale(Utc::now()) || !self.inner.ttl.is_zero() {
                return Self::into_result(found);
            }
        }
        let compiled = self.compile(owner, repo).await?;
        Self::into_result(compiled)
    }

    fn into_result(meta: SiteMeta) -> Result<SiteMeta> {
        if meta.is_page {
            return Ok(meta);
        }
        if meta.error_msg.is_empty() {
            Err(PagesError::NotFound)
        } else {
            Err(PagesError::Validation(meta.error_msg))
        }
    }

    async fn load_cached(&self, key: &str) -> Option<SiteMeta> {
        match self.inner.cache.get(key).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    warn!(key, error = %e, "discarding corrupt site metadata");
                    None
                }
            },
            Err(_) => None,
        }
    }

    fn spawn_refresh(&self, owner: &str, repo: &str) {
        let Ok(permit) = self.inner.refresh_gate.clone().try_acquire_owned() else {
            return;
        };
        let engine = self.clone();
        let owner = owner.to_string();
        let repo = repo.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            let key = format!("{}/{}", owner, repo);
            let lock = engine.inner.locker.open(&key);
            let Ok(_guard) = lock.try_lock() else {
                return;
            };
            // Another request may have refreshed while we queued.
            if let Some(found) = engine.load_cached(&key).await {
                if !found.stale(Utc::now()) {
                    return;
                }
            }
            if let Err(e) = engine.compile(&owner, &repo).await {
                debug!(owner = %owner, repo = %repo, error = %e, "background refresh failed");
            }
        });
    }

    /// Compile the repository at its current branch tip and store the result.
    /// Backend failures propagate without caching; everything else is cached,
    /// including negative and errored outcomes.
    async fn compile(&self, owner: &str, repo: &str) -> Result<SiteMeta> {
        let key = format!("{}/{}", owner, repo);
        let branch = match self.inner.backend.meta(owner, repo).await {
            Ok(branch) => branch,
            Err(PagesError::NotFound) => {
                let meta = SiteMeta {
                    commit_id: String::new(),
                    last_modified: Utc::now(),
                    is_page: false,
                    error_msg: String::new(),
                    alias: Vec::new(),
                    filters: Vec::new(),
                    refresh_at: Some(Utc::now() + self.inner.ttl),
                };
                self.store(&key, &meta).await;
                return Ok(meta);
            }
            Err(e) => return Err(e),
        };

        debug!(owner, repo, commit = %branch.id, "compiling site");
        let vfs = PageVfs::new(
            self.inner.backend.clone(),
            owner,
            repo,
            &branch.id,
            CancellationToken::new(),
        );
        let mut meta = SiteMeta {
            commit_id: branch.id.clone(),
            last_modified: branch.last_modified,
            is_page: false,
            error_msg: String::new(),
            alias: Vec::new(),
            filters: Vec::new(),
            refresh_at: Some(Utc::now() + self.inner.ttl),
        };

        if !vfs.exists("index.html").await? {
            self.store(&key, &meta).await;
            return Ok(meta);
        }
        meta.is_page = true;

        match self.parse_site_config(&vfs).await {
            Ok((alias, user_filters)) => {
                meta.filters = assemble_filters(user_filters, &alias);
                meta.alias = alias;
            }
            Err(PagesError::Validation(msg)) => {
                meta.is_page = false;
                meta.error_msg = msg;
                meta.filters = Vec::new();
                self.store(&key, &meta).await;
                return Ok(meta);
            }
            Err(e) => return Err(e),
        }

        self.inner.alias.bind(&meta.alias, owner, repo).await?;
        self.store(&key, &meta).await;
        Ok(meta)
    }

    /// Read `CNAME` and `.pages.yaml` at the pinned commit and produce the
    /// validated alias list plus the user filter declarations in source order.
    async fn parse_site_config(&self, vfs: &PageVfs) -> Result<(Vec<String>, Vec<Filter>)> {
        let mut alias: Vec<String> = Vec::new();

        match vfs.read_string("CNAME").await {
            Ok(raw) if !raw.trim().is_empty() => {
                alias.push(self.check_alias(raw.trim())?);
            }
            Ok(_) => {}
            Err(PagesError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let raw = match vfs.read_string(".pages.yaml").await {
            Ok(raw) => Some(raw),
            Err(PagesError::NotFound) => None,
            Err(e) => return Err(e),
        };

        let mut filters = Vec::new();
        if let Some(raw) = raw {
            let config: SiteConfig = serde_yaml::from_str(&raw)
                .map_err(|e| PagesError::validation(format!("parse .pages.yaml failed: {}", e)))?;

            for name in &config.alias {
                if name.trim().is_empty() {
                    continue;
                }
                let checked = self.check_alias(name)?;
                if !alias.contains(&checked) {
                    alias.push(checked);
                }
            }

            for route in config.routes {
                if route.filter.len() != 1 {
                    return Err(PagesError::validation(format!(
                        "route {:?} must declare exactly one filter",
                        route.path
                    )));
                }
                let (kind, value) = route.filter.into_iter().next().unwrap_or_default();
                let params = Params::from_yaml(value)?;
                for pattern in route.path.split(',') {
                    let pattern = pattern.trim();
                    if pattern.is_empty() {
                        continue;
                    }
                    glob_cache::compile(pattern)?;
                    filters.push(Filter::new(pattern, &kind, params.clone()));
                }
            }
        }

        Ok((alias, filters))
    }

    fn check_alias(&self, name: &str) -> Result<String> {
        let name = name.trim().to_ascii_lowercase();
        if !validate_hostname(&name) {
            return Err(PagesError::validation(format!("invalid alias {}", name)));
        }
        if name.ends_with(&self.inner.base_domain) {
            return Err(PagesError::validation(format!(
                "alias {} overlaps the base domain {}",
                name, self.inner.base_domain
            )));
        }
        Ok(name)
    }

    async fn store(&self, key: &str, meta: &SiteMeta) {
        // Positive entries get a stale window past the refresh deadline so
        // requests can keep being served while a refresh runs; negative and
        // errored entries must not outlive one TTL.
        let kv_ttl = if meta.is_page {
            self.inner.ttl * 2
        } else {
            self.inner.ttl
        };
        match serde_json::to_string(meta) {
            Ok(raw) => {
                if let Err(e) = self.inner.cache.put(key, &raw, Some(kv_ttl)).await {
                    warn!(key, error = %e, "failed to store site metadata");
                }
            }
            Err(e) => warn!(key, error = %e, "failed to serialize site metadata"),
        }
    }
}

/// Lay out the call-order filter list: the synthesized alias redirect is
/// outermost, then the user's routes in source order, then the implicit tier.
fn assemble_filters(user: Vec<Filter>, alias: &[String]) -> Vec<Filter> {
    let mut filters = Vec::with_capacity(user.len() + 5);
    if !alias.is_empty() {
        filters.push(Filter::new(
            "**",
            "redirect",
            Params::from_json(serde_json::json!({ "targets": alias })),
        ));
    }
    filters.extend(user);
    filters.push(Filter::new(".git/**", "block", Params::new()));
    filters.push(Filter::new(".pages.yaml", "block", Params::new()));
    filters.push(Filter::new("**", "default_not_found", Params::new()));
    filters.push(Filter::new("**", "direct", Params::new()));
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_validation() {
        assert!(validate_hostname("a.com"));
        assert!(validate_hostname("sub.a.com"));
        assert!(validate_hostname("a.b.c.d.com"));
        assert!(validate_hostname("*.a.com"));
        assert!(validate_hostname("www-1.example.org"));

        assert!(!validate_hostname("invalid_name.com"));
        assert!(!validate_hostname("-start.com"));
        assert!(!validate_hostname("end-.com"));
        assert!(!validate_hostname("bare"));
        assert!(!validate_hostname("a..com"));
        assert!(!validate_hostname("a.*.com"));
        assert!(!validate_hostname("a.toolongtld"));
        assert!(!validate_hostname("a.c"));
    }

    #[test]
    fn test_assemble_filters_without_alias() {
        let filters = assemble_filters(vec![], &[]);
        let kinds: Vec<&str> = filters.iter().map(|f| f.kind.as_str()).collect();
        assert_eq!(kinds, vec!["block", "block", "default_not_found", "direct"]);
        assert_eq!(filters[0].path, ".git/**");
        assert_eq!(filters[1].path, ".pages.yaml");
    }

    #[test]
    fn test_assemble_filters_orders_user_routes_first() {
        let user = vec![
            Filter::new("a/**", "block", Params::new()),
            Filter::new("b/**", "failback", Params::new()),
        ];
        let filters = assemble_filters(user, &["www.other.org".to_string()]);
        let kinds: Vec<&str> = filters.iter().map(|f| f.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["redirect", "block", "failback", "block", "block", "default_not_found", "direct"]
        );
        // The synthesized redirect carries the alias list.
        assert_eq!(
            filters[0].params.0["targets"],
            serde_json::json!(["www.other.org"])
        );
    }

    #[test]
    fn test_stale_check() {
        let mut meta = SiteMeta {
            commit_id: "c".into(),
            last_modified: Utc::now(),
            is_page: true,
            error_msg: String::new(),
            alias: vec![],
            filters: vec![],
            refresh_at: None,
        };
        assert!(!meta.stale(Utc::now()));
        meta.refresh_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(meta.stale(Utc::now()));
        meta.refresh_at = Some(Utc::now() + chrono::Duration::seconds(60));
        assert!(!meta.stale(Utc::now()));
    }
}
