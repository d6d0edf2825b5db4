//! Alias registry: external hostnames bound to repositories
//!
//! Two logical tables inside one KV namespace:
//! - forward: `<hostname>` -> `{"owner": .., "repo": ..}`
//! - reverse: `<owner>/<repo>` -> `["host1", "host2"]`
//!
//! The reverse table exists so a rebind can diff away hostnames the site no
//! longer advertises. Rebinds racing on the same repository are linearized
//! with a put-if-absent / compare-and-swap loop on the reverse entry.

use crate::error::{PagesError, Result};
use crate::kv::Kv;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasTarget {
    pub owner: String,
    pub repo: String,
}

#[derive(Clone)]
pub struct AliasRegistry {
    kv: Arc<dyn Kv>,
}

impl AliasRegistry {
    /// `kv` should already be scoped to the alias namespace
    /// (`config/alias` in the default layout).
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        AliasRegistry { kv }
    }

    /// Resolve an external hostname to its bound repository.
    pub async fn query(&self, domain: &str) -> Result<AliasTarget> {
        let raw = self.kv.get(domain).await?;
        serde_json::from_str(&raw)
            .map_err(|e| PagesError::Cache(format!("corrupt alias entry for {}: {}", domain, e)))
    }

    /// Replace the alias set of `(owner, repo)` with `domains`.
    ///
    /// Atomic with respect to concurrent binds on the same repository: the
    /// reverse entry is claimed with put-if-absent or advanced with CAS, and
    /// the loser of a race retries against the fresh state. Forward entries
    /// for dropped hostnames are deleted, current ones upserted
    /// (last-writer-wins).
    pub async fn bind(&self, domains: &[String], owner: &str, repo: &str) -> Result<()> {
        let reverse_key = format!("{}/{}", owner, repo);
        let new_json = serde_json::to_string(&domains)?;

        let old_domains: Vec<String> = loop {
            if self.kv.put_if_absent(&reverse_key, &new_json, None).await? {
                break Vec::new();
            }
            let old_json = match self.kv.get(&reverse_key).await {
                Ok(raw) => raw,
                // Deleted between our put-if-absent and get; start over.
                Err(PagesError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let old: Vec<String> = serde_json::from_str(&old_json).unwrap_or_default();
            if self
                .kv
                .compare_and_swap(&reverse_key, &old_json, &new_json)
                .await?
            {
                break old;
            }
        };

        for domain in &old_domains {
            if !domains.contains(domain) {
                debug!(domain = %domain, owner, repo, "unbinding stale alias");
                self.kv.delete(domain).await?;
            }
        }

        let target = serde_json::to_string(&AliasTarget {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })?;
        for domain in domains {
            self.kv.put(domain, &target, None).await?;
        }
        Ok(())
    }

    /// Drop a single forward entry; returns whether it existed.
    pub async fn unbind(&self, domain: &str) -> Result<bool> {
        self.kv.delete(domain).await
    }
}
