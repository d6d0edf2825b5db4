//! Generic TTL key-value store
//!
//! The gateway keeps all durable-ish state (site metadata, alias bindings,
//! script-filter namespaces) behind this trait so deployments can plug in a
//! shared store. The crate ships the in-memory implementation; networked
//! stores are external collaborators.

use crate::error::{PagesError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

/// One page of keys from a cursor listing.
#[derive(Debug, Clone)]
pub struct KvPage {
    pub keys: Vec<String>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// TTL string store. `ttl = None` means the entry never expires.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<String>;
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Remove a key; returns whether it was present.
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Insert only when the key is absent; returns whether the write happened.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;
    /// Replace `old` with `new` atomically; returns whether the swap happened.
    async fn compare_and_swap(&self, key: &str, old: &str, new: &str) -> Result<bool>;
    /// Cursor-paged key listing in lexicographic order.
    async fn list(&self, limit: usize, cursor: Option<&str>) -> Result<KvPage>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A view of `inner` whose keys live under `namespace.join("/")`.
pub fn scoped(inner: Arc<dyn Kv>, namespace: &[&str]) -> Arc<dyn Kv> {
    Arc::new(ScopedKv {
        inner,
        prefix: format!("{}/", namespace.join("/")),
    })
}

struct ScopedKv {
    inner: Arc<dyn Kv>,
    prefix: String,
}

impl ScopedKv {
    fn full(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl Kv for ScopedKv {
    async fn get(&self, key: &str) -> Result<String> {
        self.inner.get(&self.full(key)).await
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.inner.put(&self.full(key), value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(&self.full(key)).await
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.inner.put_if_absent(&self.full(key), value, ttl).await
    }

    async fn compare_and_swap(&self, key: &str, old: &str, new: &str) -> Result<bool> {
        self.inner.compare_and_swap(&self.full(key), old, new).await
    }

    async fn list(&self, limit: usize, cursor: Option<&str>) -> Result<KvPage> {
        // Walk the parent listing and keep only keys under this prefix. The
        // continuation cursor stays in this view's key space.
        let mut keys = Vec::new();
        let mut cursor = cursor.map(|c| self.full(c));
        loop {
            let page = self.inner.list(limit, cursor.as_deref()).await?;
            let mut truncated = false;
            for key in &page.keys {
                if let Some(stripped) = key.strip_prefix(&self.prefix) {
                    if keys.len() < limit {
                        keys.push(stripped.to_string());
                    } else {
                        truncated = true;
                    }
                }
            }
            if keys.len() >= limit || !page.has_more {
                let next_cursor = keys.last().cloned();
                return Ok(KvPage {
                    keys,
                    next_cursor,
                    has_more: truncated || page.has_more,
                });
            }
            cursor = page.next_cursor;
        }
    }
}

#[derive(Clone)]
struct Entry {
    value: String,
    deadline: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// In-memory store backed by a sorted map, with an optional JSON snapshot
/// written on close. Only entries without a TTL survive the snapshot.
pub struct MemoryKv {
    state: RwLock<BTreeMap<String, Entry>>,
    snapshot: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    entries: BTreeMap<String, String>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv {
            state: RwLock::new(BTreeMap::new()),
            snapshot: None,
        }
    }

    /// Load any previous snapshot from `path` and re-write it on `close()`.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut state = BTreeMap::new();
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let snapshot: Snapshot = serde_json::from_str(&raw)
                    .map_err(|e| PagesError::Cache(format!("corrupt kv snapshot: {}", e)))?;
                for (key, value) in snapshot.entries {
                    state.insert(
                        key,
                        Entry {
                            value,
                            deadline: None,
                        },
                    );
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PagesError::Io(e)),
        }
        Ok(MemoryKv {
            state: RwLock::new(state),
            snapshot: Some(path),
        })
    }

    fn deadline(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<String> {
        let state = self.state.read().await;
        match state.get(key) {
            Some(entry) if !entry.expired(Instant::now()) => Ok(entry.value.clone()),
            _ => Err(PagesError::NotFound),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut state = self.state.write().await;
        state.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: Self::deadline(ttl),
            },
        );
        // Opportunistic cleanup so expired entries don't pile up.
        if state.len() % 128 == 0 {
            let now = Instant::now();
            state.retain(|_, entry| !entry.expired(now));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.remove(key) {
            Some(entry) => Ok(!entry.expired(Instant::now())),
            None => Ok(false),
        }
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        if state.get(key).is_some_and(|entry| !entry.expired(now)) {
            return Ok(false);
        }
        state.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: Self::deadline(ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(&self, key: &str, old: &str, new: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        match state.get_mut(key) {
            Some(entry) if !entry.expired(now) && entry.value == old => {
                entry.value = new.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, limit: usize, cursor: Option<&str>) -> Result<KvPage> {
        let state = self.state.read().await;
        let now = Instant::now();
        let start = match cursor {
            Some(cursor) => Bound::Excluded(cursor.to_string()),
            None => Bound::Unbounded,
        };
        let mut keys = Vec::new();
        let mut has_more = false;
        for (key, entry) in state.range((start, Bound::Unbounded)) {
            if entry.expired(now) {
                continue;
            }
            if keys.len() == limit {
                has_more = true;
                break;
            }
            keys.push(key.clone());
        }
        let next_cursor = keys.last().cloned();
        Ok(KvPage {
            keys,
            next_cursor,
            has_more,
        })
    }

    async fn close(&self) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let state = self.state.read().await;
        let snapshot = Snapshot {
            entries: state
                .iter()
                .filter(|(_, entry)| entry.deadline.is_none())
                .map(|(key, entry)| (key.clone(), entry.value.clone()))
                .collect(),
        };
        let raw = serde_json::to_string(&snapshot)?;
        if let Err(e) = std::fs::write(path, raw) {
            warn!(path = %path.display(), error = %e, "failed to write kv snapshot");
            return Err(PagesError::Io(e));
        }
        Ok(())
    }
}
