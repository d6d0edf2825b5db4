//! Blob cache for file bytes with attached metadata
//!
//! Entries are keyed by `<owner>/<repo>/<commit>/<path>`, so content is
//! immutable for the lifetime of a key; expiry and LRU eviction only bound
//! memory, never correctness.

use crate::error::{PagesError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cached blob: body bytes plus the stored header map.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub metadata: HashMap<String, String>,
    pub body: Bytes,
}

#[async_trait]
pub trait BlobCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<BlobEntry>;
    async fn put(
        &self,
        key: &str,
        metadata: HashMap<String, String>,
        body: Bytes,
        ttl: Option<Duration>,
    ) -> Result<()>;
}

/// A view of `inner` whose keys live under `namespace.join("/")`.
pub fn scoped(inner: Arc<dyn BlobCache>, namespace: &[&str]) -> Arc<dyn BlobCache> {
    Arc::new(ScopedBlobCache {
        inner,
        prefix: format!("{}/", namespace.join("/")),
    })
}

struct ScopedBlobCache {
    inner: Arc<dyn BlobCache>,
    prefix: String,
}

#[async_trait]
impl BlobCache for ScopedBlobCache {
    async fn get(&self, key: &str) -> Result<BlobEntry> {
        self.inner.get(&format!("{}{}", self.prefix, key)).await
    }

    async fn put(
        &self,
        key: &str,
        metadata: HashMap<String, String>,
        body: Bytes,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.inner
            .put(&format!("{}{}", self.prefix, key), metadata, body, ttl)
            .await
    }
}

struct Slot {
    entry: BlobEntry,
    expires_at: Option<Instant>,
    last_accessed: Instant,
}

struct Inner {
    slots: HashMap<String, Slot>,
    current_bytes: usize,
}

/// In-memory blob cache bounded by total body bytes, with LRU eviction.
pub struct MemoryBlobCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
}

impl MemoryBlobCache {
    pub fn new(max_bytes: usize) -> Self {
        MemoryBlobCache {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                current_bytes: 0,
            }),
            max_bytes,
        }
    }

    fn cleanup_expired(inner: &mut Inner, now: Instant) {
        let mut removed = 0usize;
        inner.slots.retain(|_, slot| {
            let keep = !slot.expires_at.is_some_and(|d| d <= now);
            if !keep {
                removed += slot.entry.body.len();
            }
            keep
        });
        inner.current_bytes = inner.current_bytes.saturating_sub(removed);
    }

    fn evict_lru(inner: &mut Inner, needed_bytes: usize) {
        let mut entries: Vec<_> = inner
            .slots
            .iter()
            .map(|(key, slot)| (key.clone(), slot.last_accessed, slot.entry.body.len()))
            .collect();
        entries.sort_by_key(|(_, last_accessed, _)| *last_accessed);

        let mut freed = 0usize;
        for (key, _, size) in entries {
            if freed >= needed_bytes {
                break;
            }
            if inner.slots.remove(&key).is_some() {
                inner.current_bytes = inner.current_bytes.saturating_sub(size);
                freed += size;
            }
        }
        debug!(freed, "blob cache lru eviction");
    }
}

#[async_trait]
impl BlobCache for MemoryBlobCache {
    async fn get(&self, key: &str) -> Result<BlobEntry> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.slots.get_mut(key) {
            Some(slot) if !slot.expires_at.is_some_and(|d| d <= now) => {
                slot.last_accessed = now;
                Ok(slot.entry.clone())
            }
            _ => Err(PagesError::NotFound),
        }
    }

    async fn put(
        &self,
        key: &str,
        metadata: HashMap<String, String>,
        body: Bytes,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let size = body.len();
        if size > self.max_bytes {
            return Err(PagesError::Cache(format!(
                "blob of {} bytes exceeds cache capacity",
                size
            )));
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        Self::cleanup_expired(&mut inner, now);
        if let Some(old) = inner.slots.remove(key) {
            inner.current_bytes = inner.current_bytes.saturating_sub(old.entry.body.len());
        }
        if inner.current_bytes + size > self.max_bytes {
            let needed = inner.current_bytes + size - self.max_bytes;
            Self::evict_lru(&mut inner, needed);
        }
        inner.slots.insert(
            key.to_string(),
            Slot {
                entry: BlobEntry { metadata, body },
                expires_at: ttl.map(|ttl| now + ttl),
                last_accessed: now,
            },
        );
        inner.current_bytes += size;
        Ok(())
    }
}
