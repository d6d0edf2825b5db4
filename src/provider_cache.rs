//! Caching wrapper around a backend
//!
//! Sits between the gateway and the git host and keeps small blobs (and 404
//! verdicts) out of the backend's hair:
//!
//! - non-Range reads consult the blob cache first; a stored `{"404":"true"}`
//!   sentinel short-circuits to NotFound
//! - misses go through under a backend semaphore held until the response
//!   body is dropped
//! - small bodies (declared `Content-Length` within the limit) are buffered
//!   and cached together with their metadata headers, gated by a second
//!   semaphore so cache writes cannot monopolize memory
//! - Range requests bypass the cache entirely, both read and write

use crate::backend::{Backend, BranchMeta, FileResponse};
use crate::blob_cache::{BlobCache, BlobEntry};
use crate::body;
use crate::error::{PagesError, Result};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED, RANGE};
use http::{HeaderMap, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SENTINEL_NOT_FOUND: &str = "404";

pub struct CachedBackend {
    inner: Arc<dyn Backend>,
    blobs: Arc<dyn BlobCache>,
    blob_ttl: Duration,
    blob_limit: u64,
    cache_gate: Arc<Semaphore>,
    backend_gate: Arc<Semaphore>,
}

impl CachedBackend {
    pub fn new(
        inner: Arc<dyn Backend>,
        blobs: Arc<dyn BlobCache>,
        blob_ttl: Duration,
        blob_limit: u64,
        backend_concurrency: usize,
        cache_concurrency: usize,
    ) -> Self {
        CachedBackend {
            inner,
            blobs,
            blob_ttl,
            blob_limit,
            cache_gate: Arc::new(Semaphore::new(cache_concurrency)),
            backend_gate: Arc::new(Semaphore::new(backend_concurrency)),
        }
    }

    /// Branch tips are not cached here; site metadata is pinned to a commit
    /// by the meta engine and refreshed on its own clock.
    pub async fn meta(&self, owner: &str, repo: &str) -> Result<BranchMeta> {
        self.inner.meta(owner, repo).await
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Open `(owner, repo, commit, path)` through the cache.
    ///
    /// `cancel` is the request's cancellation token; a caller waiting for the
    /// backend semaphore is released with `Cancelled` when it fires.
    pub async fn open(
        &self,
        owner: &str,
        repo: &str,
        commit: &str,
        path: &str,
        headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<FileResponse> {
        let ranged = headers.contains_key(RANGE);
        let key = format!("{}/{}/{}/{}", owner, repo, commit, path);

        if !ranged {
            match self.blobs.get(&key).await {
                Ok(entry) => {
                    if entry.metadata.contains_key(SENTINEL_NOT_FOUND) {
                        debug!(key = %key, "negative cache hit");
                        return Err(PagesError::NotFound);
                    }
                    debug!(key = %key, size = entry.body.len(), "blob cache hit");
                    return Ok(synthesize(entry));
                }
                Err(PagesError::NotFound) => {}
                // A broken cache must not take the site down.
                Err(e) => warn!(key = %key, error = %e, "blob cache lookup failed"),
            }
        }

        let permit = acquire(&self.backend_gate, cancel).await?;
        let resp = match self.inner.open(owner, repo, commit, path, headers).await {
            Ok(resp) => resp,
            Err(PagesError::NotFound) => {
                if !ranged {
                    self.store_sentinel(&key).await;
                }
                return Err(PagesError::NotFound);
            }
            Err(e) => return Err(e),
        };
        if resp.status == StatusCode::NOT_FOUND {
            if !ranged {
                self.store_sentinel(&key).await;
            }
            return Err(PagesError::NotFound);
        }

        if ranged || resp.status != StatusCode::OK {
            return Ok(guard(resp, permit));
        }
        let Some(length) = resp.content_length() else {
            // Unknown size: stream through, nothing to gate on.
            return Ok(guard(resp, permit));
        };
        if length > self.blob_limit {
            debug!(key = %key, length, limit = self.blob_limit, "blob above cache limit");
            return Ok(guard(resp, permit));
        }
        let Ok(cache_permit) = self.cache_gate.clone().try_acquire_owned() else {
            debug!(key = %key, "cache writers saturated, streaming through");
            return Ok(guard(resp, permit));
        };

        let mut metadata = HashMap::new();
        for (name, stored) in [
            (CONTENT_LENGTH, "Content-Length"),
            (LAST_MODIFIED, "Last-Modified"),
            (CONTENT_TYPE, "Content-Type"),
        ] {
            if let Some(value) = resp.header(name) {
                metadata.insert(stored.to_string(), value.to_string());
            }
        }
        let data = resp.bytes(self.blob_limit as usize).await?;
        drop(permit);

        if let Err(e) = self
            .blobs
            .put(&key, metadata.clone(), data.clone(), Some(self.blob_ttl))
            .await
        {
            warn!(key = %key, error = %e, "failed to cache blob");
        }
        drop(cache_permit);

        Ok(synthesize(BlobEntry {
            metadata,
            body: data,
        }))
    }

    async fn store_sentinel(&self, key: &str) {
        let metadata = HashMap::from([(SENTINEL_NOT_FOUND.to_string(), "true".to_string())]);
        if let Err(e) = self
            .blobs
            .put(key, metadata, bytes::Bytes::new(), Some(self.blob_ttl))
            .await
        {
            warn!(key, error = %e, "failed to cache 404 sentinel");
        }
    }
}

async fn acquire(gate: &Arc<Semaphore>, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        _ = cancel.cancelled() => Err(PagesError::Cancelled),
        permit = gate.clone().acquire_owned() => {
            permit.map_err(|_| PagesError::Cancelled)
        }
    }
}

/// Hold the backend permit until the caller finished reading the body.
fn guard(resp: FileResponse, permit: OwnedSemaphorePermit) -> FileResponse {
    FileResponse {
        status: resp.status,
        headers: resp.headers,
        body: body::with_guard(resp.body, permit),
    }
}

/// A synthetic 200 built from a cached blob.
fn synthesize(entry: BlobEntry) -> FileResponse {
    let mut headers = HeaderMap::new();
    for (name, canonical) in [
        ("Content-Length", CONTENT_LENGTH),
        ("Last-Modified", LAST_MODIFIED),
        ("Content-Type", CONTENT_TYPE),
    ] {
        if let Some(value) = entry.metadata.get(name) {
            if let Ok(parsed) = value.parse() {
                headers.insert(canonical, parsed);
            }
        }
    }
    FileResponse {
        status: StatusCode::OK,
        headers,
        body: body::full(entry.body),
    }
}
