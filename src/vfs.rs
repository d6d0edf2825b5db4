//! Per-site virtual filesystem pinned to a commit
//!
//! Every request gets a `PageVfs` for the resolved `(owner, repo, commit)`.
//! All reads flow through the provider cache, so hot files come out of memory
//! and misses are bounded by the backend semaphore.

use crate::backend::FileResponse;
use crate::error::{PagesError, Result};
use crate::provider_cache::CachedBackend;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Largest file loaded fully into memory by `read` / `read_string` (10MB).
pub const MAX_FILE_LOAD_SIZE: usize = 10 * 1024 * 1024;

pub struct PageVfs {
    backend: Arc<CachedBackend>,
    owner: String,
    repo: String,
    commit: String,
    cancel: CancellationToken,
}

impl PageVfs {
    pub fn new(
        backend: Arc<CachedBackend>,
        owner: &str,
        repo: &str,
        commit: &str,
        cancel: CancellationToken,
    ) -> Self {
        PageVfs {
            backend,
            owner: owner.to_string(),
            repo: repo.to_string(),
            commit: commit.to_string(),
            cancel,
        }
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    /// Raw open: returns whatever the backend produced, including non-200
    /// statuses. Caller-supplied headers (e.g. `Range`) pass through.
    pub async fn native_open(&self, path: &str, headers: &HeaderMap) -> Result<FileResponse> {
        self.backend
            .open(
                &self.owner,
                &self.repo,
                &self.commit,
                path.trim_start_matches('/'),
                headers,
                &self.cancel,
            )
            .await
    }

    /// Open a file, mapping any non-200 status to NotFound.
    pub async fn open(&self, path: &str) -> Result<FileResponse> {
        let resp = self.native_open(path, &HeaderMap::new()).await?;
        if resp.status != StatusCode::OK {
            return Err(PagesError::NotFound);
        }
        Ok(resp)
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.native_open(path, &HeaderMap::new()).await {
            Ok(resp) => Ok(resp.status == StatusCode::OK),
            Err(PagesError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read a file fully into memory, bounded by [`MAX_FILE_LOAD_SIZE`].
    pub async fn read(&self, path: &str) -> Result<Bytes> {
        let resp = self.open(path).await?;
        resp.bytes(MAX_FILE_LOAD_SIZE).await
    }

    pub async fn read_string(&self, path: &str) -> Result<String> {
        let data = self.read(path).await?;
        String::from_utf8(data.to_vec())
            .map_err(|_| PagesError::validation(format!("{} is not valid utf-8", path)))
    }
}
