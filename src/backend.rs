//! Read-only view of the git hosting backend.
//!
//! A backend exposes exactly what the gateway needs: the tip of the pages
//! branch for a repository, and a streaming open of a file blob at a pinned
//! commit. Everything else (listing, writes, hooks) stays on the git host.

use crate::body::{self, Body};
use crate::error::{PagesError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;

/// Tip of the pages branch for one repository. Immutable per commit.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BranchMeta {
    /// Commit hash of the branch tip
    pub id: String,
    /// Commit timestamp
    pub last_modified: DateTime<Utc>,
}

/// A file opened from the backend: status, a header subset and a body that
/// may be streamed or fully buffered.
pub struct FileResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl FileResponse {
    /// Build an in-memory 200 response with the standard blob headers.
    pub fn from_bytes(
        data: Bytes,
        content_type: Option<&str>,
        last_modified: Option<&str>,
    ) -> FileResponse {
        let mut headers = HeaderMap::new();
        if let Ok(value) = data.len().to_string().parse() {
            headers.insert(CONTENT_LENGTH, value);
        }
        if let Some(ct) = content_type {
            if let Ok(value) = ct.parse() {
                headers.insert(CONTENT_TYPE, value);
            }
        }
        if let Some(lm) = last_modified {
            if let Ok(value) = lm.parse() {
                headers.insert(LAST_MODIFIED, value);
            }
        }
        FileResponse {
            status: StatusCode::OK,
            headers,
            body: body::full(data),
        }
    }

    /// Declared `Content-Length`, when present and parseable.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// A header value as a string, when present and valid UTF-8.
    pub fn header(&self, name: http::header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Buffer the body, failing when it exceeds `limit` bytes.
    pub async fn bytes(self, limit: usize) -> Result<Bytes> {
        let limited = http_body_util::Limited::new(self.body, limit);
        limited
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|_| {
                PagesError::validation(format!("response body exceeds {} byte limit", limit))
            })
    }
}

/// Read-only client for the git host.
///
/// `NotFound` is a distinguishable error kind on both operations; all other
/// failures are opaque backend errors.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Return the tip of the designated pages branch.
    async fn meta(&self, owner: &str, repo: &str) -> Result<BranchMeta>;

    /// Open a file blob at `(owner, repo, commit, path)`. A caller-supplied
    /// `Range` header is forwarded verbatim.
    async fn open(
        &self,
        owner: &str,
        repo: &str,
        commit: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<FileResponse>;

    /// Release underlying resources.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_bytes_headers() {
        let resp = FileResponse::from_bytes(
            Bytes::from("hello"),
            Some("text/plain"),
            Some("Mon, 02 Jan 2006 15:04:05 GMT"),
        );
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.content_length(), Some(5));
        assert_eq!(resp.header(CONTENT_TYPE), Some("text/plain"));
        let data = resp.bytes(1024).await.unwrap();
        assert_eq!(data, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_bytes_limit_enforced() {
        let resp = FileResponse::from_bytes(Bytes::from(vec![0u8; 64]), None, None);
        assert!(resp.bytes(16).await.is_err());
    }
}
