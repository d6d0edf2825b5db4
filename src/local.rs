//! Local filesystem backend
//!
//! Serves `<root>/<owner>/<repo>/<branch>/<path>` directly from disk. Used by
//! the test suite and by single-site deployments that keep a checkout next to
//! the gateway. The synthetic commit id is derived from the newest mtime in
//! the tree, so edits produce a new commit and invalidate commit-keyed blob
//! cache entries.

use crate::backend::{Backend, BranchMeta, FileResponse};
use crate::body;
use crate::error::{PagesError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LAST_MODIFIED, RANGE};
use http::{HeaderMap, StatusCode};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

pub struct LocalBackend {
    root: PathBuf,
    branch: String,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, branch: &str) -> Self {
        LocalBackend {
            root: root.into(),
            branch: branch.to_string(),
        }
    }

    fn branch_dir(&self, owner: &str, repo: &str) -> Result<PathBuf> {
        for part in [owner, repo] {
            if part.is_empty() || part.contains(&['/', '\\'][..]) || part == ".." {
                return Err(PagesError::NotFound);
            }
        }
        Ok(self.root.join(owner).join(repo).join(&self.branch))
    }

    fn resolve(&self, owner: &str, repo: &str, path: &str) -> Result<PathBuf> {
        let mut full = self.branch_dir(owner, repo)?;
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::CurDir => {}
                // Anything that can escape the tree is treated as missing.
                _ => return Err(PagesError::NotFound),
            }
        }
        Ok(full)
    }
}

/// Newest mtime anywhere under `dir`.
fn newest_mtime(dir: &Path) -> std::io::Result<SystemTime> {
    let mut newest = std::fs::metadata(dir)?.modified()?;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if let Ok(modified) = meta.modified() {
                if modified > newest {
                    newest = modified;
                }
            }
            if meta.is_dir() {
                stack.push(entry.path());
            }
        }
    }
    Ok(newest)
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    let millis = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

/// `bytes=start-end` with both bounds present; anything else is ignored and
/// the full file is served.
fn parse_range(header: &str, len: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = end.parse().ok()?;
    if start > end || start >= len {
        return None;
    }
    Some((start, end.min(len.saturating_sub(1))))
}

#[async_trait]
impl Backend for LocalBackend {
    async fn meta(&self, owner: &str, repo: &str) -> Result<BranchMeta> {
        let dir = self.branch_dir(owner, repo)?;
        let newest = tokio::task::spawn_blocking(move || newest_mtime(&dir))
            .await
            .map_err(|e| PagesError::Backend(e.to_string()))?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PagesError::NotFound,
                _ => PagesError::Io(e),
            })?;
        let last_modified = to_utc(newest);
        Ok(BranchMeta {
            id: format!("{:x}", last_modified.timestamp_millis()),
            last_modified,
        })
    }

    async fn open(
        &self,
        owner: &str,
        repo: &str,
        _commit: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<FileResponse> {
        let full = self.resolve(owner, repo, path)?;
        let meta = match tokio::fs::metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PagesError::NotFound)
            }
            Err(e) => return Err(PagesError::Io(e)),
        };
        if !meta.is_file() {
            return Err(PagesError::NotFound);
        }
        let data = Bytes::from(tokio::fs::read(&full).await?);
        let last_modified = meta
            .modified()
            .map(|t| to_utc(t).format("%a, %d %b %Y %H:%M:%S GMT").to_string())
            .ok();
        let content_type = mime_guess::from_path(&full)
            .first_raw()
            .unwrap_or("application/octet-stream");

        let mut response_headers = HeaderMap::new();
        if let Some(lm) = &last_modified {
            if let Ok(value) = lm.parse() {
                response_headers.insert(LAST_MODIFIED, value);
            }
        }
        if let Ok(value) = content_type.parse() {
            response_headers.insert(CONTENT_TYPE, value);
        }
        if let Ok(value) = "bytes".parse() {
            response_headers.insert(ACCEPT_RANGES, value);
        }

        let range = headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_range(v, data.len() as u64));
        if let Some((start, end)) = range {
            let slice = data.slice(start as usize..=end as usize);
            if let Ok(value) = slice.len().to_string().parse() {
                response_headers.insert(CONTENT_LENGTH, value);
            }
            if let Ok(value) = format!("bytes {}-{}/{}", start, end, data.len()).parse() {
                response_headers.insert(CONTENT_RANGE, value);
            }
            return Ok(FileResponse {
                status: StatusCode::PARTIAL_CONTENT,
                headers: response_headers,
                body: body::full(slice),
            });
        }

        if let Ok(value) = data.len().to_string().parse() {
            response_headers.insert(CONTENT_LENGTH, value);
        }
        Ok(FileResponse {
            status: StatusCode::OK,
            headers: response_headers,
            body: body::full(data),
        })
    }
}
