//! Shared test harness: an in-memory counting backend plus a fully wired
//! gateway, so end-to-end tests drive the same code path as production.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LAST_MODIFIED, RANGE};
use http::{HeaderMap, Method, StatusCode};
use pages_gateway::backend::{Backend, BranchMeta, FileResponse};
use pages_gateway::blob_cache::MemoryBlobCache;
use pages_gateway::body;
use pages_gateway::error::{PagesError, Result};
use pages_gateway::kv::MemoryKv;
use pages_gateway::{PageRequest, PageResponse, PageServer, PageServerOptions};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RepoState {
    serial: u64,
    files: HashMap<String, Bytes>,
}

/// In-memory backend. Every `add_file` bumps the repo's synthetic commit so
/// commit-keyed caches see fresh content. Counts backend calls so tests can
/// assert on caching and single-flight behavior.
#[derive(Default)]
pub struct MemoryBackend {
    repos: Mutex<HashMap<String, RepoState>>,
    pub meta_calls: AtomicUsize,
    pub open_calls: AtomicUsize,
    meta_delay: Mutex<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    pub fn add_file(&self, owner: &str, repo: &str, path: &str, data: impl Into<Bytes>) {
        let mut repos = self.repos.lock().unwrap();
        let state = repos.entry(format!("{}/{}", owner, repo)).or_default();
        state.serial += 1;
        state.files.insert(path.to_string(), data.into());
    }

    pub fn remove_file(&self, owner: &str, repo: &str, path: &str) {
        let mut repos = self.repos.lock().unwrap();
        if let Some(state) = repos.get_mut(&format!("{}/{}", owner, repo)) {
            state.serial += 1;
            state.files.remove(path);
        }
    }

    /// Make `meta` take a while, so concurrent compilations overlap.
    pub fn set_meta_delay(&self, delay: Duration) {
        *self.meta_delay.lock().unwrap() = delay;
    }

    pub fn meta_count(&self) -> usize {
        self.meta_calls.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }
}

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
impl Backend for MemoryBackend {
    async fn meta(&self, owner: &str, repo: &str) -> Result<BranchMeta> {
        self.meta_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.meta_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let repos = self.repos.lock().unwrap();
        match repos.get(&format!("{}/{}", owner, repo)) {
            Some(state) if !state.files.is_empty() => Ok(BranchMeta {
                id: format!("c{}", state.serial),
                last_modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            }),
            _ => Err(PagesError::NotFound),
        }
    }

    async fn open(
        &self,
        owner: &str,
        repo: &str,
        _commit: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<FileResponse> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let data = {
            let repos = self.repos.lock().unwrap();
            repos
                .get(&format!("{}/{}", owner, repo))
                .and_then(|state| state.files.get(path))
                .cloned()
        };
        let Some(data) = data else {
            return Err(PagesError::NotFound);
        };

        let mut response_headers = HeaderMap::new();
        response_headers.insert(LAST_MODIFIED, "Mon, 02 Jan 2006 15:04:05 GMT".parse().unwrap());
        let content_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream");
        response_headers.insert(CONTENT_TYPE, content_type.parse().unwrap());

        let range = headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_range(v, data.len() as u64));
        if let Some((start, end)) = range {
            let slice = data.slice(start as usize..=end as usize);
            response_headers.insert(CONTENT_LENGTH, slice.len().to_string().parse().unwrap());
            response_headers.insert(
                CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, data.len()).parse().unwrap(),
            );
            return Ok(FileResponse {
                status: StatusCode::PARTIAL_CONTENT,
                headers: response_headers,
                body: body::full(slice),
            });
        }

        response_headers.insert(CONTENT_LENGTH, data.len().to_string().parse().unwrap());
        Ok(FileResponse {
            status: StatusCode::OK,
            headers: response_headers,
            body: body::full(data),
        })
    }
}

/// A gateway wired over a [`MemoryBackend`] with metadata caching disabled,
/// so file edits take effect on the next request like the real thing after a
/// refresh.
pub struct TestServer {
    pub backend: Arc<MemoryBackend>,
    pub server: PageServer,
}

impl TestServer {
    pub fn new(domain: &str) -> Self {
        Self::with_options(domain, |_| {})
    }

    pub fn with_options(domain: &str, tweak: impl FnOnce(&mut PageServerOptions)) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let kv = Arc::new(MemoryKv::new());
        let blobs = Arc::new(MemoryBlobCache::new(16 * 1024 * 1024));
        let mut options = PageServerOptions::new(domain, kv, blobs);
        options.meta_ttl = Duration::ZERO;
        options.blob_ttl = Duration::ZERO;
        tweak(&mut options);
        let server = PageServer::new(backend.clone(), options).expect("server setup");
        TestServer { backend, server }
    }

    pub fn add_file(&self, owner: &str, repo: &str, path: &str, data: &str) {
        self.backend.add_file(owner, repo, path, data.to_string());
    }

    pub async fn request(&self, method: Method, url: &str) -> PageResponse {
        let uri: http::Uri = url.parse().expect("test url");
        let mut headers = HeaderMap::new();
        let host = uri.authority().expect("test url authority").to_string();
        headers.insert(http::header::HOST, host.parse().unwrap());
        self.server
            .handle(PageRequest {
                method,
                uri,
                headers,
                remote_addr: Some("127.0.0.1:4000".parse().unwrap()),
                body: None,
            })
            .await
    }

    pub async fn get(&self, url: &str) -> PageResponse {
        self.request(Method::GET, url).await
    }

    /// GET expecting a successful response; returns the body text.
    pub async fn get_ok(&self, url: &str) -> String {
        let resp = self.get(url).await;
        let status = resp.status();
        let text = read_body(resp).await;
        assert!(
            status.is_success(),
            "GET {} returned {}: {}",
            url,
            status,
            text
        );
        text
    }
}

pub async fn read_body(resp: PageResponse) -> String {
    let bytes = body::collect(resp.into_body()).await.expect("body read");
    String::from_utf8_lossy(&bytes).into_owned()
}
