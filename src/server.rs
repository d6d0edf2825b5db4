//! HTTP entry point
//!
//! One handler mounted at `/`. Per request: resolve the host and path to a
//! site, normalize the path, select the matching filters, compose them into
//! a chain and run it. Errors (and recovered panics) that reach the top are
//! rendered by the configured error handler; NotFound becomes a plain 404.

use crate::backend::Backend;
use crate::blob_cache::{self, BlobCache};
use crate::body::{self, Body};
use crate::error::{PagesError, Result};
use crate::filter::{FilterCall, FilterContext, FilterRegistry, Next, PageRequest, PageResponse, Params};
use crate::filters::{self, ScriptEngine};
use crate::glob_cache::GlobCache;
use crate::kv::{self, Kv};
use crate::meta::MetaEngine;
use crate::provider_cache::CachedBackend;
use crate::resolver::HostResolver;
use crate::subscribe::{self, Subscriber};
use crate::vfs::PageVfs;
use crate::alias::AliasRegistry;
use futures_util::FutureExt;
use http::header::HeaderName;
use http::StatusCode;
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const SESSION_HEADER: HeaderName = HeaderName::from_static("session-id");
const GLOB_CACHE_CAPACITY: usize = 256;

/// Renders error responses when the chain did not produce one. The default
/// writes a plain-text status line; hosts may install an HTML renderer.
pub type ErrorHandler = Arc<dyn Fn(&PageRequest, &PagesError) -> PageResponse + Send + Sync>;

pub struct PageServerOptions {
    pub base_domain: String,
    /// Public scheme used in redirects ("http" or "https")
    pub scheme: String,
    /// Store for site metadata, alias bindings and scratch space
    pub kv: Arc<dyn Kv>,
    /// Store exposed to script filters (`org/...`, `repo/...` namespaces);
    /// may be the same instance as `kv`
    pub db: Arc<dyn Kv>,
    pub blob_cache: Arc<dyn BlobCache>,
    pub events: Arc<dyn Subscriber>,
    pub meta_ttl: Duration,
    pub blob_ttl: Duration,
    pub blob_limit: u64,
    pub backend_concurrency: usize,
    pub cache_concurrency: usize,
    pub refresh_concurrency: usize,
    pub script_timeout: Duration,
    /// Per-type global filter parameters from the server configuration
    pub filter_globals: HashMap<String, Params>,
    pub script_engine: Option<Arc<dyn ScriptEngine>>,
    pub error_handler: Option<ErrorHandler>,
}

impl PageServerOptions {
    /// Sensible defaults around in-memory state, for tests and small setups.
    pub fn new(base_domain: &str, kv: Arc<dyn Kv>, blob_cache: Arc<dyn BlobCache>) -> Self {
        PageServerOptions {
            base_domain: base_domain.to_string(),
            scheme: "https".to_string(),
            db: kv.clone(),
            kv,
            blob_cache,
            events: Arc::new(subscribe::MemorySubscriber::new()),
            meta_ttl: Duration::from_secs(60),
            blob_ttl: Duration::from_secs(3600),
            blob_limit: 1024 * 1024,
            backend_concurrency: 64,
            cache_concurrency: 16,
            refresh_concurrency: 16,
            script_timeout: Duration::from_secs(60),
            filter_globals: HashMap::new(),
            script_engine: None,
            error_handler: None,
        }
    }
}

struct ServerInner {
    backend: Arc<CachedBackend>,
    resolver: HostResolver,
    registry: FilterRegistry,
    globs: GlobCache,
    kv: Arc<dyn Kv>,
    db: Arc<dyn Kv>,
    events: Arc<dyn Subscriber>,
    scheme: String,
    error_handler: ErrorHandler,
}

#[derive(Clone)]
pub struct PageServer {
    inner: Arc<ServerInner>,
}

impl PageServer {
    pub fn new(backend: Arc<dyn Backend>, options: PageServerOptions) -> Result<PageServer> {
        let cached = Arc::new(CachedBackend::new(
            backend,
            blob_cache::scoped(options.blob_cache.clone(), &["backend"]),
            options.blob_ttl,
            options.blob_limit,
            options.backend_concurrency,
            options.cache_concurrency,
        ));
        let alias = AliasRegistry::new(kv::scoped(options.kv.clone(), &["config", "alias"]));
        let meta = MetaEngine::new(
            cached.clone(),
            kv::scoped(options.kv.clone(), &["meta"]),
            alias.clone(),
            &options.base_domain,
            options.meta_ttl,
            options.refresh_concurrency,
        );
        let resolver = HostResolver::new(&options.base_domain, alias, meta);
        let registry = filters::defaults(
            &options.filter_globals,
            options
                .script_engine
                .map(|engine| (engine, options.script_timeout)),
        )?;

        Ok(PageServer {
            inner: Arc::new(ServerInner {
                backend: cached,
                resolver,
                registry,
                globs: GlobCache::new(GLOB_CACHE_CAPACITY),
                kv: options.kv,
                db: options.db,
                events: options.events,
                scheme: options.scheme,
                error_handler: options
                    .error_handler
                    .unwrap_or_else(|| Arc::new(default_error_handler)),
            }),
        })
    }

    /// Serve one request. Always produces a response: chain errors go through
    /// the error handler, panics inside filters are recovered and reported
    /// as filter errors.
    pub async fn handle(&self, mut req: PageRequest) -> PageResponse {
        let session = Uuid::new_v4().to_string();
        if let Ok(value) = session.parse() {
            req.headers.insert(SESSION_HEADER, value);
        }

        let cancel = CancellationToken::new();
        // Dropping the request future (client disconnect) cancels all
        // in-flight backend waits issued on its behalf.
        let _guard = cancel.clone().drop_guard();

        let outcome = AssertUnwindSafe(self.run(&mut req, cancel.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(session = %session, panic = %msg, "filter chain panicked");
                Err(PagesError::Filter(format!("panic: {}", msg)))
            });

        let mut resp = match outcome {
            Ok(resp) => resp,
            Err(err) => {
                if err.is_not_found() {
                    debug!(session = %session, path = %req.uri.path(), "not found");
                } else {
                    warn!(session = %session, path = %req.uri.path(), error = %err, "request failed");
                }
                (self.inner.error_handler)(&req, &err)
            }
        };
        if let Ok(value) = session.parse() {
            resp.headers_mut().insert(SESSION_HEADER, value);
        }
        resp
    }

    async fn run(&self, req: &mut PageRequest, cancel: CancellationToken) -> Result<PageResponse> {
        let host = req.host().ok_or(PagesError::NotFound)?;
        let mut site = self.inner.resolver.resolve(&host, req.uri.path()).await?;
        if site.path.is_empty() || site.path.ends_with('/') {
            site.path.push_str("index.html");
        }
        debug!(
            owner = %site.owner,
            repo = %site.repo,
            path = %site.path,
            commit = %site.meta.commit_id,
            "resolved site"
        );

        let mut active: Vec<Arc<dyn FilterCall>> = Vec::new();
        for filter in &site.meta.filters {
            let matcher = self.inner.globs.get(&filter.path)?;
            if !matcher.is_match(&site.path) {
                continue;
            }
            active.push(self.inner.registry.instantiate(&filter.kind, &filter.params)?);
        }

        let vfs = Arc::new(PageVfs::new(
            self.inner.backend.clone(),
            &site.owner,
            &site.repo,
            &site.meta.commit_id,
            cancel.clone(),
        ));
        let ctx = FilterContext::new(
            site.clone(),
            cancel,
            vfs,
            kv::scoped(self.inner.db.clone(), &["org", site.owner.as_str()]),
            kv::scoped(
                self.inner.db.clone(),
                &["repo", site.owner.as_str(), site.repo.as_str()],
            ),
            kv::scoped(self.inner.kv.clone(), &["cache"]),
            subscribe::scoped(
                self.inner.events.clone(),
                &[site.owner.as_str(), site.repo.as_str()],
            ),
            self.inner.scheme.clone(),
        );

        let outcome = Next::new(&active).run(&ctx, req).await;
        ctx.run_closers();
        outcome
    }

    /// Adapter for hyper's `service_fn`.
    pub async fn serve_hyper(
        &self,
        req: http::Request<hyper::body::Incoming>,
        remote: SocketAddr,
    ) -> std::result::Result<http::Response<Body>, std::convert::Infallible> {
        let (parts, incoming) = req.into_parts();
        let page_req = PageRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            remote_addr: Some(remote),
            body: Some(incoming.map_err(std::io::Error::other).boxed_unsync()),
        };
        Ok(self.handle(page_req).await)
    }

    /// Release backend and store resources.
    pub async fn close(&self) {
        self.inner.backend.close().await;
        if let Err(e) = self.inner.kv.close().await {
            warn!(error = %e, "kv close failed");
        }
        if let Err(e) = self.inner.db.close().await {
            warn!(error = %e, "db close failed");
        }
        if let Err(e) = self.inner.events.close().await {
            warn!(error = %e, "subscriber close failed");
        }
    }
}

fn default_error_handler(req: &PageRequest, err: &PagesError) -> PageResponse {
    let status = StatusCode::from_u16(err.to_http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let session = req.header(SESSION_HEADER).unwrap_or("-");
    let message = if err.is_not_found() {
        format!("404 page not found\nsession: {}\n", session)
    } else {
        format!("{} {}\nsession: {}\n", status.as_u16(), err, session)
    };
    http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body::full(message))
        .unwrap_or_else(|_| {
            let mut resp = http::Response::new(body::empty());
            *resp.status_mut() = status;
            resp
        })
}
