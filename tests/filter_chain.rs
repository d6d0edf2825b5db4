//! Filter composition order and the fallthrough handlers.

mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::{read_body, MemoryBackend, TestServer};
use http::Method;
use pages_gateway::blob_cache::MemoryBlobCache;
use pages_gateway::body;
use pages_gateway::error::{PagesError, Result};
use pages_gateway::filter::{FilterCall, FilterContext, Next, PageRequest, PageResponse};
use pages_gateway::kv::{self, Kv, MemoryKv};
use pages_gateway::meta::SiteMeta;
use pages_gateway::provider_cache::CachedBackend;
use pages_gateway::resolver::SiteContext;
use pages_gateway::subscribe::MemorySubscriber;
use pages_gateway::vfs::PageVfs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Recording {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    delegate: bool,
}

#[async_trait]
impl FilterCall for Recording {
    async fn call(
        &self,
        ctx: &FilterContext,
        req: &mut PageRequest,
        next: Next<'_>,
    ) -> Result<PageResponse> {
        self.log.lock().unwrap().push(format!("{}:enter", self.name));
        let outcome = if self.delegate {
            next.run(ctx, req).await
        } else {
            Ok(http::Response::new(body::full(self.name.to_string())))
        };
        self.log.lock().unwrap().push(format!("{}:exit", self.name));
        outcome
    }
}

fn test_context() -> FilterContext {
    let backend = Arc::new(MemoryBackend::new());
    let cached = Arc::new(CachedBackend::new(
        backend,
        Arc::new(MemoryBlobCache::new(1024 * 1024)),
        Duration::ZERO,
        1024 * 1024,
        64,
        16,
    ));
    let cancel = CancellationToken::new();
    let vfs = Arc::new(PageVfs::new(cached, "org1", "repo1", "c1", cancel.clone()));
    let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
    let site = SiteContext {
        meta: Arc::new(SiteMeta {
            commit_id: "c1".into(),
            last_modified: Utc::now(),
            is_page: true,
            error_msg: String::new(),
            alias: vec![],
            filters: vec![],
            refresh_at: None,
        }),
        owner: "org1".into(),
        repo: "repo1".into(),
        path: "index.html".into(),
    };
    FilterContext::new(
        site,
        cancel,
        vfs,
        kv::scoped(kv.clone(), &["org", "org1"]),
        kv::scoped(kv.clone(), &["repo", "org1", "repo1"]),
        kv::scoped(kv, &["cache"]),
        Arc::new(MemorySubscriber::new()),
        "https".into(),
    )
}

fn test_request() -> PageRequest {
    PageRequest {
        method: Method::GET,
        uri: "https://org1.example.com/repo1/".parse().unwrap(),
        headers: http::HeaderMap::new(),
        remote_addr: None,
        body: None,
    }
}

#[tokio::test]
async fn test_first_declared_filter_is_outermost() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let chain: Vec<Arc<dyn FilterCall>> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            Arc::new(Recording {
                name,
                log: log.clone(),
                delegate: true,
            }) as Arc<dyn FilterCall>
        })
        .collect();

    let ctx = test_context();
    let mut req = test_request();
    let outcome = Next::new(&chain).run(&ctx, &mut req).await;

    // Everyone delegated: the chain bottoms out with the terminal NotFound.
    assert!(matches!(outcome, Err(PagesError::NotFound)));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["a:enter", "b:enter", "c:enter", "c:exit", "b:exit", "a:exit"]
    );
}

#[tokio::test]
async fn test_short_circuit_skips_inner_filters() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let chain: Vec<Arc<dyn FilterCall>> = vec![
        Arc::new(Recording {
            name: "outer",
            log: log.clone(),
            delegate: true,
        }),
        Arc::new(Recording {
            name: "stop",
            log: log.clone(),
            delegate: false,
        }),
        Arc::new(Recording {
            name: "never",
            log: log.clone(),
            delegate: true,
        }),
    ];

    let ctx = test_context();
    let mut req = test_request();
    let outcome = Next::new(&chain).run(&ctx, &mut req).await.unwrap();

    assert_eq!(read_body(outcome).await, "stop");
    assert_eq!(
        *log.lock().unwrap(),
        vec!["outer:enter", "stop:enter", "stop:exit", "outer:exit"]
    );
}

#[tokio::test]
async fn test_empty_chain_is_not_found() {
    let ctx = test_context();
    let mut req = test_request();
    let outcome = Next::new(&[]).run(&ctx, &mut req).await;
    assert!(matches!(outcome, Err(PagesError::NotFound)));
}

#[tokio::test]
async fn test_failback_serves_substitute() {
    let server = TestServer::new("example.com");
    server.add_file("org1", "repo1", "index.html", "app shell");
    server.add_file("org1", "repo1", "offline.html", "offline copy");
    server.add_file(
        "org1",
        "repo1",
        ".pages.yaml",
        "routes:\n  - path: \"app/**\"\n    failback:\n      path: offline.html\n",
    );

    // Missing file under the matched subtree: the failback answers.
    let resp = server.get("https://org1.example.com/repo1/app/deep/link").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(read_body(resp).await, "offline copy");

    // Outside the matched subtree the regular 404 applies.
    let resp = server.get("https://org1.example.com/repo1/missing").await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_default_not_found_serves_custom_page() {
    let server = TestServer::new("example.com");
    server.add_file("org1", "repo1", "index.html", "home");
    server.add_file("org1", "repo1", "404.html", "<h1>lost</h1>");

    let resp = server.get("https://org1.example.com/repo1/missing").await;
    assert_eq!(resp.status(), 404);
    assert_eq!(read_body(resp).await, "<h1>lost</h1>");

    // The regular page is untouched.
    assert_eq!(server.get_ok("https://org1.example.com/repo1/").await, "home");
}

#[tokio::test]
async fn test_user_filter_shadows_implicit_block() {
    // A user route higher in the chain may handle a path the implicit tier
    // would otherwise block.
    let server = TestServer::new("example.com");
    server.add_file("org1", "repo1", "index.html", "home");
    server.add_file(
        "org1",
        "repo1",
        ".pages.yaml",
        "routes:\n  - path: \".git/**\"\n    block:\n      code: 418\n",
    );

    let resp = server.get("https://org1.example.com/repo1/.git/config").await;
    assert_eq!(resp.status(), 418);
}

#[tokio::test]
async fn test_failback_ignores_non_not_found_outcomes() {
    let server = TestServer::new("example.com");
    server.add_file("org1", "repo1", "index.html", "home");
    server.add_file("org1", "repo1", "blocked.html", "secret");
    server.add_file("org1", "repo1", "offline.html", "offline copy");
    server.add_file(
        "org1",
        "repo1",
        ".pages.yaml",
        "routes:\n  - path: \"**\"\n    failback:\n      path: offline.html\n  - path: \"blocked.html\"\n    block: {}\n",
    );

    // The inner block answered; the failback passes its response through.
    let resp = server.get("https://org1.example.com/repo1/blocked.html").await;
    assert_eq!(resp.status(), 403);
}
