//! Script filter wiring: engine dispatch, deadline enforcement and the
//! behavior of sites declaring scripts on a gateway without an engine.

mod common;

use async_trait::async_trait;
use common::{read_body, TestServer};
use pages_gateway::body;
use pages_gateway::error::Result;
use pages_gateway::filter::{FilterContext, PageRequest, PageResponse};
use pages_gateway::filters::ScriptEngine;
use std::sync::Arc;
use std::time::Duration;

/// Echoes the script source back, prefixed with the site it ran for.
struct EchoEngine;

#[async_trait]
impl ScriptEngine for EchoEngine {
    async fn execute(
        &self,
        ctx: &FilterContext,
        _req: &mut PageRequest,
        source: &str,
        _debug: bool,
    ) -> Result<PageResponse> {
        Ok(http::Response::new(body::full(format!(
            "{}/{}|{}",
            ctx.site.owner, ctx.site.repo, source
        ))))
    }
}

/// Never finishes; used to trip the execution deadline.
struct StuckEngine;

#[async_trait]
impl ScriptEngine for StuckEngine {
    async fn execute(
        &self,
        _ctx: &FilterContext,
        _req: &mut PageRequest,
        _source: &str,
        _debug: bool,
    ) -> Result<PageResponse> {
        futures_util::future::pending().await
    }
}

fn script_site(server: &TestServer) {
    server.add_file("org1", "repo1", "index.html", "static");
    server.add_file("org1", "repo1", "app.js", "handler()");
    server.add_file(
        "org1",
        "repo1",
        ".pages.yaml",
        "routes:\n  - path: \"api/**\"\n    script:\n      exec: app.js\n",
    );
}

#[tokio::test]
async fn test_script_engine_receives_source() {
    let server = TestServer::with_options("example.com", |options| {
        options.script_engine = Some(Arc::new(EchoEngine));
    });
    script_site(&server);

    let body = server.get_ok("https://org1.example.com/repo1/api/anything").await;
    assert_eq!(body, "org1/repo1|handler()");

    // Paths outside the script route still hit the static handler.
    assert_eq!(server.get_ok("https://org1.example.com/repo1/").await, "static");
}

#[tokio::test]
async fn test_script_deadline_enforced() {
    let server = TestServer::with_options("example.com", |options| {
        options.script_engine = Some(Arc::new(StuckEngine));
        options.script_timeout = Duration::from_millis(50);
    });
    script_site(&server);

    let resp = server.get("https://org1.example.com/repo1/api/slow").await;
    assert_eq!(resp.status(), 504);
}

#[tokio::test]
async fn test_script_without_engine_is_config_error() {
    let server = TestServer::new("example.com");
    script_site(&server);

    let resp = server.get("https://org1.example.com/repo1/api/x").await;
    assert_eq!(resp.status(), 500);
    let text = read_body(resp).await;
    assert!(text.contains("filter not found: script"), "got: {}", text);
}

#[tokio::test]
async fn test_missing_script_source_is_not_found() {
    let server = TestServer::with_options("example.com", |options| {
        options.script_engine = Some(Arc::new(EchoEngine));
    });
    server.add_file("org1", "repo1", "index.html", "static");
    server.add_file(
        "org1",
        "repo1",
        ".pages.yaml",
        "routes:\n  - path: \"api/**\"\n    script:\n      exec: ghost.js\n",
    );

    let resp = server.get("https://org1.example.com/repo1/api/x").await;
    assert_eq!(resp.status(), 404);
}
