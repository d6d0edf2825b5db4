//! Static file filter: serve the request path straight from the site tree
//!
//! Synthesized as the innermost filter of every site, and declarable with a
//! `prefix` to remap a subtree. GET and HEAD only; directory-shaped paths
//! that hold an `index.html` are normalized with a slash redirect the way
//! GitHub Pages does it.

use crate::body;
use crate::error::{PagesError, Result};
use crate::filter::{FilterCall, FilterContext, FilterInstance, Next, PageRequest, PageResponse, Params};
use async_trait::async_trait;
use http::header::{ALLOW, LOCATION, RANGE};
use http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize, Default)]
struct DirectParams {
    #[serde(default)]
    prefix: String,
}

struct DirectFilter {
    prefix: String,
}

#[async_trait]
impl FilterCall for DirectFilter {
    async fn call(
        &self,
        ctx: &FilterContext,
        req: &mut PageRequest,
        next: Next<'_>,
    ) -> Result<PageResponse> {
        if req.method != Method::GET && req.method != Method::HEAD {
            return http::Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(ALLOW, "GET, HEAD")
                .body(body::empty())
                .map_err(|e| PagesError::Filter(e.to_string()));
        }

        let path = super::join_prefix(&self.prefix, ctx.site.path.trim_end_matches('/'));

        // Forward a client Range header; ranged reads bypass the blob cache
        // and the backend answers them verbatim.
        let mut headers = HeaderMap::new();
        if let Some(range) = req.headers.get(RANGE) {
            headers.insert(RANGE, range.clone());
        }

        match ctx.vfs.native_open(&path, &headers).await {
            Ok(resp) if resp.status.is_success() => {
                let status = resp.status;
                return Ok(super::serve_file(req, &path, resp, status));
            }
            Ok(_) | Err(PagesError::NotFound) => {}
            Err(e) => return Err(e),
        }

        // `<path>/index.html` exists: redirect the directory URL to its
        // slash-terminated form so relative links resolve.
        let index = format!("{}/index.html", path.trim_end_matches('/'));
        match ctx.vfs.exists(&index).await {
            Ok(true) => {
                let mut location = format!("{}/", req.uri.path().trim_end_matches('/'));
                if let Some(query) = req.uri.query() {
                    location.push('?');
                    location.push_str(query);
                }
                debug!(path = %path, location = %location, "directory redirect");
                return http::Response::builder()
                    .status(StatusCode::FOUND)
                    .header(LOCATION, location)
                    .body(body::empty())
                    .map_err(|e| PagesError::Filter(e.to_string()));
            }
            Ok(false) => {}
            Err(e) => return Err(e),
        }

        next.run(ctx, req).await
    }
}

pub fn global(_config: &Params) -> Result<FilterInstance> {
    Ok(Arc::new(|params: &Params| {
        let opts: DirectParams = params.parse()?;
        Ok(Arc::new(DirectFilter {
            prefix: opts.prefix,
        }) as Arc<dyn FilterCall>)
    }))
}
