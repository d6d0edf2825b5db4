//! Fallthrough handlers: `failback` and `default_not_found`
//!
//! Both run the inner chain first and only act when it comes back with
//! NotFound. `failback` substitutes a configured file with a 200;
//! `default_not_found` serves the site's `/404.html` with status 404 and
//! propagates NotFound when the site has none.

use crate::error::{PagesError, Result};
use crate::filter::{FilterCall, FilterContext, FilterInstance, Next, PageRequest, PageResponse, Params};
use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct FailbackParams {
    path: String,
}

struct FailbackFilter {
    path: String,
}

#[async_trait]
impl FilterCall for FailbackFilter {
    async fn call(
        &self,
        ctx: &FilterContext,
        req: &mut PageRequest,
        next: Next<'_>,
    ) -> Result<PageResponse> {
        match next.run(ctx, req).await {
            Err(PagesError::NotFound) => {
                let resp = ctx.vfs.open(&self.path).await?;
                Ok(super::serve_file(req, &self.path, resp, StatusCode::OK))
            }
            other => other,
        }
    }
}

pub fn global(_config: &Params) -> Result<FilterInstance> {
    Ok(Arc::new(|params: &Params| {
        let opts: FailbackParams = params.parse()?;
        if opts.path.is_empty() {
            return Err(PagesError::validation("failback: path is empty"));
        }
        Ok(Arc::new(FailbackFilter {
            path: opts.path.trim_start_matches('/').to_string(),
        }) as Arc<dyn FilterCall>)
    }))
}

struct DefaultNotFoundFilter;

#[async_trait]
impl FilterCall for DefaultNotFoundFilter {
    async fn call(
        &self,
        ctx: &FilterContext,
        req: &mut PageRequest,
        next: Next<'_>,
    ) -> Result<PageResponse> {
        match next.run(ctx, req).await {
            Err(PagesError::NotFound) => match ctx.vfs.open("404.html").await {
                Ok(resp) => Ok(super::serve_file(req, "404.html", resp, StatusCode::NOT_FOUND)),
                // No custom page: keep the original NotFound.
                Err(_) => Err(PagesError::NotFound),
            },
            other => other,
        }
    }
}

pub fn default_not_found(_config: &Params) -> Result<FilterInstance> {
    Ok(Arc::new(|_params: &Params| {
        Ok(Arc::new(DefaultNotFoundFilter) as Arc<dyn FilterCall>)
    }))
}
