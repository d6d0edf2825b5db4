//! Redirect filter: send foreign hosts to the site's canonical alias
//!
//! Synthesized as the outermost filter for any site that declares aliases.
//! When the request host is already one of the site's aliases the filter
//! delegates; otherwise it answers with a 30x pointing at the first target,
//! preserving the query string and dropping a trailing `index.html`.

use crate::body;
use crate::error::{PagesError, Result};
use crate::filter::{FilterCall, FilterContext, FilterInstance, Next, PageRequest, PageResponse, Params};
use crate::resolver::normalize_host;
use async_trait::async_trait;
use http::header::LOCATION;
use http::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize, Default)]
struct RedirectGlobals {
    /// Overrides the gateway-wide public scheme for redirect targets
    #[serde(default)]
    scheme: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RedirectParams {
    targets: Vec<String>,
    #[serde(default)]
    code: Option<u16>,
}

struct RedirectFilter {
    targets: Vec<String>,
    code: StatusCode,
    scheme: Option<String>,
}

#[async_trait]
impl FilterCall for RedirectFilter {
    async fn call(
        &self,
        ctx: &FilterContext,
        req: &mut PageRequest,
        next: Next<'_>,
    ) -> Result<PageResponse> {
        let host = req.host().map(|h| normalize_host(&h)).unwrap_or_default();
        if ctx.site.meta.alias.contains(&host) {
            return next.run(ctx, req).await;
        }

        let mut path = ctx.site.path.as_str();
        if path == "index.html" {
            path = "";
        } else if let Some(stripped) = path.strip_suffix("/index.html") {
            // Keep the trailing slash of the directory URL.
            path = &ctx.site.path[..stripped.len() + 1];
        }
        let scheme = self.scheme.as_deref().unwrap_or(&ctx.scheme);
        let mut location = format!("{}://{}/{}", scheme, self.targets[0], path);
        if let Some(query) = req.uri.query() {
            location.push('?');
            location.push_str(query);
        }
        debug!(from = %host, to = %location, "alias redirect");

        http::Response::builder()
            .status(self.code)
            .header(LOCATION, location.as_str())
            .body(body::empty())
            .map_err(|e| PagesError::Filter(format!("redirect to {}: {}", location, e)))
    }
}

pub fn global(config: &Params) -> Result<FilterInstance> {
    let globals: RedirectGlobals = config.parse()?;
    if let Some(scheme) = &globals.scheme {
        if scheme != "http" && scheme != "https" {
            return Err(PagesError::validation(format!(
                "redirect: invalid scheme {:?}",
                scheme
            )));
        }
    }
    Ok(Arc::new(move |params: &Params| {
        let opts: RedirectParams = params.parse()?;
        if opts.targets.is_empty() {
            return Err(PagesError::validation("redirect: no targets"));
        }
        let code = opts.code.unwrap_or(302);
        if !(300..=399).contains(&code) {
            return Err(PagesError::validation(format!(
                "redirect: invalid code {}",
                code
            )));
        }
        let code = StatusCode::from_u16(code)
            .map_err(|_| PagesError::validation(format!("redirect: invalid code {}", code)))?;
        Ok(Arc::new(RedirectFilter {
            targets: opts.targets,
            code,
            scheme: globals.scheme.clone(),
        }) as Arc<dyn FilterCall>)
    }))
}
