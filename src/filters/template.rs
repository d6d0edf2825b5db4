//! Template filter: expand a site file as a text template
//!
//! The file at `<prefix>/<path>` is rendered with the request and site
//! metadata injected as `Request` / `Meta`, plus a `load(path)` helper that
//! returns another site file as a string. Rendering runs on a blocking
//! thread because the engine is synchronous while `load` has to reach back
//! into the async virtual filesystem.

use crate::body;
use crate::error::{PagesError, Result};
use crate::filter::{FilterCall, FilterContext, FilterInstance, Next, PageRequest, PageResponse, Params};
use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Deserialize, Default)]
struct TemplateParams {
    #[serde(default)]
    prefix: String,
}

struct TemplateFilter {
    prefix: String,
}

fn query_map(req: &PageRequest) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(query) = req.uri.query() {
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if !key.is_empty() {
                map.insert(key.to_string(), value.to_string());
            }
        }
    }
    map
}

#[async_trait]
impl FilterCall for TemplateFilter {
    async fn call(
        &self,
        ctx: &FilterContext,
        req: &mut PageRequest,
        _next: Next<'_>,
    ) -> Result<PageResponse> {
        let path = super::join_prefix(&self.prefix, &ctx.site.path);
        let source = ctx.vfs.read_string(&path).await?;

        let data = serde_json::json!({
            "Request": {
                "Host": req.host().unwrap_or_default(),
                "Path": req.uri.path(),
                "Method": req.method.as_str(),
                "Params": query_map(req),
                "RemoteIP": req.remote_addr.map(|a| a.ip().to_string()).unwrap_or_default(),
            },
            "Meta": {
                "Org": ctx.site.owner,
                "Repo": ctx.site.repo,
                "Commit": ctx.site.meta.commit_id,
            },
        });

        let vfs = ctx.vfs.clone();
        let prefix = self.prefix.clone();
        let handle = tokio::runtime::Handle::current();
        let rendered = tokio::task::spawn_blocking(move || {
            let mut env = minijinja::Environment::new();
            env.add_function("load", move |load_path: String| {
                handle
                    .block_on(vfs.read_string(&super::join_prefix(&prefix, &load_path)))
                    .map_err(|e| {
                        minijinja::Error::new(
                            minijinja::ErrorKind::InvalidOperation,
                            format!("load {}: {}", load_path, e),
                        )
                    })
            });
            env.render_str(&source, data)
        })
        .await
        .map_err(|e| PagesError::Filter(format!("template task: {}", e)))?
        .map_err(|e| PagesError::Filter(format!("render {}: {}", path, e)))?;

        let content_type = super::content_type_for(&path)
            .unwrap_or_else(|| "text/html; charset=utf-8".to_string());
        http::Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type)
            .body(body::full(rendered))
            .map_err(|e| PagesError::Filter(e.to_string()))
    }
}

pub fn global(_config: &Params) -> Result<FilterInstance> {
    Ok(Arc::new(|params: &Params| {
        let opts: TemplateParams = params.parse()?;
        Ok(Arc::new(TemplateFilter {
            prefix: opts.prefix,
        }) as Arc<dyn FilterCall>)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_map() {
        let req = PageRequest {
            method: http::Method::GET,
            uri: "https://a.example.com/x?a=1&b=two&flag".parse().unwrap(),
            headers: http::HeaderMap::new(),
            remote_addr: None,
            body: None,
        };
        let map = query_map(&req);
        assert_eq!(map.get("a").unwrap(), "1");
        assert_eq!(map.get("b").unwrap(), "two");
        assert_eq!(map.get("flag").unwrap(), "");
    }
}
