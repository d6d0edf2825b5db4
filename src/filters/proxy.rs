//! Reverse proxy filter
//!
//! Strips a prefix off the site path, rewrites the URL onto the configured
//! target and forwards the request, tagging it with the standard forwarded
//! headers (`X-Real-IP`, `X-Page-IP`, `X-Page-Refer`, `X-Page-Host`). The
//! origin's response streams back to the client.

use crate::body;
use crate::error::{PagesError, Result};
use crate::filter::{FilterCall, FilterContext, FilterInstance, Next, PageRequest, PageResponse, Params};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use http::header::{HeaderName, HOST};
use http_body_util::BodyStream;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Deserialize)]
struct ProxyParams {
    #[serde(default)]
    prefix: String,
    target: String,
}

struct ProxyFilter {
    client: reqwest::Client,
    prefix: String,
    target: reqwest::Url,
}

/// Best client address: CDN header first, then the forwarding chain, then
/// the socket peer.
fn page_ip(req: &PageRequest) -> String {
    if let Some(ip) = req.header(HeaderName::from_static("cf-connecting-ip")) {
        return ip.to_string();
    }
    if let Some(forwarded) = req.header(HeaderName::from_static("x-forwarded-for")) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(ip) = req.header(HeaderName::from_static("x-real-ip")) {
        return ip.to_string();
    }
    req.remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl FilterCall for ProxyFilter {
    async fn call(
        &self,
        ctx: &FilterContext,
        req: &mut PageRequest,
        _next: Next<'_>,
    ) -> Result<PageResponse> {
        let request_path = format!("/{}", ctx.site.path);
        let stripped = request_path
            .strip_prefix(&self.prefix)
            .unwrap_or(&request_path);
        let target_path = if stripped.starts_with('/') {
            stripped.to_string()
        } else {
            format!("/{}", stripped)
        };

        let mut url = self.target.clone();
        url.set_path(&target_path);
        url.set_query(req.uri.query());
        debug!(prefix = %self.prefix, target = %url, "reverse proxy");

        let mut upstream = self
            .client
            .request(req.method.clone(), url)
            .headers(strip_hop_by_hop(&req.headers));
        if let Some(addr) = req.remote_addr {
            upstream = upstream.header("X-Real-IP", addr.ip().to_string());
        }
        upstream = upstream
            .header("X-Page-IP", page_ip(req))
            .header(
                "X-Page-Refer",
                format!("{}/{}/{}", ctx.site.owner, ctx.site.repo, ctx.site.path),
            )
            .header("X-Page-Host", req.host().unwrap_or_default());
        if let Some(inbound) = req.body.take() {
            let stream = BodyStream::new(inbound).try_filter_map(|frame| async move {
                Ok(frame.into_data().ok())
            });
            upstream = upstream.body(reqwest::Body::wrap_stream(stream));
        }

        let resp = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(PagesError::Cancelled),
            resp = upstream.send() => resp?,
        };

        let mut builder = http::Response::builder().status(resp.status());
        for (name, value) in resp.headers() {
            if !HOP_BY_HOP.contains(&name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        builder
            .body(body::from_reqwest(resp))
            .map_err(|e| PagesError::Filter(format!("proxy response: {}", e)))
    }
}

fn strip_hop_by_hop(headers: &http::HeaderMap) -> http::HeaderMap {
    let mut out = http::HeaderMap::new();
    for (name, value) in headers {
        if name == HOST || HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.append(name, value.clone());
    }
    out
}

pub fn global(_config: &Params) -> Result<FilterInstance> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| PagesError::Config(format!("reverse_proxy: http client: {}", e)))?;

    Ok(Arc::new(move |params: &Params| {
        let opts: ProxyParams = params.parse()?;
        let target = reqwest::Url::parse(&opts.target)
            .map_err(|e| PagesError::validation(format!("reverse_proxy: invalid target: {}", e)))?;
        if target.scheme() != "http" && target.scheme() != "https" {
            return Err(PagesError::validation(format!(
                "reverse_proxy: invalid target scheme: {}",
                target.scheme()
            )));
        }
        let mut prefix = opts.prefix;
        if !prefix.is_empty() && !prefix.starts_with('/') {
            prefix = format!("/{}", prefix);
        }
        let prefix = prefix.trim_end_matches('/').to_string();
        Ok(Arc::new(ProxyFilter {
            client: client.clone(),
            prefix,
            target,
        }) as Arc<dyn FilterCall>)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_scheme_validation() {
        let instance = global(&Params::new()).unwrap();
        let ok = serde_json::json!({"target": "http://127.0.0.1:9000"});
        assert!(instance(&Params::from_json(ok)).is_ok());
        let bad = serde_json::json!({"target": "ftp://files.example.com"});
        assert!(instance(&Params::from_json(bad)).is_err());
        let missing = serde_json::json!({});
        assert!(instance(&Params::from_json(missing)).is_err());
    }
}
