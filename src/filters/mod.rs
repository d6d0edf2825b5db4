//! Built-in filter library
//!
//! Each submodule contributes one filter type. A type is constructed once at
//! startup with its global parameters and then instantiated per declared
//! route occurrence.

use crate::backend::FileResponse;
use crate::body;
use crate::error::Result;
use crate::filter::{FilterRegistry, PageRequest, PageResponse, Params};
use chrono::{DateTime, TimeZone, Utc};
use http::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED,
};
use http::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod block;
pub mod direct;
pub mod failback;
pub mod proxy;
pub mod redirect;
pub mod script;
pub mod template;

pub use script::ScriptEngine;

/// Build the default registry: every built-in type, constructed with its
/// global parameters from the server configuration. The script filter is
/// registered only when an engine is supplied.
pub fn defaults(
    globals: &HashMap<String, Params>,
    script_engine: Option<(Arc<dyn ScriptEngine>, Duration)>,
) -> Result<FilterRegistry> {
    let empty = Params::new();
    let global = |kind: &str| globals.get(kind).unwrap_or(&empty);

    let mut registry = FilterRegistry::empty();
    registry.register("block", block::global(global("block"))?);
    registry.register("redirect", redirect::global(global("redirect"))?);
    registry.register("direct", direct::global(global("direct"))?);
    registry.register("failback", failback::global(global("failback"))?);
    registry.register(
        "default_not_found",
        failback::default_not_found(global("default_not_found"))?,
    );
    registry.register("reverse_proxy", proxy::global(global("reverse_proxy"))?);
    registry.register("template", template::global(global("template"))?);
    if let Some((engine, timeout)) = script_engine {
        registry.register("script", script::instance(engine, timeout));
    }
    Ok(registry)
}

/// Join an optional prefix onto a site-relative path.
pub(crate) fn join_prefix(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let path = path.trim_start_matches('/');
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

pub(crate) fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Content type by path extension, matching the charset convention of
/// `mime.TypeByExtension`-style servers for text types.
pub(crate) fn content_type_for(path: &str) -> Option<String> {
    let guessed = mime_guess::from_path(path).first_raw()?;
    if guessed.starts_with("text/") {
        Some(format!("{}; charset=utf-8", guessed))
    } else {
        Some(guessed.to_string())
    }
}

/// Turn an opened file into the client response: content type by extension,
/// passthrough of the blob headers, `If-Modified-Since` handling and empty
/// bodies for HEAD.
pub(crate) fn serve_file(
    req: &PageRequest,
    path: &str,
    resp: FileResponse,
    status: StatusCode,
) -> PageResponse {
    let mut builder = http::Response::builder().status(status);

    let content_type = content_type_for(path)
        .or_else(|| resp.header(CONTENT_TYPE).map(str::to_string))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    builder = builder.header(CONTENT_TYPE, content_type);

    for name in [CONTENT_LENGTH, LAST_MODIFIED, CONTENT_RANGE, ACCEPT_RANGES] {
        if let Some(value) = resp.headers.get(&name) {
            builder = builder.header(name, value);
        }
    }

    if status == StatusCode::OK {
        let modified = resp.header(LAST_MODIFIED).and_then(parse_http_date);
        let since = req.header(IF_MODIFIED_SINCE).and_then(parse_http_date);
        if let (Some(modified), Some(since)) = (modified, since) {
            if modified <= since {
                return builder
                    .status(StatusCode::NOT_MODIFIED)
                    .body(body::empty())
                    .unwrap_or_else(|_| not_modified_fallback());
            }
        }
    }

    let payload = if req.method == Method::HEAD {
        body::empty()
    } else {
        resp.body
    };
    builder
        .body(payload)
        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
}

fn not_modified_fallback() -> PageResponse {
    let mut resp = http::Response::new(body::empty());
    *resp.status_mut() = StatusCode::NOT_MODIFIED;
    resp
}

/// A small plain-text response.
pub(crate) fn plain_response(status: StatusCode, message: &str) -> PageResponse {
    http::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body::full(message.to_string()))
        .unwrap_or_else(|_| {
            let mut resp = http::Response::new(body::empty());
            *resp.status_mut() = status;
            resp
        })
}
