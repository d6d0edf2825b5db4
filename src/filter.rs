//! Filter model: glob-routed, ordered, composable request middleware
//!
//! A site's compiled metadata carries a list of [`Filter`] declarations in
//! call order (outermost first). Per request the server keeps the declarations
//! whose glob matches the normalized path, instantiates each through the
//! factory table and folds them into a chain: the continuation past the last
//! filter always answers NotFound.

use crate::error::{PagesError, Result};
use crate::kv::Kv;
use crate::resolver::SiteContext;
use crate::subscribe::Subscriber;
use crate::vfs::PageVfs;
use async_trait::async_trait;
use http::{HeaderMap, Method, Uri};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Opaque filter parameters as declared in `.pages.yaml`.
///
/// The engine never interprets these; each filter type re-parses the map into
/// its own shape via a JSON round-trip, so shape errors surface at factory
/// time rather than per request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Params(pub serde_json::Map<String, serde_json::Value>);

impl Params {
    pub fn new() -> Self {
        Params::default()
    }

    /// Re-parse into a concrete parameter struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.0.clone()))
            .map_err(|e| PagesError::validation(format!("invalid filter params: {}", e)))
    }

    /// Convert a YAML mapping (one route's filter body) into params.
    pub fn from_yaml(value: serde_yaml::Value) -> Result<Params> {
        let json = serde_json::to_value(value)
            .map_err(|e| PagesError::validation(format!("invalid filter params: {}", e)))?;
        match json {
            serde_json::Value::Object(map) => Ok(Params(map)),
            serde_json::Value::Null => Ok(Params::new()),
            other => Err(PagesError::validation(format!(
                "filter params must be a mapping, got {}",
                other
            ))),
        }
    }

    /// Build params from a JSON value (used for synthesized filters).
    pub fn from_json(value: serde_json::Value) -> Params {
        match value {
            serde_json::Value::Object(map) => Params(map),
            _ => Params::new(),
        }
    }
}

/// One declared filter: a glob over the normalized request path, a type name
/// and type-specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Params,
}

impl Filter {
    pub fn new(path: &str, kind: &str, params: Params) -> Self {
        Filter {
            path: path.to_string(),
            kind: kind.to_string(),
            params,
        }
    }
}

/// The request as seen by filters. Bodies are taken (not borrowed) so a
/// proxying filter can forward them.
pub struct PageRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub body: Option<crate::body::Body>,
}

impl PageRequest {
    /// Request host, preferring the `Host` header over the URI authority.
    pub fn host(&self) -> Option<String> {
        self.headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| self.uri.host().map(str::to_string))
    }

    pub fn header(&self, name: http::header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub type PageResponse = http::Response<crate::body::Body>;

/// One middleware stage. Implementations either short-circuit with a response
/// or delegate inward via `next` (possibly post-processing its outcome).
#[async_trait]
pub trait FilterCall: Send + Sync {
    async fn call(
        &self,
        ctx: &FilterContext,
        req: &mut PageRequest,
        next: Next<'_>,
    ) -> Result<PageResponse>;
}

/// The bound continuation handed to a filter. Running it invokes the rest of
/// the chain; past the last filter it returns NotFound.
pub struct Next<'a> {
    chain: &'a [Arc<dyn FilterCall>],
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn FilterCall>]) -> Self {
        Next { chain }
    }

    pub async fn run(self, ctx: &FilterContext, req: &mut PageRequest) -> Result<PageResponse> {
        match self.chain.split_first() {
            Some((head, rest)) => head.call(ctx, req, Next { chain: rest }).await,
            None => Err(PagesError::NotFound),
        }
    }
}

type Closer = Box<dyn FnOnce() + Send>;

/// Everything a filter may touch during one request. Created once per request
/// and passed by reference down the chain.
pub struct FilterContext {
    /// The resolved site, with `path` already normalized.
    pub site: SiteContext,
    /// Cancelled when the client goes away; all downstream I/O must honor it.
    pub cancel: CancellationToken,
    /// Virtual filesystem pinned to the resolved commit.
    pub vfs: Arc<PageVfs>,
    /// KV namespace shared by every site of the owner (`org/<owner>`).
    pub org_db: Arc<dyn Kv>,
    /// KV namespace private to the site (`repo/<owner>/<repo>`).
    pub repo_db: Arc<dyn Kv>,
    /// Short-lived scratch space for filters.
    pub scratch: Arc<dyn Kv>,
    /// Pub/sub handle scoped to the site.
    pub events: Arc<dyn Subscriber>,
    /// Public scheme of the gateway ("http" or "https").
    pub scheme: String,
    closers: Mutex<Vec<Closer>>,
}

impl FilterContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        site: SiteContext,
        cancel: CancellationToken,
        vfs: Arc<PageVfs>,
        org_db: Arc<dyn Kv>,
        repo_db: Arc<dyn Kv>,
        scratch: Arc<dyn Kv>,
        events: Arc<dyn Subscriber>,
        scheme: String,
    ) -> Self {
        FilterContext {
            site,
            cancel,
            vfs,
            org_db,
            repo_db,
            scratch,
            events,
            scheme,
            closers: Mutex::new(Vec::new()),
        }
    }

    /// Register cleanup to run when the request completes, e.g. dropping an
    /// event subscription taken out by a script.
    pub fn defer_close(&self, closer: Closer) {
        self.closers.lock().unwrap().push(closer);
    }

    /// Run and drain the deferred closers. Called by the server after the
    /// chain returns.
    pub fn run_closers(&self) {
        let closers: Vec<Closer> = std::mem::take(&mut *self.closers.lock().unwrap());
        for closer in closers {
            closer();
        }
    }
}

/// Factory producing one `FilterCall` per declared occurrence of a type.
pub type FilterInstance = Arc<dyn Fn(&Params) -> Result<Arc<dyn FilterCall>> + Send + Sync>;

/// Table of filter factories, built once at startup from the built-in library
/// plus per-type global parameters out of the server configuration.
pub struct FilterRegistry {
    table: HashMap<String, FilterInstance>,
}

impl FilterRegistry {
    pub fn empty() -> Self {
        FilterRegistry {
            table: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: &str, instance: FilterInstance) {
        self.table.insert(kind.to_string(), instance);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.table.contains_key(kind)
    }

    /// Instantiate a filter occurrence. Unknown types and parameter shape
    /// errors are Validation errors surfaced as HTTP 500.
    pub fn instantiate(&self, kind: &str, params: &Params) -> Result<Arc<dyn FilterCall>> {
        let factory = self
            .table
            .get(kind)
            .ok_or_else(|| PagesError::validation(format!("filter not found: {}", kind)))?;
        factory(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_round_trip() {
        #[derive(Deserialize)]
        struct Shape {
            code: u16,
            #[serde(default)]
            message: Option<String>,
        }

        let params = Params::from_json(serde_json::json!({"code": 403}));
        let shape: Shape = params.parse().unwrap();
        assert_eq!(shape.code, 403);
        assert!(shape.message.is_none());
    }

    #[test]
    fn test_params_shape_error() {
        #[derive(Deserialize)]
        struct Shape {
            #[allow(dead_code)]
            code: u16,
        }

        let params = Params::from_json(serde_json::json!({"code": "not a number"}));
        assert!(params.parse::<Shape>().is_err());
    }

    #[test]
    fn test_params_from_yaml() {
        let value: serde_yaml::Value = serde_yaml::from_str("targets: [a.com]\ncode: 301").unwrap();
        let params = Params::from_yaml(value).unwrap();
        assert_eq!(params.0["code"], 301);

        let empty: serde_yaml::Value = serde_yaml::from_str("null").unwrap();
        assert!(Params::from_yaml(empty).unwrap().0.is_empty());

        let list: serde_yaml::Value = serde_yaml::from_str("[1, 2]").unwrap();
        assert!(Params::from_yaml(list).is_err());
    }

    #[test]
    fn test_unknown_filter_type() {
        let registry = FilterRegistry::empty();
        match registry.instantiate("nope", &Params::new()) {
            Err(err) => assert_eq!(err.to_string(), "filter not found: nope"),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_filter_serialization() {
        let filter = Filter::new("**", "block", Params::from_json(serde_json::json!({"code": 403})));
        let json = serde_json::to_string(&filter).unwrap();
        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(back.path, "**");
        assert_eq!(back.kind, "block");
        assert_eq!(back.params.0["code"], 403);
    }
}
