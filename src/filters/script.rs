//! Script filter: hand a site-committed script to the embedded runtime
//!
//! The runtime itself lives behind [`ScriptEngine`] and is supplied by the
//! host application; the filter's job is to load the script source from the
//! site at the configured `exec` path, enforce the execution deadline and
//! propagate request cancellation. When no engine is installed the type is
//! simply absent from the registry.

use crate::error::{PagesError, Result};
use crate::filter::{FilterCall, FilterContext, FilterInstance, Next, PageRequest, PageResponse, Params};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Embedded script runtime, e.g. a JavaScript engine.
///
/// The engine receives the full filter context: script APIs for the per-site
/// KV namespaces (`kv.org` / `kv.repo`), local storage, events and outbound
/// fetch are built from `ctx` by the engine implementation. Long-running
/// handles taken out by a script must be registered on
/// `ctx.defer_close` so the request tears them down.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    async fn execute(
        &self,
        ctx: &FilterContext,
        req: &mut PageRequest,
        source: &str,
        debug: bool,
    ) -> Result<PageResponse>;
}

#[derive(Debug, Deserialize)]
struct ScriptParams {
    exec: String,
    #[serde(default)]
    debug: bool,
}

struct ScriptFilter {
    engine: Arc<dyn ScriptEngine>,
    timeout: Duration,
    exec: String,
    debug: bool,
}

#[async_trait]
impl FilterCall for ScriptFilter {
    async fn call(
        &self,
        ctx: &FilterContext,
        req: &mut PageRequest,
        _next: Next<'_>,
    ) -> Result<PageResponse> {
        let source = ctx.vfs.read_string(&self.exec).await?;
        debug!(exec = %self.exec, bytes = source.len(), "running site script");

        let run = self.engine.execute(ctx, req, &source, self.debug);
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(PagesError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, run) => {
                outcome.map_err(|_| {
                    PagesError::Timeout(format!(
                        "script {} exceeded {}s",
                        self.exec,
                        self.timeout.as_secs()
                    ))
                })?
            }
        }
    }
}

/// Factory for the script filter, bound to the installed engine.
pub fn instance(engine: Arc<dyn ScriptEngine>, timeout: Duration) -> FilterInstance {
    Arc::new(move |params: &Params| {
        let opts: ScriptParams = params.parse()?;
        if opts.exec.is_empty() {
            return Err(PagesError::validation("script: exec is empty"));
        }
        Ok(Arc::new(ScriptFilter {
            engine: engine.clone(),
            timeout,
            exec: opts.exec.trim_start_matches('/').to_string(),
            debug: opts.debug,
        }) as Arc<dyn FilterCall>)
    })
}
