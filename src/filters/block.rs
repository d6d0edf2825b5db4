//! Block filter: answer with a fixed status, never delegate
//!
//! Params: `code` (default 403) and `message` (default: the canonical reason
//! phrase). Also synthesized by the meta engine to fence off `.git/**` and
//! `.pages.yaml`.

use crate::error::{PagesError, Result};
use crate::filter::{FilterCall, FilterContext, FilterInstance, Next, PageRequest, PageResponse, Params};
use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize, Default)]
struct BlockParams {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

struct BlockFilter {
    code: StatusCode,
    message: String,
}

#[async_trait]
impl FilterCall for BlockFilter {
    async fn call(
        &self,
        _ctx: &FilterContext,
        _req: &mut PageRequest,
        _next: Next<'_>,
    ) -> Result<PageResponse> {
        Ok(super::plain_response(self.code, &self.message))
    }
}

pub fn global(_config: &Params) -> Result<FilterInstance> {
    Ok(Arc::new(|params: &Params| {
        let opts: BlockParams = params.parse()?;
        let code = StatusCode::from_u16(opts.code.unwrap_or(403))
            .map_err(|_| PagesError::validation(format!("block: invalid code {:?}", opts.code)))?;
        let message = opts.message.unwrap_or_else(|| {
            code.canonical_reason().unwrap_or("blocked").to_string()
        });
        Ok(Arc::new(BlockFilter { code, message }) as Arc<dyn FilterCall>)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let instance = global(&Params::new()).unwrap();
        assert!(instance(&Params::new()).is_ok());
    }

    #[test]
    fn test_invalid_code_rejected() {
        let instance = global(&Params::new()).unwrap();
        let params = Params::from_json(serde_json::json!({"code": 99}));
        assert!(instance(&params).is_err());
    }
}
